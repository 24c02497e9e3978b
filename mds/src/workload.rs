use std::time::Duration;

use balancer::OpType;

use crate::config::HotPath;

/// Replays the configured hit rates, one batch per tick.
pub struct Workload {
    paths: Vec<HotPath>,
}

impl Workload {
    pub fn new(paths: Vec<HotPath>) -> Self {
        Self { paths }
    }
    /// Hits that arrived over `elapsed`, paths without traffic left out.
    pub fn batch(&self, elapsed: Duration) -> Vec<(&str, OpType, f64)> {
        let secs = elapsed.as_secs_f64();
        self.paths
            .iter()
            .map(|hot| (hot.path.as_str(), hot.op, hot.rate * secs))
            .filter(|(_, _, amount)| *amount > 0.0)
            .collect()
    }
}
