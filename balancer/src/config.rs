use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{classifier::WorkloadRule, error::BalancerError};

/// Which planner decides the migrations of an epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Every rank matches exporters to importers once all heartbeats arrived.
    #[default]
    Greedy,
    /// Rank 0 computes the imbalance factor and sends decisions to the exporters.
    ImbalanceFactor,
}

/// How a rank folds its counters into one scalar load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    #[default]
    Combined,
    Requests,
    Cpu,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub interval_secs: u64,
    /// Number of epochs rank 0 originates, unlimited when unset.
    pub max_cycles: Option<u32>,
    /// Keep originating past `max_cycles` until the rank is up this long.
    pub max_until_secs: Option<u64>,
    pub decay_half_life_secs: f64,
    pub strategy: Strategy,
    pub load_mode: LoadMode,

    // greedy matching
    pub min_rebalance: f64,
    pub hold_epochs: u64,
    pub min_offload: f64,
    pub min_reexport: f64,
    pub idle_threshold: f64,

    // export search
    pub min_start: f64,
    pub need_min: f64,
    pub need_max: f64,
    pub midchunk: f64,
    pub minchunk: f64,
    pub export_search_budget_ms: u64,
    pub hash_fragmentation: bool,

    // imbalance factor
    pub if_threshold: f64,
    pub preset_max: f64,
    pub max_exporter_count: usize,
    pub migration_seed: f64,

    // fragmentation
    pub fragment_dirs: bool,
    pub fragment_interval_ms: u64,
    pub split_size: usize,
    pub split_rd: f64,
    pub split_wr: f64,
    pub split_bits: u8,
    pub fragment_fast_factor: f64,
    pub merge_size: usize,

    /// Forecaster selected by suffix, `.trend` or `.avg`; empty disables forecasting.
    pub forecaster: String,
    pub workload_rules: Vec<WorkloadRule>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            max_cycles: None,
            max_until_secs: None,
            decay_half_life_secs: 5.0,
            strategy: Strategy::Greedy,
            load_mode: LoadMode::Combined,
            min_rebalance: 0.1,
            hold_epochs: 2,
            min_offload: 0.1,
            min_reexport: 5.0,
            idle_threshold: 0.0,
            min_start: 0.2,
            need_min: 0.8,
            need_max: 1.2,
            midchunk: 0.3,
            minchunk: 0.001,
            export_search_budget_ms: 100,
            hash_fragmentation: false,
            if_threshold: 0.1,
            preset_max: 10000.0,
            max_exporter_count: 3,
            migration_seed: 0.25,
            fragment_dirs: true,
            fragment_interval_ms: 5000,
            split_size: 10000,
            split_rd: 25000.0,
            split_wr: 10000.0,
            split_bits: 3,
            fragment_fast_factor: 1.5,
            merge_size: 50,
            forecaster: String::new(),
            workload_rules: Vec::new(),
        }
    }
}

impl BalancerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
    pub fn decay_half_life(&self) -> Duration {
        Duration::from_secs_f64(self.decay_half_life_secs)
    }
    pub fn export_search_budget(&self) -> Duration {
        Duration::from_millis(self.export_search_budget_ms)
    }
    pub fn fragment_interval(&self) -> Duration {
        Duration::from_millis(self.fragment_interval_ms)
    }

    pub fn validate(&self) -> Result<(), BalancerError> {
        let invalid = |reason: &str| Err(BalancerError::InvalidConfig(reason.to_string()));
        if !(self.decay_half_life_secs > 0.0) {
            return invalid("decay_half_life_secs must be positive");
        }
        if !(0.0 < self.need_min && self.need_min <= 1.0 && self.need_max >= 1.0) {
            return invalid("need_min must be in (0, 1] and need_max at least 1");
        }
        if !(0.0..=1.0).contains(&self.min_start) || !(0.0..=1.0).contains(&self.midchunk) {
            return invalid("min_start and midchunk are fractions of the needed load");
        }
        if !(0.0..=1.0).contains(&self.minchunk) || self.minchunk > self.midchunk {
            return invalid("minchunk must be a fraction no larger than midchunk");
        }
        if !(self.preset_max > 0.0) {
            return invalid("preset_max must be positive");
        }
        if self.max_exporter_count == 0 {
            return invalid("max_exporter_count must be at least 1");
        }
        if !(self.migration_seed > 0.0 && self.migration_seed <= 1.0) {
            return invalid("migration_seed must be in (0, 1]");
        }
        if self.hold_epochs == 0 {
            return invalid("hold_epochs must be at least 1");
        }
        if self.fragment_fast_factor < 1.0 {
            return invalid("fragment_fast_factor must be at least 1");
        }
        if self.split_bits == 0 || self.split_bits > dirtree::frag::MAX_FRAG_BITS {
            return invalid("split_bits out of range");
        }
        Ok(())
    }
}
