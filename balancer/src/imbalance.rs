use serde::Serialize;
use std::{collections::BTreeMap, time::Duration};

use dirtree::Rank;
use tracing::{debug, trace};

use crate::{
    cluster::ClusterLoadSnapshot, config::BalancerConfig, error::BalancerError,
    message::MigrationDecision,
};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RankImbalance {
    pub rank: Rank,
    pub iops: f64,
    pub if_value: f64,
    pub is_bigger: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ImbalanceReport {
    pub avg: f64,
    pub max: f64,
    pub stddev: f64,
    pub imbalance: f64,
    pub urgency: f64,
    pub factor: f64,
    pub per_rank: Vec<RankImbalance>,
    /// Exporter -> transfers it should make. Empty below the threshold.
    pub decisions: BTreeMap<Rank, Vec<MigrationDecision>>,
}

/// Scores how uneven the iops of the ranks are and, past the threshold, cuts a
/// shrinking cascade of transfers from each busy rank to the idle ones.
#[derive(Clone, Debug)]
pub struct ImbalanceEvaluator {
    threshold: f64,
    preset_max: f64,
    max_exporter_count: usize,
    seed: f64,
}

impl ImbalanceEvaluator {
    pub fn new(config: &BalancerConfig) -> Self {
        Self {
            threshold: config.if_threshold,
            preset_max: config.preset_max,
            max_exporter_count: config.max_exporter_count,
            seed: config.migration_seed,
        }
    }
    pub fn threshold(&self) -> f64 {
        self.threshold
    }
    /// Close to 0 while `iops` is far below the preset ceiling, close to 1 past it.
    pub fn urgency(&self, iops: f64) -> f64 {
        1.0 / (1.0 + (5.0 - 10.0 * iops / self.preset_max).exp())
    }

    pub fn evaluate(
        &self,
        iops: &BTreeMap<Rank, f64>,
        loads: &BTreeMap<Rank, f64>,
    ) -> Result<ImbalanceReport, BalancerError> {
        let n = iops.len();
        if n == 0 {
            return Ok(ImbalanceReport::default());
        }
        let count = n as f64;
        let avg = iops.values().sum::<f64>() / count;
        let mut max_pos = None;
        let mut min_pos = None;
        for (rank, value) in iops {
            if max_pos.is_none_or(|(_, max)| *value > max) {
                max_pos = Some((*rank, *value));
            }
            if min_pos.is_none_or(|(_, min)| *value < min) {
                min_pos = Some((*rank, *value));
            }
        }
        let (max_rank, max) = max_pos.unwrap_or_default();
        let (min_rank, _) = min_pos.unwrap_or_default();
        let stddev = (iops.values().map(|x| (x - avg).powi(2)).sum::<f64>() / count).sqrt();
        let scale = count.sqrt() * avg;
        let imbalance = if scale == 0.0 { 0.0 } else { stddev / scale };
        let urgency = self.urgency(max);
        let factor = imbalance * urgency;
        let per_rank: Vec<RankImbalance> = iops
            .iter()
            .map(|(rank, x)| RankImbalance {
                rank: *rank,
                iops: *x,
                if_value: if n > 1 && scale > 0.0 {
                    ((x - avg).powi(2) / (count - 1.0)).sqrt() / scale
                } else {
                    0.0
                },
                is_bigger: *x > avg,
            })
            .collect();
        let mut report = ImbalanceReport {
            avg,
            max,
            stddev,
            imbalance,
            urgency,
            factor,
            per_rank,
            decisions: BTreeMap::new(),
        };
        if factor < self.threshold {
            debug!(factor, imbalance, urgency, "Imbalance factor is low");
            return Ok(report);
        }
        debug!(factor, imbalance, urgency, "Imbalance factor is high enough");

        let rank_threshold = self.threshold / n.min(self.max_exporter_count) as f64;
        let mut importers: Vec<&RankImbalance> = report.per_rank.iter().collect();
        importers.sort_by(|a, b| b.if_value.total_cmp(&a.if_value));
        for exporter in report
            .per_rank
            .iter()
            .filter(|r| r.is_bigger && (r.rank == max_rank || r.if_value > rank_threshold))
        {
            let mut seed = self.seed;
            let mut decisions = Vec::new();
            for importer in importers.iter().filter(|im| {
                im.rank != exporter.rank
                    && !im.is_bigger
                    && (im.if_value >= rank_threshold || im.rank == min_rank)
            }) {
                if decisions.len() >= self.max_exporter_count {
                    break;
                }
                if exporter.iops <= 1.0 {
                    return Err(BalancerError::NonPositiveLoad {
                        rank: exporter.rank,
                        load: exporter.iops,
                    });
                }
                let export_percent = seed * (exporter.iops - importer.iops) / exporter.iops;
                let export_load =
                    export_percent * loads.get(&exporter.rank).copied().unwrap_or_default();
                trace!(
                    exporter = exporter.rank,
                    importer = importer.rank,
                    export_percent,
                    export_load,
                    "Decision"
                );
                decisions.push(MigrationDecision {
                    target: importer.rank,
                    export_load,
                    export_percent,
                });
                seed /= 2.0;
                if seed <= rank_threshold {
                    break;
                }
            }
            if !decisions.is_empty() {
                report.decisions.insert(exporter.rank, decisions);
            }
        }
        Ok(report)
    }
}

/// Turns cumulative request counts into per epoch iops.
#[derive(Clone, Debug, Default)]
pub struct IopsTracker {
    previous: BTreeMap<Rank, u64>,
}

impl IopsTracker {
    /// A rank seen for the first time reports 0.
    pub fn observe(
        &mut self,
        reports: &BTreeMap<Rank, ClusterLoadSnapshot>,
        interval: Duration,
    ) -> BTreeMap<Rank, f64> {
        let secs = interval.as_secs_f64().max(1.0);
        reports
            .iter()
            .map(|(rank, load)| {
                let iops = match self.previous.insert(*rank, load.request_count) {
                    Some(old) => load.request_count.saturating_sub(old) as f64 / secs,
                    None => 0.0,
                };
                (*rank, iops)
            })
            .collect()
    }
    pub fn forget(&mut self, rank: Rank) {
        self.previous.remove(&rank);
    }
}
