use std::{collections::BTreeMap, time::Duration};

use dirtree::Rank;
use tracing::{info, instrument, warn};

use super::{PlanInput, PlanTrigger, RebalancePlan, RebalancePlanner};
use crate::{
    config::BalancerConfig,
    imbalance::{ImbalanceEvaluator, IopsTracker},
};

/// Runs on rank 0 once every rank's ifbeat report arrived.
pub struct ImbalanceFactorPlanner {
    evaluator: ImbalanceEvaluator,
    iops: IopsTracker,
    interval: Duration,
}

impl ImbalanceFactorPlanner {
    pub fn new(config: &BalancerConfig) -> Self {
        Self {
            evaluator: ImbalanceEvaluator::new(config),
            iops: IopsTracker::default(),
            interval: config.interval(),
        }
    }
}

impl RebalancePlanner for ImbalanceFactorPlanner {
    fn name(&self) -> &'static str {
        "imbalance_factor"
    }
    fn trigger(&self) -> PlanTrigger {
        PlanTrigger::IfReportsComplete
    }

    #[instrument(name = "imbalance_factor_plan", skip(self, input), fields(epoch = input.epoch))]
    fn plan(&mut self, input: &PlanInput<'_>) -> RebalancePlan {
        let iops = self.iops.observe(input.if_reports, self.interval);
        let loads: BTreeMap<Rank, f64> = input
            .if_reports
            .iter()
            .map(|(rank, snapshot)| (*rank, snapshot.auth.meta_load()))
            .collect();
        match self.evaluator.evaluate(&iops, &loads) {
            Ok(report) if report.decisions.is_empty() => RebalancePlan::Idle,
            Ok(report) => {
                info!(
                    factor = report.factor,
                    exporters = report.decisions.len(),
                    "Imbalance factor over threshold"
                );
                RebalancePlan::Decisions {
                    factor: report.factor,
                    by_exporter: report.decisions,
                }
            }
            Err(e) => {
                warn!(error = %e, "Skipping migration decisions this epoch");
                RebalancePlan::Idle
            }
        }
    }

    fn handle_rank_failure(&mut self, rank: Rank) {
        self.iops.forget(rank);
    }
}
