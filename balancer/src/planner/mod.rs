use serde::Serialize;
use std::collections::BTreeMap;

use dirtree::Rank;

use crate::{
    cluster::{ClusterLoadSnapshot, ClusterLoadTable},
    config::{BalancerConfig, LoadMode, Strategy},
    message::MigrationDecision,
};

pub mod greedy;
pub mod imbalance_factor;

pub use greedy::GreedyPlanner;
pub use imbalance_factor::ImbalanceFactorPlanner;

/// What has to be complete before a planner can run for an epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanTrigger {
    /// Every rank's heartbeat is in the load table.
    HeartbeatsComplete,
    /// Rank 0 holds an ifbeat report from every rank.
    IfReportsComplete,
}

pub struct PlanInput<'a> {
    pub whoami: Rank,
    pub epoch: u64,
    pub cluster_size: usize,
    pub load_mode: LoadMode,
    pub table: &'a ClusterLoadTable,
    pub if_reports: &'a BTreeMap<Rank, ClusterLoadSnapshot>,
}

/// Result of one matching pass, in meta load units.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BalanceState {
    /// Importer -> load this rank should send it.
    pub targets: BTreeMap<Rank, f64>,
    pub imported: BTreeMap<Rank, f64>,
    pub exported: BTreeMap<Rank, f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RebalancePlan {
    Idle,
    /// Local exports, carried out through the export search.
    Targets {
        state: BalanceState,
        target_load: f64,
    },
    /// Cluster wide decisions made by rank 0, keyed by exporter.
    Decisions {
        factor: f64,
        by_exporter: BTreeMap<Rank, Vec<MigrationDecision>>,
    },
}

pub trait RebalancePlanner: Send {
    fn name(&self) -> &'static str;
    fn trigger(&self) -> PlanTrigger;
    fn plan(&mut self, input: &PlanInput<'_>) -> RebalancePlan;
    fn handle_rank_failure(&mut self, _rank: Rank) {}
}

pub fn planner_for(config: &BalancerConfig) -> Box<dyn RebalancePlanner> {
    match config.strategy {
        Strategy::Greedy => Box::new(GreedyPlanner::new(config)),
        Strategy::ImbalanceFactor => Box::new(ImbalanceFactorPlanner::new(config)),
    }
}
