//! Dynamic metadata load balancing for a cluster of metadata server ranks.
//!
//! A [`Balancer`] lives inside every rank. It decays per-fragment load,
//! exchanges heartbeats each epoch, plans migrations with the configured
//! [`RebalancePlanner`] and asks the host to export, split or merge
//! directory fragments through the seams in [`host`].

pub mod accumulator;
pub mod balancer;
pub mod classifier;
pub mod cluster;
pub mod config;
pub mod decay;
pub mod dump;
pub mod error;
pub mod export;
pub mod forecast;
pub mod fragment;
pub mod heartbeat;
pub mod host;
pub mod imbalance;
pub mod load;
pub mod message;
pub mod planner;

pub use accumulator::LoadAccumulator;
pub use balancer::{Balancer, HitOutcome};
pub use classifier::{PathClassifier, PrefixClassifier, WorkloadRule, WorkloadType};
pub use cluster::{ClusterLoadSnapshot, ClusterLoadTable, ImportMap};
pub use config::{BalancerConfig, LoadMode, Strategy};
pub use dump::LoadDump;
pub use error::BalancerError;
pub use fragment::{FragmentKind, FragmentWork};
pub use heartbeat::BeatPhase;
pub use host::{ClusterView, FragmentExecutor, Messenger, MigrationExecutor, RankContext};
pub use load::{LoadSample, OpType};
pub use message::{BalancerMessage, Heartbeat, IfBeat, MigrationDecision};
pub use planner::{RebalancePlan, RebalancePlanner};
