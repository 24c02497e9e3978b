use serde::{Deserialize, Serialize};

use dirtree::Rank;

use crate::cluster::{ClusterLoadSnapshot, ImportMap};

#[derive(Clone, Debug, PartialEq)]
pub struct Heartbeat {
    pub epoch: u64,
    pub load: ClusterLoadSnapshot,
    pub import_map: ImportMap,
}

/// One transfer an exporter is asked to make.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MigrationDecision {
    pub target: Rank,
    pub export_load: f64,
    pub export_percent: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfBeat {
    pub epoch: u64,
    pub load: ClusterLoadSnapshot,
    pub if_value: f64,
    pub decisions: Vec<MigrationDecision>,
}

impl IfBeat {
    /// `if_value` of a beat that only reports the sender's load.
    pub const REPORT_ONLY: f64 = -1.0;

    pub fn is_report(&self) -> bool {
        self.if_value < 0.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BalancerMessage {
    Heartbeat(Heartbeat),
    IfBeat(IfBeat),
}

impl BalancerMessage {
    pub fn epoch(&self) -> u64 {
        match self {
            BalancerMessage::Heartbeat(beat) => beat.epoch,
            BalancerMessage::IfBeat(beat) => beat.epoch,
        }
    }
}
