use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use dirtree::Rank;

use crate::{config::LoadMode, load::LoadSample};

/// Source rank -> load currently imported from it.
pub type ImportMap = BTreeMap<Rank, f64>;

/// What one rank reports about itself for one epoch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterLoadSnapshot {
    pub auth: LoadSample,
    pub all: LoadSample,
    pub req_rate: f64,
    /// Requests served since start, used to derive per epoch iops.
    pub request_count: u64,
    pub queue_len: u64,
    pub cpu_load_avg: f64,
}

impl ClusterLoadSnapshot {
    pub fn mds_load(&self, mode: LoadMode) -> f64 {
        match mode {
            LoadMode::Combined => {
                0.8 * self.auth.meta_load()
                    + 0.2 * self.all.meta_load()
                    + self.req_rate
                    + 10.0 * self.queue_len as f64
            }
            LoadMode::Requests => self.req_rate + 10.0 * self.queue_len as f64,
            LoadMode::Cpu => self.cpu_load_avg,
        }
    }
}

/// Per epoch view of every rank's load. Entries are last write wins.
#[derive(Clone, Debug, Default)]
pub struct ClusterLoadTable {
    epoch: u64,
    loads: BTreeMap<Rank, ClusterLoadSnapshot>,
    import_maps: BTreeMap<Rank, ImportMap>,
}

impl ClusterLoadTable {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
    /// Moves to `epoch` and forgets everything reported for the previous one.
    pub fn advance_to(&mut self, epoch: u64) {
        assert!(
            epoch >= self.epoch,
            "load table epoch went backwards from {} to {epoch}",
            self.epoch
        );
        self.epoch = epoch;
        self.clear();
    }
    pub fn clear(&mut self) {
        self.loads.clear();
        self.import_maps.clear();
    }
    pub fn record(&mut self, rank: Rank, snapshot: ClusterLoadSnapshot, import_map: ImportMap) {
        self.loads.insert(rank, snapshot);
        self.import_maps.insert(rank, import_map);
    }
    pub fn load(&self, rank: Rank) -> Option<&ClusterLoadSnapshot> {
        self.loads.get(&rank)
    }
    pub fn loads(&self) -> &BTreeMap<Rank, ClusterLoadSnapshot> {
        &self.loads
    }
    pub fn import_map(&self, rank: Rank) -> Option<&ImportMap> {
        self.import_maps.get(&rank)
    }
    pub fn import_maps(&self) -> &BTreeMap<Rank, ImportMap> {
        &self.import_maps
    }
    pub fn len(&self) -> usize {
        self.loads.len()
    }
    pub fn is_empty(&self) -> bool {
        self.loads.is_empty()
    }
    /// True once every rank in `0..cluster_size` reported.
    pub fn is_complete(&self, cluster_size: usize) -> bool {
        cluster_size > 0 && (0..cluster_size as Rank).all(|rank| self.loads.contains_key(&rank))
    }
}
