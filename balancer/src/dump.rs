use serde::Serialize;
use std::{
    collections::{BTreeMap, VecDeque},
    time::Instant,
};

use dirtree::{DirectoryTree, Rank};

use crate::{
    accumulator::LoadAccumulator,
    cluster::ImportMap,
    config::LoadMode,
    heartbeat::{BeatPhase, HeartbeatCoordinator},
};

// loads below this are not worth a line
const TRIVIAL_LOAD: f64 = 0.001;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FragLoadDump {
    pub path: String,
    pub frag: String,
    pub authority: Rank,
    pub auth_meta: f64,
    pub nested_meta: f64,
}

/// Point in time view of what one rank knows about the cluster's load.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoadDump {
    pub rank: Rank,
    pub epoch: u64,
    pub phase: BeatPhase,
    pub loads: BTreeMap<Rank, f64>,
    pub meta_loads: BTreeMap<Rank, f64>,
    pub import_maps: BTreeMap<Rank, ImportMap>,
    pub frags: Vec<FragLoadDump>,
}

impl LoadDump {
    /// Walks the tree breadth first from the root and keeps every fragment
    /// carrying some load.
    pub fn collect(
        tree: &dyn DirectoryTree,
        accumulator: &LoadAccumulator,
        beats: &HeartbeatCoordinator,
        load_mode: LoadMode,
        now: Instant,
    ) -> Self {
        let table = beats.table();
        let mut frags = Vec::new();
        let mut queue: VecDeque<_> = tree.root_frags().into();
        while let Some(frag) = queue.pop_front() {
            queue.extend(tree.children(frag));
            let Some(load) = accumulator.get(frag) else {
                continue;
            };
            let auth_meta = load.auth_subtree.meta_load(now);
            let nested_meta = load.nested.meta_load(now);
            if nested_meta < TRIVIAL_LOAD && auth_meta < TRIVIAL_LOAD {
                continue;
            }
            frags.push(FragLoadDump {
                path: tree.path(frag),
                frag: tree.frag_tag(frag).to_string(),
                authority: tree.authority(frag),
                auth_meta,
                nested_meta,
            });
        }
        Self {
            rank: tree.whoami(),
            epoch: beats.epoch(),
            phase: beats.phase(),
            loads: table
                .loads()
                .iter()
                .map(|(rank, load)| (*rank, load.mds_load(load_mode)))
                .collect(),
            meta_loads: table
                .loads()
                .iter()
                .map(|(rank, load)| (*rank, load.auth.meta_load()))
                .collect(),
            import_maps: table.import_maps().clone(),
            frags,
        }
    }
}
