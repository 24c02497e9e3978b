//! Seams between the balancer and the rank hosting it.

use std::time::Duration;

use dirtree::{DirFragId, DirectoryTree, FragTag, Rank};

use crate::message::BalancerMessage;

/// Cluster membership and process counters of the local rank.
pub trait ClusterView {
    fn whoami(&self) -> Rank;
    /// Ranks currently up, the local one included.
    fn up_ranks(&self) -> Vec<Rank>;
    /// Number of ranks expected to report every epoch.
    fn cluster_size(&self) -> usize;
    fn is_degraded(&self) -> bool;
    fn is_cache_open(&self) -> bool;
    fn is_active(&self) -> bool;
    fn uptime(&self) -> Duration;
    /// Requests served since start.
    fn request_count(&self) -> u64;
    fn dispatch_queue_len(&self) -> u64;
    /// Cpu time consumed since start.
    fn cpu_time(&self) -> Duration;
}

pub trait Messenger {
    /// Fire and forget, delivery failures are the transport's business.
    fn send(&mut self, to: Rank, message: BalancerMessage);
}

pub trait MigrationExecutor {
    fn export_dir(&mut self, frag: DirFragId, target: Rank);
    /// Queued variant that may wait for a quieter moment.
    fn export_dir_nicely(&mut self, frag: DirFragId, target: Rank);
    fn clear_export_queue(&mut self);
}

pub trait FragmentExecutor {
    fn split_dir(&mut self, frag: DirFragId, bits: u8);
    fn merge_dir(&mut self, frag: DirFragId, into: FragTag);
}

/// Everything the balancer touches while handling one event.
pub struct RankContext<'a> {
    pub tree: &'a dyn DirectoryTree,
    pub cluster: &'a dyn ClusterView,
    pub messenger: &'a mut dyn Messenger,
    pub migrator: &'a mut dyn MigrationExecutor,
    pub fragmenter: &'a mut dyn FragmentExecutor,
}

impl RankContext<'_> {
    pub fn whoami(&self) -> Rank {
        self.cluster.whoami()
    }
}
