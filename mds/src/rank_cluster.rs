use std::{
    collections::BTreeSet,
    time::{Duration, Instant},
};

use balancer::ClusterView;
use dirtree::Rank;
use utilities::logger::{debug, info};

/// What the dispatcher knows about the cluster and its own process.
pub struct RankCluster {
    whoami: Rank,
    size: usize,
    down: BTreeSet<Rank>,
    started: Instant,
    cache_open: bool,
    requests: u64,
    busy: Duration,
    queue_len: u64,
}

impl RankCluster {
    pub fn new(whoami: Rank, size: usize, started: Instant) -> Self {
        Self {
            whoami,
            size,
            down: BTreeSet::new(),
            started,
            cache_open: false,
            requests: 0,
            busy: Duration::ZERO,
            queue_len: 0,
        }
    }
    pub fn open_cache(&mut self) {
        info!(rank = self.whoami, "Cache open");
        self.cache_open = true;
    }
    /// True when `rank` was considered up until now.
    pub fn mark_down(&mut self, rank: Rank) -> bool {
        if rank == self.whoami || rank as usize >= self.size {
            return false;
        }
        self.down.insert(rank)
    }
    pub fn mark_up(&mut self, rank: Rank) -> bool {
        let was_down = self.down.remove(&rank);
        if was_down {
            debug!(rank, "Peer is back");
        }
        was_down
    }
    pub fn record_requests(&mut self, count: u64) {
        self.requests += count;
    }
    /// Time spent handling events stands in for the cpu time of the rank.
    pub fn record_busy(&mut self, spent: Duration) {
        self.busy += spent;
    }
    pub fn set_queue_len(&mut self, len: u64) {
        self.queue_len = len;
    }
}

impl ClusterView for RankCluster {
    fn whoami(&self) -> Rank {
        self.whoami
    }
    fn up_ranks(&self) -> Vec<Rank> {
        (0..self.size as Rank)
            .filter(|rank| !self.down.contains(rank))
            .collect()
    }
    fn cluster_size(&self) -> usize {
        self.size
    }
    fn is_degraded(&self) -> bool {
        !self.down.is_empty()
    }
    fn is_cache_open(&self) -> bool {
        self.cache_open
    }
    fn is_active(&self) -> bool {
        true
    }
    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
    fn request_count(&self) -> u64 {
        self.requests
    }
    fn dispatch_queue_len(&self) -> u64 {
        self.queue_len
    }
    fn cpu_time(&self) -> Duration {
        self.busy
    }
}
