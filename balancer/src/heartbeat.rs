use serde::Serialize;
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use dirtree::Rank;
use tracing::{debug, trace};

use crate::{
    cluster::{ClusterLoadSnapshot, ClusterLoadTable, ImportMap},
    config::BalancerConfig,
    host::ClusterView,
    message::BalancerMessage,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BeatPhase {
    /// No epoch seen yet.
    AwaitingEpoch,
    /// Epoch adopted, own load sent out.
    Reporting,
    /// Rank 0 collecting the epoch's reports.
    Aggregating,
    /// Epoch fully handled.
    Idle,
}

/// Work parked while the directory cache is not open yet.
#[derive(Clone, Debug, PartialEq)]
pub enum Deferred {
    Beat,
    Message { from: Rank, message: BalancerMessage },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Older than the local epoch.
    Stale,
    /// Rank 0 saw a newer epoch than its own and jumped to it.
    Dropped,
    /// Stored, `from_root` when a non-zero rank heard from rank 0.
    Recorded { from_root: bool },
}

#[derive(Clone, Copy, Debug)]
struct RateSample {
    at: Instant,
    request_count: u64,
    cpu_time: Duration,
    req_rate: f64,
    cpu_load_avg: f64,
}

/// Epoch bookkeeping of one rank: the load table, the reports rank 0 collects
/// for the imbalance factor, the wait-list and the request rate sampler.
pub struct HeartbeatCoordinator {
    phase: BeatPhase,
    table: ClusterLoadTable,
    if_reports: BTreeMap<Rank, ClusterLoadSnapshot>,
    last_beat: Option<Instant>,
    beats_originated: u32,
    planned_epoch: Option<u64>,
    evaluated_epoch: Option<u64>,
    wait_list: Vec<Deferred>,
    last_sample: Option<RateSample>,
}

impl Default for HeartbeatCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatCoordinator {
    pub fn new() -> Self {
        Self {
            phase: BeatPhase::AwaitingEpoch,
            table: ClusterLoadTable::new(),
            if_reports: BTreeMap::new(),
            last_beat: None,
            beats_originated: 0,
            planned_epoch: None,
            evaluated_epoch: None,
            wait_list: Vec::new(),
            last_sample: None,
        }
    }
    pub fn epoch(&self) -> u64 {
        self.table.epoch()
    }
    pub fn phase(&self) -> BeatPhase {
        self.phase
    }
    pub fn table(&self) -> &ClusterLoadTable {
        &self.table
    }
    pub fn if_reports(&self) -> &BTreeMap<Rank, ClusterLoadSnapshot> {
        &self.if_reports
    }

    /// Whether rank 0 should open a new epoch now.
    pub fn due(&self, config: &BalancerConfig, cluster: &dyn ClusterView, now: Instant) -> bool {
        if cluster.whoami() != 0 || !cluster.is_active() || config.interval_secs == 0 {
            return false;
        }
        let elapsed_enough = self
            .last_beat
            .is_none_or(|last| now.saturating_duration_since(last) >= config.interval());
        let cycles_left = config
            .max_cycles
            .is_none_or(|max| self.beats_originated < max);
        let within_until = config
            .max_until_secs
            .is_some_and(|until| cluster.uptime() > Duration::from_secs(until));
        elapsed_enough && (cycles_left || within_until)
    }

    /// Rank 0 only: bumps the epoch and forgets the previous one.
    pub fn begin_epoch(&mut self, now: Instant) -> u64 {
        let epoch = self.table.epoch() + 1;
        self.table.advance_to(epoch);
        self.if_reports.clear();
        self.last_beat = Some(now);
        self.beats_originated += 1;
        self.phase = BeatPhase::Aggregating;
        debug!(epoch, "Opened epoch");
        epoch
    }

    pub fn accept_heartbeat(&mut self, whoami: Rank, from: Rank, epoch: u64) -> HeartbeatVerdict {
        let current = self.table.epoch();
        if epoch < current {
            trace!(from, epoch, current, "Stale heartbeat");
            return HeartbeatVerdict::Stale;
        }
        if epoch > current {
            self.table.advance_to(epoch);
            self.if_reports.clear();
            if whoami == 0 {
                // rank 0 adopts the newer epoch but drops the message
                debug!(from, epoch, current, "Rank 0 jumped to a newer epoch");
                self.phase = BeatPhase::Idle;
                return HeartbeatVerdict::Dropped;
            }
            debug!(from, epoch, "Adopted epoch");
            self.phase = BeatPhase::Reporting;
        }
        HeartbeatVerdict::Recorded {
            from_root: from == 0 && whoami != 0,
        }
    }
    pub fn record(&mut self, rank: Rank, snapshot: ClusterLoadSnapshot, import_map: ImportMap) {
        self.table.record(rank, snapshot, import_map);
    }

    /// Rank 0 only: keeps an imbalance-factor report of the current epoch.
    pub fn accept_if_report(
        &mut self,
        whoami: Rank,
        from: Rank,
        epoch: u64,
        snapshot: ClusterLoadSnapshot,
    ) -> bool {
        if whoami != 0 || epoch != self.table.epoch() {
            trace!(from, epoch, current = self.table.epoch(), "Ignored ifbeat report");
            return false;
        }
        self.if_reports.insert(from, snapshot);
        true
    }

    /// The epoch to plan for, once per epoch and only when every rank reported.
    pub fn take_plan_epoch(&mut self, cluster_size: usize) -> Option<u64> {
        let epoch = self.table.epoch();
        if !self.table.is_complete(cluster_size) || self.planned_epoch == Some(epoch) {
            return None;
        }
        self.planned_epoch = Some(epoch);
        self.phase = BeatPhase::Idle;
        Some(epoch)
    }
    pub fn take_evaluation_epoch(&mut self, cluster_size: usize) -> Option<u64> {
        let epoch = self.table.epoch();
        if cluster_size == 0
            || !(0..cluster_size as Rank).all(|rank| self.if_reports.contains_key(&rank))
            || self.evaluated_epoch == Some(epoch)
        {
            return None;
        }
        self.evaluated_epoch = Some(epoch);
        self.phase = BeatPhase::Idle;
        Some(epoch)
    }

    /// Parks `item` until the cache opens. A single pending beat is enough.
    pub fn defer(&mut self, item: Deferred) {
        if item == Deferred::Beat && self.wait_list.contains(&Deferred::Beat) {
            return;
        }
        self.wait_list.push(item);
    }
    pub fn take_deferred(&mut self) -> Vec<Deferred> {
        std::mem::take(&mut self.wait_list)
    }
    pub fn deferred_len(&self) -> usize {
        self.wait_list.len()
    }

    /// Request rate and cpu usage since the previous sample. Samples closer than
    /// a second apart reuse the previous rates.
    pub fn sample_rates(&mut self, cluster: &dyn ClusterView, now: Instant) -> (f64, f64) {
        let request_count = cluster.request_count();
        let cpu_time = cluster.cpu_time();
        let sample = match self.last_sample {
            Some(last) => {
                let elapsed = now.saturating_duration_since(last.at).as_secs_f64();
                if elapsed < 1.0 {
                    return (last.req_rate, last.cpu_load_avg);
                }
                RateSample {
                    at: now,
                    request_count,
                    cpu_time,
                    req_rate: request_count.saturating_sub(last.request_count) as f64 / elapsed,
                    cpu_load_avg: cpu_time.saturating_sub(last.cpu_time).as_secs_f64() / elapsed,
                }
            }
            None => RateSample {
                at: now,
                request_count,
                cpu_time,
                req_rate: 0.0,
                cpu_load_avg: 0.0,
            },
        };
        self.last_sample = Some(sample);
        (sample.req_rate, sample.cpu_load_avg)
    }
}
