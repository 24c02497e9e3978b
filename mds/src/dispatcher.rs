use std::time::{Duration, Instant};

use balancer::{Balancer, BalancerMessage, ClusterView, LoadDump, RankContext};
use dirtree::{ArenaTree, DirectoryTree, Rank};
use proto::generated::mds_balancer::Envelope;
use tokio::{sync::mpsc, task::JoinHandle, time::interval};
use utilities::logger::{debug, info, instrument, trace, tracing, warn};

use crate::{
    config::Config,
    executor::{ExportNotice, Outgoing, PendingWork, TreeExecutor},
    peer::service::PeerService,
    rank_cluster::RankCluster,
    wire::{encode, encode_notice},
    workload::Workload,
};

/// Everything the dispatch loop reacts to, in arrival order.
#[derive(Debug)]
pub enum RankEvent {
    Tick,
    Message { from: Rank, message: BalancerMessage },
    Export { from: Rank, notice: ExportNotice },
    PeerDown(Rank),
}

/// Single owner of the rank state. Events are handled one at a time so the
/// balancer never sees concurrent access.
pub struct Dispatcher {
    tree: ArenaTree,
    cluster: RankCluster,
    balancer: Balancer,
    executor: TreeExecutor,
    workload: Workload,
    state_log: Option<mpsc::Sender<LoadDump>>,
    last_tick: Instant,
}

fn with_ctx<R>(
    tree: &ArenaTree,
    cluster: &RankCluster,
    work: &mut PendingWork,
    f: impl FnOnce(&mut RankContext<'_>) -> R,
) -> R {
    let mut ctx = RankContext {
        tree,
        cluster,
        messenger: &mut work.outgoing,
        migrator: &mut work.exports,
        fragmenter: &mut work.fragments,
    };
    f(&mut ctx)
}

impl Dispatcher {
    pub fn new(config: &Config, tree: ArenaTree, balancer: Balancer, now: Instant) -> Self {
        Self {
            tree,
            cluster: RankCluster::new(config.rank, config.cluster_size(), now),
            balancer,
            executor: TreeExecutor::new(config.exports_per_tick),
            workload: Workload::new(config.workload.clone()),
            state_log: None,
            last_tick: now,
        }
    }
    pub fn with_state_log(mut self, state_log: mpsc::Sender<LoadDump>) -> Self {
        self.state_log = Some(state_log);
        self
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<RankEvent>, peers: PeerService) {
        info!(rank = self.cluster.whoami(), "Dispatcher started");
        while let Some(event) = events.recv().await {
            self.cluster.set_queue_len(events.len() as u64);
            let started = Instant::now();
            for (to, envelope) in self.handle(event, started) {
                peers.send(to, envelope);
            }
            self.cluster.record_busy(started.elapsed());
        }
        info!("Event channel closed, dispatcher stopping");
    }

    /// Handles one event and returns the frames to send out.
    #[instrument(name = "dispatch", skip_all, fields(rank = self.cluster.whoami()))]
    pub fn handle(&mut self, event: RankEvent, now: Instant) -> Vec<(Rank, Envelope)> {
        let mut work = PendingWork::default();
        let mut notices = Vec::new();
        match event {
            RankEvent::Tick => notices = self.on_tick(&mut work, now),
            RankEvent::Message { from, message } => {
                self.cluster.mark_up(from);
                with_ctx(&self.tree, &self.cluster, &mut work, |ctx| {
                    self.balancer.handle_message(ctx, from, message, now)
                });
            }
            RankEvent::Export { from, notice }
                if from as usize >= self.cluster.cluster_size()
                    || notice.authority as usize >= self.cluster.cluster_size() =>
            {
                warn!(
                    from,
                    authority = notice.authority,
                    path = %notice.path,
                    "Export notice names an unknown rank, dropping"
                );
            }
            RankEvent::Export { from, notice } => {
                self.cluster.mark_up(from);
                if let Err(e) =
                    self.executor
                        .apply_notice(&mut self.tree, &mut self.balancer, &notice, now)
                {
                    warn!(error = %e, from, path = %notice.path, "Ignoring export notice");
                }
            }
            RankEvent::PeerDown(rank) => {
                if self.cluster.mark_down(rank) {
                    self.balancer.handle_rank_failure(rank);
                }
            }
        }
        notices.extend(self.executor.apply(
            &mut self.tree,
            &mut self.balancer,
            work.exports,
            work.fragments,
            now,
        ));
        self.outbound(work.outgoing, notices)
    }

    fn on_tick(&mut self, work: &mut PendingWork, now: Instant) -> Vec<ExportNotice> {
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        if !self.cluster.is_cache_open() {
            self.cluster.open_cache();
            with_ctx(&self.tree, &self.cluster, work, |ctx| {
                self.balancer.on_cache_open(ctx, now)
            });
        }
        self.replay_workload(elapsed, now);
        let fired = with_ctx(&self.tree, &self.cluster, work, |ctx| {
            self.balancer.handle_export_pins(ctx);
            self.balancer.tick(ctx, now)
        });
        if !fired.is_empty() {
            debug!(count = fired.len(), "Fragment timers fired");
        }
        let notices = self
            .executor
            .drain_queue(&mut self.tree, &mut self.balancer, now);
        if let Some(state_log) = &self.state_log {
            if let Err(e) = state_log.try_send(self.balancer.dump_loads(&self.tree, now)) {
                trace!(error = %e, "Skipping load dump");
            }
        }
        notices
    }

    // hits on a fragmented directory are spread over its fragments
    fn replay_workload(&mut self, elapsed: Duration, now: Instant) {
        let mut served = 0.0;
        for (path, op, amount) in self.workload.batch(elapsed) {
            let Some(dir) = self.tree.lookup(path) else {
                warn!(%path, "Workload path not in namespace");
                continue;
            };
            let frags: Vec<_> = self
                .tree
                .dir_frags(dir)
                .into_iter()
                .filter(|frag| self.tree.is_auth(*frag))
                .collect();
            if frags.is_empty() {
                continue;
            }
            let share = amount / frags.len() as f64;
            for frag in frags {
                let outcome = self.balancer.hit(&self.tree, frag, op, share, now);
                if outcome.hot {
                    trace!(%path, %frag, value = outcome.value, "Hot dirfrag");
                }
            }
            served += amount;
        }
        self.cluster.record_requests(served.round() as u64);
    }

    fn outbound(&self, outgoing: Outgoing, notices: Vec<ExportNotice>) -> Vec<(Rank, Envelope)> {
        let whoami = self.cluster.whoami();
        let mut frames: Vec<(Rank, Envelope)> = outgoing
            .messages
            .iter()
            .map(|(to, message)| (*to, encode(whoami, message)))
            .collect();
        let peers: Vec<Rank> = self
            .cluster
            .up_ranks()
            .into_iter()
            .filter(|rank| *rank != whoami)
            .collect();
        for notice in &notices {
            for rank in &peers {
                frames.push((*rank, encode_notice(whoami, notice)));
            }
        }
        frames
    }
}

/// Feeds a `Tick` into the event channel every `period`.
pub fn start_ticker(events: mpsc::Sender<RankEvent>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            if events.send(RankEvent::Tick).await.is_err() {
                debug!("Event channel closed, ticker stopping");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DirLayout, HotPath},
        namespace,
        wire::{Inbound, decode},
    };
    use balancer::{BalancerConfig, OpType};
    use dirtree::FragTag;

    fn config(rank: Rank) -> Config {
        Config {
            rank,
            peers: (0..3).map(|i| format!("127.0.0.1:{}", 6800 + i)).collect(),
            namespace: vec![
                DirLayout {
                    path: "/home".to_string(),
                    authority: None,
                    export_pin: None,
                    entries: 0,
                },
                DirLayout {
                    path: "/pinned".to_string(),
                    authority: None,
                    export_pin: Some(2),
                    entries: 0,
                },
            ],
            workload: vec![HotPath {
                path: "/home".to_string(),
                op: OpType::Read,
                rate: 10.0,
            }],
            ..Config::default()
        }
    }

    fn dispatcher(config: &Config, now: Instant) -> Dispatcher {
        let tree = namespace::build(config.rank, 3, 0, &config.namespace).unwrap();
        let balancer = Balancer::new(BalancerConfig::default()).unwrap();
        Dispatcher::new(config, tree, balancer, now)
    }

    fn decoded(frames: Vec<(Rank, Envelope)>) -> Vec<(Rank, Inbound)> {
        frames
            .into_iter()
            .map(|(to, envelope)| (to, decode(envelope).unwrap().1))
            .collect()
    }

    #[test]
    fn first_tick_opens_cache_and_exports_pins() {
        let now = Instant::now();
        let config = config(0);
        let (tx, mut rx) = mpsc::channel(4);
        let mut dispatcher = dispatcher(&config, now).with_state_log(tx);
        let frames = decoded(dispatcher.handle(RankEvent::Tick, now));
        assert!(dispatcher.cluster.is_cache_open());

        let beats: Vec<Rank> = frames
            .iter()
            .filter(|(_, inbound)| {
                matches!(inbound, Inbound::Balancer(BalancerMessage::Heartbeat(beat)) if beat.epoch == 1)
            })
            .map(|(to, _)| *to)
            .collect();
        assert_eq!(beats, vec![1, 2]);

        let announced: Vec<Rank> = frames
            .iter()
            .filter_map(|(to, inbound)| match inbound {
                Inbound::Export(notice) if notice.path == "/pinned" => {
                    assert_eq!(notice.authority, 2);
                    Some(*to)
                }
                _ => None,
            })
            .collect();
        assert_eq!(announced, vec![1, 2]);
        let pinned = dispatcher.tree.lookup("/pinned").unwrap();
        assert_eq!(dispatcher.tree.authority(pinned), 2);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn workload_hits_only_count_where_auth() {
        let now = Instant::now();
        let mut dispatcher = dispatcher(&config(1), now);
        dispatcher.handle(RankEvent::Tick, now + Duration::from_secs(2));
        // /home belongs to rank 0
        assert_eq!(dispatcher.cluster.request_count(), 0);

        let mut dispatcher = self::dispatcher(&config(0), now);
        dispatcher.handle(RankEvent::Tick, now + Duration::from_secs(2));
        assert_eq!(dispatcher.cluster.request_count(), 20);
        let home = dispatcher.tree.lookup("/home").unwrap();
        let later = now + Duration::from_secs(2);
        assert!(dispatcher.balancer.accumulator().auth_load(home, later) > 0.0);
    }

    #[test]
    fn down_peer_stops_heartbeats() {
        let now = Instant::now();
        let config = config(0);
        let mut dispatcher = dispatcher(&config, now);
        assert!(dispatcher.handle(RankEvent::PeerDown(2), now).is_empty());
        assert!(dispatcher.cluster.is_degraded());
        // the pin target is down as well, so nothing moves
        assert!(dispatcher.handle(RankEvent::Tick, now).is_empty());
        let pinned = dispatcher.tree.lookup("/pinned").unwrap();
        assert_eq!(dispatcher.tree.authority(pinned), 0);

        dispatcher.handle(
            RankEvent::Message {
                from: 2,
                message: BalancerMessage::Heartbeat(balancer::Heartbeat {
                    epoch: 1,
                    load: Default::default(),
                    import_map: Default::default(),
                }),
            },
            now,
        );
        assert!(!dispatcher.cluster.is_degraded());
    }

    #[test]
    fn export_notice_moves_authority() {
        let now = Instant::now();
        let mut dispatcher = dispatcher(&config(1), now);
        let notice = ExportNotice {
            path: "/home".to_string(),
            frag: FragTag::ROOT,
            authority: 1,
            load: Default::default(),
        };
        let frames = dispatcher.handle(RankEvent::Export { from: 0, notice }, now);
        assert!(frames.is_empty());
        let home = dispatcher.tree.lookup("/home").unwrap();
        assert!(dispatcher.tree.is_auth(home));
        assert!(dispatcher.tree.is_subtree_root(home));
    }

    #[test]
    fn notices_naming_unknown_ranks_are_ignored() {
        let now = Instant::now();
        let mut dispatcher = dispatcher(&config(1), now);
        let home = dispatcher.tree.lookup("/home").unwrap();
        for (from, authority) in [(7, 1), (0, 9)] {
            let notice = ExportNotice {
                path: "/home".to_string(),
                frag: FragTag::ROOT,
                authority,
                load: Default::default(),
            };
            dispatcher.handle(RankEvent::Export { from, notice }, now);
        }
        assert_eq!(dispatcher.tree.authority(home), 0);
    }

    #[tokio::test]
    async fn ticker_feeds_ticks() {
        let (tx, mut rx) = mpsc::channel(2);
        let handle = start_ticker(tx, Duration::from_millis(5));
        assert!(matches!(rx.recv().await, Some(RankEvent::Tick)));
        assert!(matches!(rx.recv().await, Some(RankEvent::Tick)));
        drop(rx);
        handle.await.unwrap();
    }
}
