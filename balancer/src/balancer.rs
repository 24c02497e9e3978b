use std::{collections::BTreeMap, time::Instant};

use dirtree::{DirFragId, DirectoryTree, Rank};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    accumulator::LoadAccumulator,
    classifier::{PathClassifier, PrefixClassifier},
    cluster::{ClusterLoadSnapshot, ImportMap},
    config::{BalancerConfig, Strategy},
    decay::DecayRate,
    dump::LoadDump,
    error::BalancerError,
    export::{ExportSearch, ExportSelector, LoadView},
    forecast::{LoadForecaster, forecaster_from_name},
    fragment::{FragmentWork, FragmentationController},
    heartbeat::{BeatPhase, Deferred, HeartbeatCoordinator, HeartbeatVerdict},
    host::RankContext,
    load::{LoadSample, OpType},
    message::{BalancerMessage, Heartbeat, IfBeat, MigrationDecision},
    planner::{BalanceState, PlanInput, PlanTrigger, RebalancePlan, RebalancePlanner, planner_for},
};

/// Share of a decision's load that is enough for the simple rebalance.
const SIMPLE_REBALANCE_ENOUGH: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HitOutcome {
    /// New value of the fragment's own counter for the op.
    pub value: f64,
    /// Crossed the split rate threshold of the op.
    pub hot: bool,
}

/// Balancer state of one rank. Every entry point is called from the rank's
/// single dispatch context.
pub struct Balancer {
    config: BalancerConfig,
    accumulator: LoadAccumulator,
    beats: HeartbeatCoordinator,
    planner: Box<dyn RebalancePlanner>,
    selector: ExportSelector,
    fragments: FragmentationController,
    forecaster: Option<Box<dyn LoadForecaster>>,
    classifier: Box<dyn PathClassifier>,
    last_plan: Option<RebalancePlan>,
}

impl Balancer {
    pub fn new(config: BalancerConfig) -> Result<Self, BalancerError> {
        config.validate()?;
        let forecaster = forecaster_from_name(&config.forecaster)?;
        let planner = planner_for(&config);
        info!(
            planner = planner.name(),
            forecaster = forecaster.as_ref().map(|f| f.name()),
            "Created balancer"
        );
        Ok(Self {
            accumulator: LoadAccumulator::new(DecayRate::new(config.decay_half_life())),
            beats: HeartbeatCoordinator::new(),
            planner,
            selector: ExportSelector::new(&config),
            fragments: FragmentationController::new(&config),
            forecaster,
            classifier: Box::new(PrefixClassifier::new(config.workload_rules.clone())),
            last_plan: None,
            config,
        })
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }
    pub fn epoch(&self) -> u64 {
        self.beats.epoch()
    }
    pub fn phase(&self) -> BeatPhase {
        self.beats.phase()
    }
    pub fn accumulator(&self) -> &LoadAccumulator {
        &self.accumulator
    }
    pub fn coordinator(&self) -> &HeartbeatCoordinator {
        &self.beats
    }
    pub fn fragments(&self) -> &FragmentationController {
        &self.fragments
    }
    /// Outcome of the most recent planning pass of this rank.
    pub fn last_plan(&self) -> Option<&RebalancePlan> {
        self.last_plan.as_ref()
    }

    fn load_view(&self, now: Instant) -> LoadView<'_> {
        LoadView {
            accumulator: &self.accumulator,
            forecaster: self.forecaster.as_deref(),
            now,
        }
    }

    /// Periodic work: due fragment requests and, on rank 0, opening epochs.
    pub fn tick(&mut self, ctx: &mut RankContext<'_>, now: Instant) -> Vec<FragmentWork> {
        let fired = self.fragments.drain(ctx.tree, ctx.fragmenter, now);
        if ctx.cluster.is_degraded() {
            trace!("Cluster degraded, not sending heartbeat");
            return fired;
        }
        if !self.beats.due(&self.config, ctx.cluster, now) {
            return fired;
        }
        if !ctx.cluster.is_cache_open() {
            debug!("Cache not open, deferring heartbeat");
            self.beats.defer(Deferred::Beat);
            return fired;
        }
        self.beats.begin_epoch(now);
        self.send_heartbeat(ctx, now);
        self.maybe_plan(ctx, now);
        fired
    }

    /// Replays everything parked while the cache was closed.
    pub fn on_cache_open(&mut self, ctx: &mut RankContext<'_>, now: Instant) {
        let deferred = self.beats.take_deferred();
        debug!(count = deferred.len(), "Replaying deferred work");
        for item in deferred {
            match item {
                Deferred::Beat => {
                    self.tick(ctx, now);
                }
                Deferred::Message { from, message } => {
                    self.handle_message(ctx, from, message, now)
                }
            }
        }
    }

    #[instrument(
        name = "balancer_message",
        skip(self, ctx, message, now),
        fields(epoch = message.epoch())
    )]
    pub fn handle_message(
        &mut self,
        ctx: &mut RankContext<'_>,
        from: Rank,
        message: BalancerMessage,
        now: Instant,
    ) {
        if from as usize >= ctx.cluster.cluster_size() {
            warn!(from, "Balancer message from a rank outside the cluster, dropping");
            return;
        }
        if !ctx.cluster.is_active() {
            trace!("Not active, ignoring balancer message");
            return;
        }
        if !ctx.cluster.is_cache_open() {
            debug!("Cache not open, deferring balancer message");
            self.beats.defer(Deferred::Message { from, message });
            return;
        }
        if ctx.cluster.is_degraded() {
            debug!("Cluster degraded, dropping balancer message");
            return;
        }
        match message {
            BalancerMessage::Heartbeat(beat) => self.handle_heartbeat(ctx, from, beat, now),
            BalancerMessage::IfBeat(beat) => self.handle_if_beat(ctx, from, beat, now),
        }
    }

    fn handle_heartbeat(
        &mut self,
        ctx: &mut RankContext<'_>,
        from: Rank,
        beat: Heartbeat,
        now: Instant,
    ) {
        match self.beats.accept_heartbeat(ctx.whoami(), from, beat.epoch) {
            HeartbeatVerdict::Stale | HeartbeatVerdict::Dropped => return,
            HeartbeatVerdict::Recorded { from_root } => {
                if from_root {
                    self.send_heartbeat(ctx, now);
                }
            }
        }
        trace!(from, load = beat.load.mds_load(self.config.load_mode), "Recorded heartbeat");
        self.beats.record(from, beat.load, beat.import_map);
        self.maybe_plan(ctx, now);
    }

    fn handle_if_beat(
        &mut self,
        ctx: &mut RankContext<'_>,
        from: Rank,
        beat: IfBeat,
        now: Instant,
    ) {
        let whoami = ctx.whoami();
        if beat.is_report() {
            if self.beats.accept_if_report(whoami, from, beat.epoch, beat.load) {
                self.maybe_evaluate(ctx, now);
            }
            return;
        }
        if beat.epoch < self.beats.epoch() {
            trace!(from, epoch = beat.epoch, "Stale migration decisions");
            return;
        }
        if beat.if_value >= self.config.if_threshold {
            info!(
                from,
                if_value = beat.if_value,
                decisions = beat.decisions.len(),
                "Received migration decisions"
            );
            self.simple_determine_rebalance(ctx, &beat.decisions, now);
        }
    }

    // own load goes into the local table and out to every other up rank
    fn send_heartbeat(&mut self, ctx: &mut RankContext<'_>, now: Instant) {
        let whoami = ctx.whoami();
        let epoch = self.beats.epoch();
        self.accumulator.roll_epoch(now);
        let load = self.get_load(ctx, now);
        let import_map = self.import_map(ctx.tree, now);
        debug!(
            epoch,
            load = load.mds_load(self.config.load_mode),
            "Sending heartbeat"
        );
        self.beats.record(whoami, load.clone(), import_map.clone());
        for rank in ctx.cluster.up_ranks() {
            if rank == whoami {
                continue;
            }
            ctx.messenger.send(
                rank,
                BalancerMessage::Heartbeat(Heartbeat {
                    epoch,
                    load: load.clone(),
                    import_map: import_map.clone(),
                }),
            );
        }
        if self.config.strategy == Strategy::ImbalanceFactor {
            if whoami == 0 {
                self.beats.accept_if_report(whoami, whoami, epoch, load);
                self.maybe_evaluate(ctx, now);
            } else {
                ctx.messenger.send(
                    0,
                    BalancerMessage::IfBeat(IfBeat {
                        epoch,
                        load,
                        if_value: IfBeat::REPORT_ONLY,
                        decisions: Vec::new(),
                    }),
                );
            }
        }
    }

    fn maybe_plan(&mut self, ctx: &mut RankContext<'_>, now: Instant) {
        if self.planner.trigger() != PlanTrigger::HeartbeatsComplete
            || self
                .beats
                .take_plan_epoch(ctx.cluster.cluster_size())
                .is_none()
        {
            return;
        }
        self.run_planner(ctx, now);
    }

    fn maybe_evaluate(&mut self, ctx: &mut RankContext<'_>, now: Instant) {
        if self.planner.trigger() != PlanTrigger::IfReportsComplete
            || self
                .beats
                .take_evaluation_epoch(ctx.cluster.cluster_size())
                .is_none()
        {
            return;
        }
        self.run_planner(ctx, now);
    }

    fn run_planner(&mut self, ctx: &mut RankContext<'_>, now: Instant) {
        let input = PlanInput {
            whoami: ctx.whoami(),
            epoch: self.beats.epoch(),
            cluster_size: ctx.cluster.cluster_size(),
            load_mode: self.config.load_mode,
            table: self.beats.table(),
            if_reports: self.beats.if_reports(),
        };
        let plan = self.planner.plan(&input);
        match &plan {
            RebalancePlan::Idle => {}
            RebalancePlan::Targets { state, target_load } => {
                let gathered = self.try_rebalance(ctx, state, *target_load, now);
                trace!(?gathered, "Greedy pass done");
            }
            RebalancePlan::Decisions {
                factor,
                by_exporter,
            } => self.dispatch_decisions(ctx, *factor, by_exporter, now),
        }
        self.last_plan = Some(plan);
    }

    // rank 0 runs its own decisions and mails the rest to their exporters
    fn dispatch_decisions(
        &self,
        ctx: &mut RankContext<'_>,
        factor: f64,
        by_exporter: &BTreeMap<Rank, Vec<MigrationDecision>>,
        now: Instant,
    ) {
        let whoami = ctx.whoami();
        let epoch = self.beats.epoch();
        let load = self
            .beats
            .table()
            .load(whoami)
            .cloned()
            .unwrap_or_default();
        for (exporter, decisions) in by_exporter {
            if *exporter == whoami {
                self.simple_determine_rebalance(ctx, decisions, now);
                continue;
            }
            debug!(exporter, count = decisions.len(), "Sending migration decisions");
            ctx.messenger.send(
                *exporter,
                BalancerMessage::IfBeat(IfBeat {
                    epoch,
                    load: load.clone(),
                    if_value: factor,
                    decisions: decisions.clone(),
                }),
            );
        }
    }

    /// Carries out imbalance factor decisions: searches the full auth subtrees
    /// until most of each decision's share of the local load is found.
    pub fn simple_determine_rebalance(
        &self,
        ctx: &mut RankContext<'_>,
        decisions: &[MigrationDecision],
        now: Instant,
    ) {
        ctx.migrator.clear_export_queue();
        let tree = ctx.tree;
        let my_load = self.local_auth_load(tree, now).meta_load();
        let view = self.load_view(now);
        let mut search = ExportSearch::new(tree, &view, now, ctx.cluster.cluster_size());
        let subtrees: Vec<DirFragId> = tree
            .full_auth_subtrees()
            .into_iter()
            .filter(|frag| {
                !tree.is_frozen(*frag) && !tree.is_freezing(*frag) && !tree.is_stray(*frag)
            })
            .collect();
        for decision in decisions {
            let amount = decision.export_percent * my_load;
            if amount <= 0.0 {
                continue;
            }
            search.retarget(decision.target);
            let mut have = 0.0;
            for frag in &subtrees {
                self.selector.find_exports_steered(
                    &mut search,
                    self.classifier.as_ref(),
                    *frag,
                    amount,
                    &mut have,
                );
                if have >= SIMPLE_REBALANCE_ENOUGH * amount {
                    break;
                }
            }
            let chosen = search.take_chosen();
            info!(
                target = decision.target,
                amount,
                have,
                count = chosen.len(),
                "Exporting for migration decision"
            );
            for frag in chosen {
                ctx.migrator.export_dir_nicely(frag, decision.target);
            }
        }
    }

    /// Turns the targets of a greedy pass into export requests, giving imports
    /// back before cutting into local subtrees. Returns the load gathered for
    /// every target that was served.
    #[instrument(name = "try_rebalance", skip_all, fields(epoch = self.beats.epoch()))]
    pub fn try_rebalance(
        &self,
        ctx: &mut RankContext<'_>,
        state: &BalanceState,
        target_load: f64,
        now: Instant,
    ) -> Vec<(Rank, f64)> {
        let tree = ctx.tree;
        let whoami = ctx.whoami();
        let view = self.load_view(now);

        let mut import_pop: Vec<(f64, DirFragId)> = Vec::new();
        let mut import_from: BTreeMap<Rank, Vec<(DirFragId, f64)>> = BTreeMap::new();
        for frag in tree.full_auth_subtrees() {
            if tree.is_base(frag)
                || tree.export_pin(frag).is_some()
                || tree.is_frozen(frag)
                || tree.is_freezing(frag)
                || tree.is_stray(frag)
            {
                continue;
            }
            let from = tree.inode_authority(frag);
            let pop = view.load(frag);
            if self.config.idle_threshold > 0.0
                && pop < self.config.idle_threshold
                && from != whoami
                && tree.parent(frag).is_some()
            {
                debug!(%frag, from, pop, "Sending idle import back");
                ctx.migrator.export_dir_nicely(frag, from);
                continue;
            }
            import_pop.push((pop, frag));
            if from != whoami {
                import_from.entry(from).or_default().push((frag, pop));
            }
        }
        import_pop.sort_by(|a, b| b.0.total_cmp(&a.0));

        let min_offload = self.config.min_offload;
        let target_count = state.targets.len() as f64;
        let mut search = ExportSearch::new(tree, &view, now, ctx.cluster.cluster_size());
        let mut gathered = Vec::new();
        for (target, amount) in &state.targets {
            let (target, amount) = (*target, *amount);
            if amount < min_offload || amount * 10.0 * target_count < target_load {
                trace!(target, amount, "Target too small");
                continue;
            }
            search.retarget(target);
            let mut exports = Vec::new();
            let mut have = 0.0;

            // hand back what came from the target
            if let Some(imports) = import_from.get(&target) {
                for (frag, pop) in imports {
                    if search.is_excluded(*frag) {
                        continue;
                    }
                    if *pop <= amount - have {
                        exports.push(*frag);
                        search.exclude([*frag]);
                        have += pop;
                        if amount - have < min_offload {
                            break;
                        }
                    }
                }
            }
            // then bigger imports from anywhere
            if amount - have >= min_offload {
                'sources: for (from, imports) in &import_from {
                    if *from == target {
                        continue;
                    }
                    for (frag, pop) in imports {
                        if search.is_excluded(*frag) {
                            continue;
                        }
                        if *pop <= amount - have && *pop > self.config.min_reexport {
                            exports.push(*frag);
                            search.exclude([*frag]);
                            have += pop;
                            if amount - have < min_offload {
                                break 'sources;
                            }
                        }
                    }
                }
            }
            // finally cut pieces out of the busiest subtrees
            if amount - have >= min_offload {
                for (_, frag) in &import_pop {
                    if search.is_excluded(*frag) {
                        continue;
                    }
                    self.selector.find_exports_steered(
                        &mut search,
                        self.classifier.as_ref(),
                        *frag,
                        amount,
                        &mut have,
                    );
                    if amount - have < min_offload {
                        break;
                    }
                }
                exports.extend(search.take_chosen());
            }
            info!(target, amount, have, count = exports.len(), "Exporting to target");
            for frag in exports {
                ctx.migrator.export_dir_nicely(frag, target);
            }
            gathered.push((target, have));
        }
        gathered
    }

    /// Exports pinned directories to their pinned rank when it is up.
    pub fn handle_export_pins(&self, ctx: &mut RankContext<'_>) {
        let tree = ctx.tree;
        let whoami = ctx.whoami();
        let up = ctx.cluster.up_ranks();
        let mut stack = tree.auth_subtrees();
        while let Some(frag) = stack.pop() {
            if let Some(pin) = tree.export_pin(frag) {
                if pin != whoami && up.contains(&pin) {
                    if !tree.is_frozen(frag) && !tree.is_freezing(frag) {
                        debug!(%frag, pin, "Exporting pinned dirfrag");
                        ctx.migrator.export_dir(frag, pin);
                    }
                    continue;
                }
            }
            stack.extend(tree.children(frag).into_iter().filter(|c| tree.is_auth(*c)));
        }
    }

    pub fn handle_rank_failure(&mut self, rank: Rank) {
        info!(rank, "Rank failed");
        self.planner.handle_rank_failure(rank);
    }

    /// Records hits on `frag` and checks whether it should be split or merged.
    pub fn hit(
        &mut self,
        tree: &dyn DirectoryTree,
        frag: DirFragId,
        op: OpType,
        amount: f64,
        now: Instant,
    ) -> HitOutcome {
        let value = self.accumulator.hit(tree, frag, op, amount, now);
        let hot = match op {
            OpType::Read | OpType::Readdir => value > self.config.split_rd,
            OpType::Write => value > self.config.split_wr,
            OpType::Fetch | OpType::Store => false,
        };
        self.fragments.maybe_fragment(tree, frag, hot, now);
        HitOutcome { value, hot }
    }

    pub fn subtract_export(&mut self, tree: &dyn DirectoryTree, frag: DirFragId, now: Instant) {
        self.accumulator.subtract_export(tree, frag, now);
    }
    pub fn add_import(&mut self, tree: &dyn DirectoryTree, frag: DirFragId, now: Instant) {
        self.accumulator.add_import(tree, frag, now);
    }
    /// Counterpart of [`Balancer::subtract_export`] on the importing rank.
    pub fn import_with(
        &mut self,
        tree: &dyn DirectoryTree,
        frag: DirFragId,
        carried: &LoadSample,
        now: Instant,
    ) {
        self.accumulator.import_with(tree, frag, carried, now);
    }
    pub fn adjust_for_rename(
        &mut self,
        tree: &dyn DirectoryTree,
        old_parent: Option<DirFragId>,
        new_parent: Option<DirFragId>,
        frag: DirFragId,
        now: Instant,
    ) {
        self.accumulator
            .adjust_for_rename(tree, old_parent, new_parent, frag, now);
    }
    /// Spreads the load of a split fragment over its pieces.
    pub fn on_split(&mut self, pieces: &[DirFragId], now: Instant) {
        self.accumulator.split(pieces, now);
    }
    pub fn on_merge(&mut self, survivor: DirFragId, merged: &[DirFragId], now: Instant) {
        self.accumulator.merge(survivor, merged, now);
    }
    pub fn prune(&mut self, tree: &dyn DirectoryTree) {
        self.accumulator.prune(tree);
    }

    fn local_auth_load(&self, tree: &dyn DirectoryTree, now: Instant) -> LoadSample {
        let mut auth = LoadSample::default();
        for frag in tree.root_frags() {
            if let Some(load) = self.accumulator.get(frag) {
                auth.add(&load.auth_subtree_nested.sample(now));
            }
        }
        auth
    }

    /// Current load of this rank as it goes out in heartbeats.
    pub fn get_load(&mut self, ctx: &RankContext<'_>, now: Instant) -> ClusterLoadSnapshot {
        let mut all = LoadSample::default();
        for frag in ctx.tree.root_frags() {
            if let Some(load) = self.accumulator.get(frag) {
                all.add(&load.nested.sample(now));
            }
        }
        let (req_rate, cpu_load_avg) = self.beats.sample_rates(ctx.cluster, now);
        ClusterLoadSnapshot {
            auth: self.local_auth_load(ctx.tree, now),
            all,
            req_rate,
            request_count: ctx.cluster.request_count(),
            queue_len: ctx.cluster.dispatch_queue_len(),
            cpu_load_avg,
        }
    }

    /// Load of the subtrees this rank imported, keyed by the rank they came from.
    pub fn import_map(&self, tree: &dyn DirectoryTree, now: Instant) -> ImportMap {
        let whoami = tree.whoami();
        let mut map = ImportMap::new();
        for frag in tree.auth_subtrees() {
            if tree.is_base(frag) || tree.is_stray(frag) {
                continue;
            }
            let from = tree.inode_authority(frag);
            if from == whoami {
                continue;
            }
            *map.entry(from).or_default() += self.accumulator.auth_load(frag, now);
        }
        map
    }

    pub fn dump_loads(&self, tree: &dyn DirectoryTree, now: Instant) -> LoadDump {
        LoadDump::collect(
            tree,
            &self.accumulator,
            &self.beats,
            self.config.load_mode,
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ClusterView, FragmentExecutor, MigrationExecutor, Messenger};
    use dirtree::{ArenaTree, FragTag};
    use std::time::Duration;

    pub struct FakeCluster {
        pub whoami: Rank,
        pub size: usize,
        pub degraded: bool,
        pub open: bool,
        pub requests: u64,
    }

    impl FakeCluster {
        pub fn new(whoami: Rank, size: usize) -> Self {
            Self {
                whoami,
                size,
                degraded: false,
                open: true,
                requests: 0,
            }
        }
    }

    impl ClusterView for FakeCluster {
        fn whoami(&self) -> Rank {
            self.whoami
        }
        fn up_ranks(&self) -> Vec<Rank> {
            (0..self.size as Rank).collect()
        }
        fn cluster_size(&self) -> usize {
            self.size
        }
        fn is_degraded(&self) -> bool {
            self.degraded
        }
        fn is_cache_open(&self) -> bool {
            self.open
        }
        fn is_active(&self) -> bool {
            true
        }
        fn uptime(&self) -> Duration {
            Duration::from_secs(60)
        }
        fn request_count(&self) -> u64 {
            self.requests
        }
        fn dispatch_queue_len(&self) -> u64 {
            0
        }
        fn cpu_time(&self) -> Duration {
            Duration::ZERO
        }
    }

    #[derive(Default)]
    pub struct Outbox {
        pub sent: Vec<(Rank, BalancerMessage)>,
        pub exports: Vec<(DirFragId, Rank)>,
        pub pinned: Vec<(DirFragId, Rank)>,
        pub queue_clears: usize,
        pub splits: Vec<(DirFragId, u8)>,
    }

    impl Messenger for Outbox {
        fn send(&mut self, to: Rank, message: BalancerMessage) {
            self.sent.push((to, message));
        }
    }

    impl MigrationExecutor for Outbox {
        fn export_dir(&mut self, frag: DirFragId, target: Rank) {
            self.pinned.push((frag, target));
        }
        fn export_dir_nicely(&mut self, frag: DirFragId, target: Rank) {
            self.exports.push((frag, target));
        }
        fn clear_export_queue(&mut self) {
            self.queue_clears += 1;
        }
    }

    impl FragmentExecutor for Outbox {
        fn split_dir(&mut self, frag: DirFragId, bits: u8) {
            self.splits.push((frag, bits));
        }
        fn merge_dir(&mut self, _frag: DirFragId, _into: FragTag) {}
    }

    // one outbox plays messenger, migrator and fragmenter
    pub fn with_ctx<R>(
        tree: &ArenaTree,
        cluster: &FakeCluster,
        f: impl FnOnce(&mut RankContext<'_>) -> R,
    ) -> (R, Outbox) {
        let mut messenger = Outbox::default();
        let mut migrator = Outbox::default();
        let mut fragmenter = Outbox::default();
        let result = {
            let mut ctx = RankContext {
                tree,
                cluster,
                messenger: &mut messenger,
                migrator: &mut migrator,
                fragmenter: &mut fragmenter,
            };
            f(&mut ctx)
        };
        messenger.exports = migrator.exports;
        messenger.pinned = migrator.pinned;
        messenger.queue_clears = migrator.queue_clears;
        messenger.splits = fragmenter.splits;
        (result, messenger)
    }

    fn heartbeat_from(epoch: u64) -> BalancerMessage {
        BalancerMessage::Heartbeat(Heartbeat {
            epoch,
            load: ClusterLoadSnapshot::default(),
            import_map: ImportMap::new(),
        })
    }

    #[test]
    fn rank_zero_opens_epochs_on_schedule() {
        let tree = ArenaTree::new(0, 0);
        let cluster = FakeCluster::new(0, 3);
        let mut balancer = Balancer::new(BalancerConfig::default()).unwrap();
        let now = Instant::now();
        let (_, out) = with_ctx(&tree, &cluster, |ctx| balancer.tick(ctx, now));
        assert_eq!(balancer.epoch(), 1);
        let targets: Vec<Rank> = out.sent.iter().map(|(to, _)| *to).collect();
        assert_eq!(targets, vec![1, 2]);
        assert!(balancer.coordinator().table().load(0).is_some());
        // not due again before the interval
        let (_, out) = with_ctx(&tree, &cluster, |ctx| balancer.tick(ctx, now + Duration::from_secs(1)));
        assert!(out.sent.is_empty());
        with_ctx(&tree, &cluster, |ctx| balancer.tick(ctx, now + Duration::from_secs(10)));
        assert_eq!(balancer.epoch(), 2);
    }

    #[test]
    fn closed_cache_defers_until_open() {
        let tree = ArenaTree::new(1, 0);
        let mut cluster = FakeCluster::new(1, 2);
        cluster.open = false;
        let mut balancer = Balancer::new(BalancerConfig::default()).unwrap();
        let now = Instant::now();
        let (_, out) = with_ctx(&tree, &cluster, |ctx| {
            balancer.handle_message(ctx, 0, heartbeat_from(3), now)
        });
        assert!(out.sent.is_empty());
        assert_eq!(balancer.coordinator().deferred_len(), 1);
        assert_eq!(balancer.epoch(), 0);

        cluster.open = true;
        let (_, out) = with_ctx(&tree, &cluster, |ctx| balancer.on_cache_open(ctx, now));
        assert_eq!(balancer.epoch(), 3);
        assert_eq!(out.sent.len(), 1);
        assert_eq!(out.sent[0].0, 0);
        assert_eq!(balancer.coordinator().deferred_len(), 0);
    }

    #[test]
    fn degraded_cluster_drops_messages() {
        let tree = ArenaTree::new(1, 0);
        let mut cluster = FakeCluster::new(1, 2);
        cluster.degraded = true;
        let mut balancer = Balancer::new(BalancerConfig::default()).unwrap();
        let (_, out) = with_ctx(&tree, &cluster, |ctx| {
            balancer.handle_message(ctx, 0, heartbeat_from(3), Instant::now())
        });
        assert!(out.sent.is_empty());
        assert_eq!(balancer.epoch(), 0);
        assert_eq!(balancer.coordinator().deferred_len(), 0);
    }

    #[test]
    fn heartbeats_from_unknown_ranks_are_dropped() {
        let tree = ArenaTree::new(2, 0);
        let cluster = FakeCluster::new(2, 3);
        let mut balancer = Balancer::new(BalancerConfig::default()).unwrap();
        let (_, out) = with_ctx(&tree, &cluster, |ctx| {
            for from in [7, 1, 9] {
                balancer.handle_message(ctx, from, heartbeat_from(1), Instant::now());
            }
        });
        assert!(out.sent.is_empty());
        assert!(out.exports.is_empty());
        assert_eq!(balancer.coordinator().table().len(), 1);
        assert!(balancer.coordinator().table().load(7).is_none());
    }

    #[test]
    fn heartbeat_from_rank_zero_triggers_reports() {
        let tree = ArenaTree::new(2, 0);
        let cluster = FakeCluster::new(2, 3);
        let mut balancer = Balancer::new(BalancerConfig {
            strategy: Strategy::ImbalanceFactor,
            ..BalancerConfig::default()
        })
        .unwrap();
        let (_, out) = with_ctx(&tree, &cluster, |ctx| {
            balancer.handle_message(ctx, 0, heartbeat_from(1), Instant::now())
        });
        let heartbeats: Vec<Rank> = out
            .sent
            .iter()
            .filter(|(_, m)| matches!(m, BalancerMessage::Heartbeat(_)))
            .map(|(to, _)| *to)
            .collect();
        assert_eq!(heartbeats, vec![0, 1]);
        let reports: Vec<&IfBeat> = out
            .sent
            .iter()
            .filter_map(|(to, m)| match m {
                BalancerMessage::IfBeat(beat) if *to == 0 => Some(beat),
                _ => None,
            })
            .collect();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_report());
    }

    #[test]
    fn hot_fragment_is_split_at_next_tick() {
        let mut tree = ArenaTree::new(0, 0);
        let dir = tree.add_path("/busy").unwrap();
        let cluster = FakeCluster::new(0, 1);
        let mut balancer = Balancer::new(BalancerConfig {
            split_rd: 5.0,
            ..BalancerConfig::default()
        })
        .unwrap();
        let now = Instant::now();
        assert!(!balancer.hit(&tree, dir, OpType::Read, 3.0, now).hot);
        assert!(balancer.hit(&tree, dir, OpType::Read, 3.0, now).hot);
        assert!(balancer.hit(&tree, dir, OpType::Read, 3.0, now).hot);
        assert_eq!(balancer.fragments().split_pending().len(), 1);
        let (fired, out) = with_ctx(&tree, &cluster, |ctx| balancer.tick(ctx, now));
        assert_eq!(fired.len(), 1);
        assert_eq!(out.splits, vec![(dir, 3)]);
    }

    // rank 1 serves /from0, imported from rank 0, and /r2/from2, imported from rank 2
    fn importing_tree() -> ArenaTree {
        let mut tree = ArenaTree::new(1, 0);
        for path in ["/from0/a", "/r2/from2/b", "/local/c"] {
            tree.add_path(path).unwrap();
        }
        let r2 = tree.lookup("/r2").unwrap();
        tree.set_subtree_authority(r2, 2).unwrap();
        for path in ["/from0", "/r2/from2"] {
            let frag = tree.lookup(path).unwrap();
            tree.set_subtree_authority(frag, 1).unwrap();
        }
        tree
    }

    #[test]
    fn imports_from_the_target_go_back_first() {
        let tree = importing_tree();
        let from0 = tree.lookup("/from0").unwrap();
        let now = Instant::now();
        let mut balancer = Balancer::new(BalancerConfig::default()).unwrap();
        balancer.hit(&tree, tree.lookup("/from0/a").unwrap(), OpType::Read, 6.0, now);
        balancer.hit(&tree, tree.lookup("/r2/from2/b").unwrap(), OpType::Read, 20.0, now);
        let import_map = balancer.import_map(&tree, now);
        assert_eq!(import_map.get(&0), Some(&6.0));
        assert_eq!(import_map.get(&2), Some(&20.0));

        let cluster = FakeCluster::new(1, 3);
        let state = BalanceState {
            targets: BTreeMap::from([(0, 7.0)]),
            ..BalanceState::default()
        };
        let (_, out) = with_ctx(&tree, &cluster, |ctx| {
            balancer.try_rebalance(ctx, &state, 7.0, now)
        });
        assert_eq!(out.exports, vec![(from0, 0)]);
    }

    #[test]
    fn an_import_goes_to_one_target_only() {
        let tree = importing_tree();
        let from0 = tree.lookup("/from0").unwrap();
        let from2 = tree.lookup("/r2/from2").unwrap();
        let now = Instant::now();
        let mut balancer = Balancer::new(BalancerConfig::default()).unwrap();
        balancer.hit(&tree, tree.lookup("/r2/from2/b").unwrap(), OpType::Read, 20.0, now);
        let cluster = FakeCluster::new(1, 3);
        let state = BalanceState {
            targets: BTreeMap::from([(0, 25.0), (2, 25.0)]),
            ..BalanceState::default()
        };
        let (gathered, out) = with_ctx(&tree, &cluster, |ctx| {
            balancer.try_rebalance(ctx, &state, 25.0, now)
        });
        // /r2/from2 already left for rank 0, rank 2 gets nothing
        assert_eq!(out.exports, vec![(from0, 0), (from2, 0)]);
        assert_eq!(gathered, vec![(0, 20.0), (2, 0.0)]);
    }

    #[test]
    fn search_budget_runs_from_the_given_instant() {
        let mut tree = ArenaTree::new(0, 0);
        let busy = tree.add_path("/work/busy").unwrap();
        let calm = tree.add_path("/work/calm").unwrap();
        let now = Instant::now();
        let mut balancer = Balancer::new(BalancerConfig {
            export_search_budget_ms: 50,
            ..BalancerConfig::default()
        })
        .unwrap();
        balancer.hit(&tree, busy, OpType::Read, 28.0, now);
        balancer.hit(&tree, calm, OpType::Read, 72.0, now);
        std::thread::sleep(Duration::from_millis(60));
        let cluster = FakeCluster::new(0, 2);
        let decisions = [MigrationDecision {
            target: 1,
            export_load: 25.0,
            export_percent: 0.25,
        }];
        let (_, out) = with_ctx(&tree, &cluster, |ctx| {
            balancer.simple_determine_rebalance(ctx, &decisions, now)
        });
        assert!(out.exports.is_empty());

        let later = Instant::now();
        let (_, out) = with_ctx(&tree, &cluster, |ctx| {
            balancer.simple_determine_rebalance(ctx, &decisions, later)
        });
        assert_eq!(out.exports, vec![(busy, 1)]);
    }

    #[test]
    fn small_targets_are_skipped() {
        let tree = importing_tree();
        let cluster = FakeCluster::new(1, 3);
        let balancer = Balancer::new(BalancerConfig::default()).unwrap();
        let state = BalanceState {
            targets: BTreeMap::from([(0, 0.05), (2, 1.0)]),
            ..BalanceState::default()
        };
        // 1.0 * 10 * 2 targets is below a target load of 50
        let (_, out) = with_ctx(&tree, &cluster, |ctx| {
            balancer.try_rebalance(ctx, &state, 50.0, Instant::now())
        });
        assert!(out.exports.is_empty());
    }

    #[test]
    fn decisions_export_a_share_of_local_load() {
        let mut tree = ArenaTree::new(0, 0);
        let busy = tree.add_path("/work/busy").unwrap();
        let calm = tree.add_path("/work/calm").unwrap();
        let now = Instant::now();
        let mut balancer = Balancer::new(BalancerConfig::default()).unwrap();
        balancer.hit(&tree, busy, OpType::Read, 28.0, now);
        balancer.hit(&tree, calm, OpType::Read, 72.0, now);
        let cluster = FakeCluster::new(0, 2);
        let decisions = [MigrationDecision {
            target: 1,
            export_load: 25.0,
            export_percent: 0.25,
        }];
        let (_, out) = with_ctx(&tree, &cluster, |ctx| {
            balancer.simple_determine_rebalance(ctx, &decisions, now)
        });
        assert_eq!(out.queue_clears, 1);
        // 25 wanted, the 28 piece is the lucky fit
        assert_eq!(out.exports, vec![(busy, 1)]);
    }

    #[test]
    fn pinned_directories_follow_their_pin() {
        let mut tree = ArenaTree::new(0, 0);
        let pinned = tree.add_path("/projects/alpha").unwrap();
        let dangling = tree.add_path("/projects/beta").unwrap();
        tree.set_export_pin(pinned, Some(1)).unwrap();
        tree.set_export_pin(dangling, Some(9)).unwrap();
        let cluster = FakeCluster::new(0, 2);
        let balancer = Balancer::new(BalancerConfig::default()).unwrap();
        let (_, out) = with_ctx(&tree, &cluster, |ctx| balancer.handle_export_pins(ctx));
        assert_eq!(out.pinned, vec![(pinned, 1)]);
    }

    #[test]
    fn dump_lists_loaded_fragments() {
        let mut tree = ArenaTree::new(0, 0);
        let dir = tree.add_path("/a/b").unwrap();
        tree.add_path("/idle").unwrap();
        let now = Instant::now();
        let mut balancer = Balancer::new(BalancerConfig::default()).unwrap();
        balancer.hit(&tree, dir, OpType::Write, 2.0, now);
        let dump = balancer.dump_loads(&tree, now);
        let paths: Vec<&str> = dump.frags.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["/", "/a", "/a/b"]);
        assert_eq!(dump.frags[2].auth_meta, 4.0);
    }

    #[test]
    fn unknown_forecaster_is_rejected() {
        let config = BalancerConfig {
            forecaster: "model.pkl".to_string(),
            ..BalancerConfig::default()
        };
        assert!(matches!(
            Balancer::new(config),
            Err(BalancerError::UnknownForecaster(_))
        ));
    }
}
