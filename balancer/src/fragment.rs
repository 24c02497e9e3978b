use serde::Serialize;
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use dirtree::{DirFragId, DirectoryTree, FragTag, frag::MAX_FRAG_BITS};
use tracing::{debug, trace};

use crate::{config::BalancerConfig, host::FragmentExecutor};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Split,
    Merge,
}

/// Debounced split or merge request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentWork {
    pub frag: DirFragId,
    pub kind: FragmentKind,
    pub due: Instant,
}

// min-heap on due time
impl Ord for FragmentWork {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.frag.cmp(&self.frag))
    }
}

impl PartialOrd for FragmentWork {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Decides when directory fragments are split or merged back, based on their
/// entry counts and hit rates.
pub struct FragmentationController {
    enabled: bool,
    interval: Duration,
    split_size: usize,
    split_bits: u8,
    fast_factor: f64,
    merge_size: usize,
    split_pending: HashSet<DirFragId>,
    merge_pending: HashSet<DirFragId>,
    immediate: VecDeque<DirFragId>,
    fast_queued: HashSet<DirFragId>,
    timers: BinaryHeap<FragmentWork>,
}

impl FragmentationController {
    pub fn new(config: &BalancerConfig) -> Self {
        Self {
            enabled: config.fragment_dirs,
            interval: config.fragment_interval(),
            split_size: config.split_size,
            split_bits: config.split_bits,
            fast_factor: config.fragment_fast_factor,
            merge_size: config.merge_size,
            split_pending: HashSet::new(),
            merge_pending: HashSet::new(),
            immediate: VecDeque::new(),
            fast_queued: HashSet::new(),
            timers: BinaryHeap::new(),
        }
    }
    pub fn split_pending(&self) -> &HashSet<DirFragId> {
        &self.split_pending
    }
    pub fn merge_pending(&self) -> &HashSet<DirFragId> {
        &self.merge_pending
    }
    /// Splits waiting for the end of the current dispatch cycle.
    pub fn immediate_len(&self) -> usize {
        self.immediate.len()
    }
    /// Due time of the earliest debounced request.
    pub fn next_due(&self) -> Option<Instant> {
        self.timers.peek().map(|work| work.due)
    }

    fn should_split(&self, tree: &dyn DirectoryTree, frag: DirFragId) -> bool {
        tree.frag_size(frag) > self.split_size
    }
    fn should_split_fast(&self, tree: &dyn DirectoryTree, frag: DirFragId) -> bool {
        tree.frag_size(frag) as f64 > self.split_size as f64 * self.fast_factor
    }
    fn should_merge(&self, tree: &dyn DirectoryTree, frag: DirFragId) -> bool {
        tree.frag_size(frag) < self.merge_size
    }

    fn queue_fast(&mut self, frag: DirFragId) {
        if self.fast_queued.insert(frag) {
            self.immediate.push_back(frag);
        }
    }

    pub fn maybe_fragment(
        &mut self,
        tree: &dyn DirectoryTree,
        frag: DirFragId,
        hot: bool,
        now: Instant,
    ) {
        if !self.enabled
            || self.interval.is_zero()
            || !tree.is_auth(frag)
            || tree.is_base(frag)
            || tree.is_stray(frag)
        {
            return;
        }
        if self.split_size > 0 && (hot || self.should_split(tree, frag)) {
            if self.split_pending.insert(frag) {
                if hot {
                    debug!(%frag, "Queued immediate split of hot dirfrag");
                    self.queue_fast(frag);
                } else {
                    debug!(%frag, "Queued split");
                    self.timers.push(FragmentWork {
                        frag,
                        kind: FragmentKind::Split,
                        due: now + self.interval,
                    });
                }
            } else if self.should_split_fast(tree, frag) {
                trace!(%frag, "Promoted pending split");
                self.queue_fast(frag);
            }
        }
        if !tree.frag_tag(frag).is_root()
            && self.should_merge(tree, frag)
            && self.merge_pending.insert(frag)
        {
            debug!(%frag, "Queued merge");
            self.timers.push(FragmentWork {
                frag,
                kind: FragmentKind::Merge,
                due: now + self.interval,
            });
        }
    }

    /// Fires the immediate splits and every debounced request that is due.
    /// Returns the requests actually handed to `fragmenter`.
    pub fn drain(
        &mut self,
        tree: &dyn DirectoryTree,
        fragmenter: &mut dyn FragmentExecutor,
        now: Instant,
    ) -> Vec<FragmentWork> {
        let mut fired = Vec::new();
        while let Some(frag) = self.immediate.pop_front() {
            self.fast_queued.remove(&frag);
            if self.fire_split(tree, fragmenter, frag) {
                fired.push(FragmentWork {
                    frag,
                    kind: FragmentKind::Split,
                    due: now,
                });
            }
        }
        while self.timers.peek().is_some_and(|work| work.due <= now) {
            let Some(work) = self.timers.pop() else {
                break;
            };
            let done = match work.kind {
                FragmentKind::Split => self.fire_split(tree, fragmenter, work.frag),
                FragmentKind::Merge => self.fire_merge(tree, fragmenter, work.frag),
            };
            if done {
                fired.push(work);
            }
        }
        fired
    }

    fn still_valid(tree: &dyn DirectoryTree, frag: DirFragId) -> bool {
        tree.contains(frag) && tree.is_auth(frag) && !tree.is_frozen(frag) && !tree.is_freezing(frag)
    }

    fn fire_split(
        &mut self,
        tree: &dyn DirectoryTree,
        fragmenter: &mut dyn FragmentExecutor,
        frag: DirFragId,
    ) -> bool {
        // already handled through the other queue
        if !self.split_pending.remove(&frag) {
            return false;
        }
        if !Self::still_valid(tree, frag) {
            debug!(%frag, "Dropped stale split");
            return false;
        }
        fragmenter.split_dir(frag, self.split_bits);
        true
    }

    fn fire_merge(
        &mut self,
        tree: &dyn DirectoryTree,
        fragmenter: &mut dyn FragmentExecutor,
        frag: DirFragId,
    ) -> bool {
        if !self.merge_pending.remove(&frag) {
            return false;
        }
        if !Self::still_valid(tree, frag) {
            debug!(%frag, "Dropped stale merge");
            return false;
        }
        let own = tree.frag_tag(frag);
        let siblings = tree.dir_frags(frag);
        let mut target = own;
        while let Some(parent) = target.parent() {
            if !self.all_mergeable(tree, &siblings, parent) {
                break;
            }
            target = parent;
        }
        if target == own {
            trace!(%frag, tag = %own, "Nothing to merge");
            return false;
        }
        debug!(%frag, from = %own, into = %target, "Merging dirfrags");
        fragmenter.merge_dir(frag, target);
        true
    }

    // every fragment under `tag` exists here, is ours and is small enough
    fn all_mergeable(&self, tree: &dyn DirectoryTree, siblings: &[DirFragId], tag: FragTag) -> bool {
        let mut covered: u64 = 0;
        for sibling in siblings {
            let sibling_tag = tree.frag_tag(*sibling);
            if !tag.contains(&sibling_tag) {
                continue;
            }
            if !Self::still_valid(tree, *sibling) || !self.should_merge(tree, *sibling) {
                return false;
            }
            covered += 1u64 << (MAX_FRAG_BITS - sibling_tag.bits());
        }
        covered == 1u64 << (MAX_FRAG_BITS - tag.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirtree::ArenaTree;

    #[derive(Default)]
    struct Recorder {
        splits: Vec<(DirFragId, u8)>,
        merges: Vec<(DirFragId, FragTag)>,
    }

    impl FragmentExecutor for Recorder {
        fn split_dir(&mut self, frag: DirFragId, bits: u8) {
            self.splits.push((frag, bits));
        }
        fn merge_dir(&mut self, frag: DirFragId, into: FragTag) {
            self.merges.push((frag, into));
        }
    }

    fn config() -> BalancerConfig {
        BalancerConfig {
            split_size: 100,
            merge_size: 10,
            fragment_interval_ms: 1000,
            ..BalancerConfig::default()
        }
    }

    #[test]
    fn hot_fragment_is_queued_once() {
        let mut tree = ArenaTree::new(0, 0);
        let dir = tree.add_path("/busy").unwrap();
        tree.set_size(dir, 50).unwrap();
        let mut fragments = FragmentationController::new(&config());
        let now = Instant::now();
        fragments.maybe_fragment(&tree, dir, true, now);
        fragments.maybe_fragment(&tree, dir, true, now);
        assert_eq!(fragments.split_pending().len(), 1);
        assert!(fragments.split_pending().contains(&dir));
        assert_eq!(fragments.immediate_len(), 1);

        let mut recorder = Recorder::default();
        let fired = fragments.drain(&tree, &mut recorder, now);
        assert_eq!(fired.len(), 1);
        assert_eq!(recorder.splits, vec![(dir, 3)]);
        assert!(fragments.split_pending().is_empty());
    }

    #[test]
    fn large_fragment_waits_for_the_interval() {
        let mut tree = ArenaTree::new(0, 0);
        let dir = tree.add_path("/big").unwrap();
        tree.set_size(dir, 120).unwrap();
        let mut fragments = FragmentationController::new(&config());
        let now = Instant::now();
        fragments.maybe_fragment(&tree, dir, false, now);
        let mut recorder = Recorder::default();
        assert!(fragments.drain(&tree, &mut recorder, now).is_empty());
        assert_eq!(fragments.next_due(), Some(now + Duration::from_secs(1)));
        fragments.drain(&tree, &mut recorder, now + Duration::from_secs(1));
        assert_eq!(recorder.splits.len(), 1);
    }

    #[test]
    fn much_larger_fragment_skips_the_wait() {
        let mut tree = ArenaTree::new(0, 0);
        let dir = tree.add_path("/big").unwrap();
        tree.set_size(dir, 120).unwrap();
        let mut fragments = FragmentationController::new(&config());
        let now = Instant::now();
        fragments.maybe_fragment(&tree, dir, false, now);
        tree.set_size(dir, 200).unwrap();
        fragments.maybe_fragment(&tree, dir, false, now);
        let mut recorder = Recorder::default();
        fragments.drain(&tree, &mut recorder, now);
        assert_eq!(recorder.splits.len(), 1);
        // the debounced entry finds nothing pending anymore
        fragments.drain(&tree, &mut recorder, now + Duration::from_secs(5));
        assert_eq!(recorder.splits.len(), 1);
    }

    #[test]
    fn frozen_at_fire_time_is_dropped() {
        let mut tree = ArenaTree::new(0, 0);
        let dir = tree.add_path("/big").unwrap();
        tree.set_size(dir, 120).unwrap();
        let mut fragments = FragmentationController::new(&config());
        let now = Instant::now();
        fragments.maybe_fragment(&tree, dir, false, now);
        tree.set_frozen(dir, true).unwrap();
        let mut recorder = Recorder::default();
        fragments.drain(&tree, &mut recorder, now + Duration::from_secs(2));
        assert!(recorder.splits.is_empty());
    }

    #[test]
    fn root_and_foreign_fragments_are_left_alone() {
        let mut tree = ArenaTree::new(0, 1);
        let foreign = tree.add_path("/theirs").unwrap();
        tree.set_size(foreign, 500).unwrap();
        tree.set_size(tree.root(), 500).unwrap();
        let mut fragments = FragmentationController::new(&config());
        fragments.maybe_fragment(&tree, foreign, true, Instant::now());
        fragments.maybe_fragment(&tree, tree.root(), true, Instant::now());
        assert!(fragments.split_pending().is_empty());
    }

    #[test]
    fn merges_up_to_widest_mergeable_tag() {
        let mut tree = ArenaTree::new(0, 0);
        let dir = tree.add_path("/d").unwrap();
        let pieces = tree.split(dir, 2).unwrap();
        for piece in &pieces {
            tree.set_size(*piece, 1).unwrap();
        }
        let mut fragments = FragmentationController::new(&config());
        let now = Instant::now();
        fragments.maybe_fragment(&tree, pieces[0], false, now);
        assert!(fragments.merge_pending().contains(&pieces[0]));
        let mut recorder = Recorder::default();
        fragments.drain(&tree, &mut recorder, now + Duration::from_secs(1));
        assert_eq!(recorder.merges, vec![(pieces[0], FragTag::ROOT)]);
    }

    #[test]
    fn busy_sibling_limits_the_merge() {
        let mut tree = ArenaTree::new(0, 0);
        let dir = tree.add_path("/d").unwrap();
        let pieces = tree.split(dir, 2).unwrap();
        for piece in &pieces {
            tree.set_size(*piece, 1).unwrap();
        }
        // the 11 piece stays large, only 00 and 01 can fold together
        tree.set_size(pieces[3], 50).unwrap();
        let mut fragments = FragmentationController::new(&config());
        let now = Instant::now();
        fragments.maybe_fragment(&tree, pieces[0], false, now);
        let mut recorder = Recorder::default();
        fragments.drain(&tree, &mut recorder, now + Duration::from_secs(1));
        assert_eq!(recorder.merges, vec![(pieces[0], FragTag::new(0, 1).unwrap())]);
    }
}
