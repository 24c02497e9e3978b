use std::{collections::VecDeque, time::Instant};

use balancer::{
    Balancer, BalancerMessage, FragmentExecutor, LoadSample, Messenger, MigrationExecutor,
};
use dirtree::{ArenaTree, DirFragId, DirectoryTree, FragTag, Rank, TreeError};
use utilities::logger::{debug, info, trace, warn};

/// Authority change of one fragment, sent to every peer after an export.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportNotice {
    pub path: String,
    pub frag: FragTag,
    pub authority: Rank,
    /// Auth subtree counters of the fragment when it left.
    pub load: LoadSample,
}

#[derive(Default)]
pub struct Outgoing {
    pub messages: Vec<(Rank, BalancerMessage)>,
}

impl Messenger for Outgoing {
    fn send(&mut self, to: Rank, message: BalancerMessage) {
        self.messages.push((to, message));
    }
}

#[derive(Default)]
pub struct ExportRequests {
    pub immediate: Vec<(DirFragId, Rank)>,
    pub nicely: Vec<(DirFragId, Rank)>,
    pub clear_queue: bool,
}

impl MigrationExecutor for ExportRequests {
    fn export_dir(&mut self, frag: DirFragId, target: Rank) {
        self.immediate.push((frag, target));
    }
    fn export_dir_nicely(&mut self, frag: DirFragId, target: Rank) {
        self.nicely.push((frag, target));
    }
    fn clear_export_queue(&mut self) {
        self.clear_queue = true;
        self.nicely.clear();
    }
}

#[derive(Default)]
pub struct FragmentRequests {
    pub splits: Vec<(DirFragId, u8)>,
    pub merges: Vec<(DirFragId, FragTag)>,
}

impl FragmentExecutor for FragmentRequests {
    fn split_dir(&mut self, frag: DirFragId, bits: u8) {
        self.splits.push((frag, bits));
    }
    fn merge_dir(&mut self, frag: DirFragId, into: FragTag) {
        self.merges.push((frag, into));
    }
}

/// Everything the balancer asked for while handling one event.
#[derive(Default)]
pub struct PendingWork {
    pub outgoing: Outgoing,
    pub exports: ExportRequests,
    pub fragments: FragmentRequests,
}

/// Carries out balancer requests on this rank's copy of the namespace.
pub struct TreeExecutor {
    queue: VecDeque<(DirFragId, Rank)>,
    per_tick: usize,
}

impl TreeExecutor {
    pub fn new(per_tick: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            per_tick: per_tick.max(1),
        }
    }
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Applies splits, merges and immediate exports and queues the rest.
    pub fn apply(
        &mut self,
        tree: &mut ArenaTree,
        balancer: &mut Balancer,
        exports: ExportRequests,
        fragments: FragmentRequests,
        now: Instant,
    ) -> Vec<ExportNotice> {
        if exports.clear_queue && !self.queue.is_empty() {
            debug!(dropped = self.queue.len(), "Cleared export queue");
            self.queue.clear();
        }
        for (frag, bits) in fragments.splits {
            match tree.split(frag, bits) {
                Ok(pieces) => balancer.on_split(&pieces, now),
                Err(e) => warn!(error = %e, %frag, "Split failed"),
            }
        }
        let merged_any = !fragments.merges.is_empty();
        for (frag, into) in fragments.merges {
            if let Err(e) = Self::merge(tree, balancer, frag, into, now) {
                warn!(error = %e, %frag, %into, "Merge failed");
            }
        }
        if merged_any {
            balancer.prune(tree);
        }
        for request in exports.nicely {
            if !self.queue.contains(&request) {
                self.queue.push_back(request);
            }
        }
        exports
            .immediate
            .into_iter()
            .filter_map(|(frag, target)| Self::export(tree, balancer, frag, target, now))
            .collect()
    }

    /// Carries out up to `per_tick` queued exports.
    pub fn drain_queue(
        &mut self,
        tree: &mut ArenaTree,
        balancer: &mut Balancer,
        now: Instant,
    ) -> Vec<ExportNotice> {
        let count = self.per_tick.min(self.queue.len());
        self.queue
            .drain(..count)
            .filter_map(|(frag, target)| Self::export(tree, balancer, frag, target, now))
            .collect()
    }

    fn merge(
        tree: &mut ArenaTree,
        balancer: &mut Balancer,
        frag: DirFragId,
        into: FragTag,
        now: Instant,
    ) -> Result<(), TreeError> {
        if !tree.contains(frag) {
            return Err(TreeError::UnknownFrag(frag));
        }
        let merged: Vec<DirFragId> = tree
            .dir_frags(frag)
            .into_iter()
            .filter(|f| into.contains(&tree.frag_tag(*f)))
            .collect();
        let survivor = tree.merge(frag, into)?;
        balancer.on_merge(survivor, &merged, now);
        Ok(())
    }

    fn export(
        tree: &mut ArenaTree,
        balancer: &mut Balancer,
        frag: DirFragId,
        target: Rank,
        now: Instant,
    ) -> Option<ExportNotice> {
        if !tree.contains(frag)
            || !tree.is_auth(frag)
            || tree.is_frozen(frag)
            || tree.is_freezing(frag)
        {
            trace!(%frag, target, "Export no longer possible, skipping");
            return None;
        }
        let notice = ExportNotice {
            path: tree.path(frag),
            frag: tree.frag_tag(frag),
            authority: target,
            load: balancer.accumulator().auth_sample(frag, now),
        };
        balancer.subtract_export(tree, frag, now);
        if let Err(e) = tree.set_subtree_authority(frag, target) {
            warn!(error = %e, %frag, target, "Export failed");
            return None;
        }
        info!(
            path = %notice.path,
            frag = %notice.frag,
            target,
            load = notice.load.meta_load(),
            "Exported dirfrag"
        );
        Some(notice)
    }

    /// Records an export announced by a peer, taking the load over when this
    /// rank is the importer.
    pub fn apply_notice(
        &self,
        tree: &mut ArenaTree,
        balancer: &mut Balancer,
        notice: &ExportNotice,
        now: Instant,
    ) -> Result<(), TreeError> {
        let dir = tree
            .lookup(&notice.path)
            .ok_or_else(|| TreeError::NotFound(notice.path.clone()))?;
        let frag = tree
            .dir_frags(dir)
            .into_iter()
            .find(|f| tree.frag_tag(*f) == notice.frag)
            .unwrap_or(dir);
        tree.set_subtree_authority(frag, notice.authority)?;
        if notice.authority == tree.whoami() {
            balancer.import_with(tree, frag, &notice.load, now);
            info!(
                path = %notice.path,
                frag = %notice.frag,
                load = notice.load.meta_load(),
                "Imported dirfrag"
            );
        } else {
            debug!(path = %notice.path, authority = notice.authority, "Peer export recorded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancer::{BalancerConfig, OpType};

    fn balancer() -> Balancer {
        Balancer::new(BalancerConfig::default()).unwrap()
    }

    #[test]
    fn export_moves_authority_and_load() {
        let mut tree = ArenaTree::new(0, 0);
        let b = tree.add_path("/a/b").unwrap();
        let mut balancer = balancer();
        let now = Instant::now();
        balancer.hit(&tree, b, OpType::Write, 3.0, now);
        let mut executor = TreeExecutor::new(4);
        let notices = executor.apply(
            &mut tree,
            &mut balancer,
            ExportRequests {
                immediate: vec![(b, 1)],
                ..Default::default()
            },
            FragmentRequests::default(),
            now,
        );
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].path, "/a/b");
        assert_eq!(notices[0].authority, 1);
        assert_eq!(notices[0].load.meta_load(), 6.0);
        assert_eq!(tree.authority(b), 1);
        let root = balancer.accumulator().get(tree.root()).unwrap();
        assert!(root.auth_subtree_nested.meta_load(now).abs() < 1e-9);
    }

    #[test]
    fn importer_takes_over_carried_load() {
        let mut tree = ArenaTree::new(1, 0);
        let b = tree.add_path("/a/b").unwrap();
        let mut balancer = balancer();
        let now = Instant::now();
        let mut load = LoadSample::default();
        load.values[OpType::Read.index()] = 8.0;
        let notice = ExportNotice {
            path: "/a/b".to_string(),
            frag: FragTag::ROOT,
            authority: 1,
            load,
        };
        TreeExecutor::new(1)
            .apply_notice(&mut tree, &mut balancer, &notice, now)
            .unwrap();
        assert_eq!(tree.authority(b), 1);
        assert!(tree.is_subtree_root(b));
        assert_eq!(balancer.accumulator().auth_load(b, now), 8.0);
        assert_eq!(balancer.import_map(&tree, now).get(&0), Some(&8.0));
    }

    #[test]
    fn unknown_path_in_notice_is_an_error() {
        let mut tree = ArenaTree::new(1, 0);
        let notice = ExportNotice {
            path: "/missing".to_string(),
            frag: FragTag::ROOT,
            authority: 1,
            load: LoadSample::default(),
        };
        let result =
            TreeExecutor::new(1).apply_notice(&mut tree, &mut balancer(), &notice, Instant::now());
        assert!(matches!(result, Err(TreeError::NotFound(_))));
    }

    #[test]
    fn queued_exports_trickle_out_and_can_be_cleared() {
        let mut tree = ArenaTree::new(0, 0);
        let dirs: Vec<DirFragId> = ["/x", "/y", "/z"]
            .iter()
            .map(|p| tree.add_path(p).unwrap())
            .collect();
        let mut balancer = balancer();
        let now = Instant::now();
        let mut executor = TreeExecutor::new(2);
        let mut requests = ExportRequests::default();
        for dir in &dirs {
            requests.export_dir_nicely(*dir, 1);
        }
        requests.export_dir_nicely(dirs[0], 1);
        let notices = executor.apply(
            &mut tree,
            &mut balancer,
            requests,
            FragmentRequests::default(),
            now,
        );
        assert!(notices.is_empty());
        assert_eq!(executor.queued(), 3);
        assert_eq!(executor.drain_queue(&mut tree, &mut balancer, now).len(), 2);
        assert_eq!(executor.queued(), 1);

        let mut requests = ExportRequests::default();
        requests.clear_export_queue();
        executor.apply(
            &mut tree,
            &mut balancer,
            requests,
            FragmentRequests::default(),
            now,
        );
        assert_eq!(executor.queued(), 0);
        assert_eq!(tree.authority(dirs[2]), 0);
    }

    #[test]
    fn split_then_merge_round_trips_the_directory() {
        let mut tree = ArenaTree::new(0, 0);
        let dir = tree.add_path("/big").unwrap();
        let mut balancer = balancer();
        let now = Instant::now();
        balancer.hit(&tree, dir, OpType::Read, 8.0, now);
        let mut executor = TreeExecutor::new(1);
        executor.apply(
            &mut tree,
            &mut balancer,
            ExportRequests::default(),
            FragmentRequests {
                splits: vec![(dir, 2)],
                ..Default::default()
            },
            now,
        );
        let pieces = tree.dir_frags(dir);
        assert_eq!(pieces.len(), 4);
        for piece in &pieces {
            assert!((balancer.accumulator().auth_load(*piece, now) - 2.0).abs() < 1e-9);
        }
        executor.apply(
            &mut tree,
            &mut balancer,
            ExportRequests::default(),
            FragmentRequests {
                merges: vec![(pieces[1], FragTag::ROOT)],
                ..Default::default()
            },
            now,
        );
        assert_eq!(tree.dir_frags(dir), vec![dir]);
        assert!((balancer.accumulator().auth_load(dir, now) - 8.0).abs() < 1e-9);
    }
}
