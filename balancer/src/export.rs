use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use dirtree::{DirFragId, DirectoryTree, Rank};
use tracing::{debug, trace};
use xxhash_rust::xxh64::xxh64;

use crate::{
    accumulator::LoadAccumulator,
    classifier::{PathClassifier, WorkloadType},
    config::BalancerConfig,
    forecast::LoadForecaster,
};

/// How the export search reads the load of a fragment.
pub struct LoadView<'a> {
    pub accumulator: &'a LoadAccumulator,
    pub forecaster: Option<&'a dyn LoadForecaster>,
    pub now: Instant,
}

impl LoadView<'_> {
    /// Forecast of the next epoch when one is available, the decayed auth
    /// subtree load otherwise.
    pub fn load(&self, frag: DirFragId) -> f64 {
        if let (Some(forecaster), Some(load)) = (self.forecaster, self.accumulator.get(frag)) {
            if !load.history().is_empty() {
                match forecaster.predict(load.history()) {
                    Ok(predicted) => return predicted,
                    Err(e) => trace!(%frag, error = %e, "Forecast failed, using decayed load"),
                }
            }
        }
        self.accumulator.auth_load(frag, self.now)
    }
}

/// State of one planning pass. Fragments picked by earlier searches of the
/// pass stay excluded.
pub struct ExportSearch<'a> {
    tree: &'a dyn DirectoryTree,
    loads: &'a LoadView<'a>,
    started: Instant,
    target: Rank,
    cluster_size: usize,
    chosen: Vec<DirFragId>,
    already: HashSet<DirFragId>,
    skip_pos: usize,
}

impl<'a> ExportSearch<'a> {
    pub fn new(
        tree: &'a dyn DirectoryTree,
        loads: &'a LoadView<'a>,
        started: Instant,
        cluster_size: usize,
    ) -> Self {
        Self {
            tree,
            loads,
            started,
            target: 0,
            cluster_size,
            chosen: Vec::new(),
            already: HashSet::new(),
            skip_pos: cluster_size,
        }
    }
    /// Rank the next searches pick fragments for.
    pub fn retarget(&mut self, target: Rank) {
        self.target = target;
        self.chosen.clear();
        self.skip_pos = self.cluster_size;
    }
    pub fn exclude(&mut self, frags: impl IntoIterator<Item = DirFragId>) {
        self.already.extend(frags);
    }
    pub fn is_excluded(&self, frag: DirFragId) -> bool {
        self.already.contains(&frag)
    }
    /// Fragments picked since the last `retarget`.
    pub fn chosen(&self) -> &[DirFragId] {
        &self.chosen
    }
    pub fn take_chosen(&mut self) -> Vec<DirFragId> {
        std::mem::take(&mut self.chosen)
    }
    pub fn load(&self, frag: DirFragId) -> f64 {
        self.loads.load(frag)
    }
    fn choose(&mut self, frag: DirFragId) {
        self.chosen.push(frag);
        self.already.insert(frag);
    }
    fn candidate(&self, frag: DirFragId) -> bool {
        !self.already.contains(&frag)
            && self.tree.is_auth(frag)
            && !self.tree.is_frozen(frag)
            && !self.tree.is_freezing(frag)
            && !self.tree.is_stray(frag)
            && self.tree.export_pin(frag).is_none()
    }

    // small fragments hashing to the target always pass, one in every
    // cluster_size + 1 of the others gets through as well
    fn hash_admits(&mut self, frag: DirFragId) -> bool {
        let n = self.cluster_size.max(1) as u64;
        let key = self
            .tree
            .ino(frag)
            .wrapping_add(u64::from(self.tree.frag_tag(frag).value()));
        if xxh64(&key.to_le_bytes(), 0) % n == u64::from(self.target) {
            self.skip_pos = 0;
            return true;
        }
        self.skip_pos += 1;
        if self.skip_pos as u64 > n {
            self.skip_pos = 0;
            return true;
        }
        false
    }
}

/// Recursive search for fragments whose load adds up to a requested amount.
#[derive(Clone, Debug)]
pub struct ExportSelector {
    min_start: f64,
    need_min: f64,
    need_max: f64,
    midchunk: f64,
    minchunk: f64,
    budget: Duration,
    hash_fragmentation: bool,
}

impl ExportSelector {
    pub fn new(config: &BalancerConfig) -> Self {
        Self {
            min_start: config.min_start,
            need_min: config.need_min,
            need_max: config.need_max,
            midchunk: config.midchunk,
            minchunk: config.minchunk,
            budget: config.export_search_budget(),
            hash_fragmentation: config.hash_fragmentation,
        }
    }

    /// Searches below `frag` for fragments worth `amount` and returns the ones
    /// picked by this call together with the load gathered.
    pub fn select(
        &self,
        search: &mut ExportSearch<'_>,
        frag: DirFragId,
        amount: f64,
    ) -> (Vec<DirFragId>, f64) {
        let before = search.chosen.len();
        let mut have = 0.0;
        self.find_exports(search, frag, amount, &mut have);
        (search.chosen[before..].to_vec(), have)
    }

    pub fn find_exports(
        &self,
        search: &mut ExportSearch<'_>,
        frag: DirFragId,
        amount: f64,
        have: &mut f64,
    ) {
        // `started` may lie ahead of the wall clock when callers drive their own time
        if Instant::now().saturating_duration_since(search.started) >= self.budget {
            debug!(%frag, amount, have = *have, "Export search ran out of time");
            *have = amount;
            return;
        }
        let need = amount - *have;
        if need < amount * self.min_start {
            return;
        }
        let need_max = need * self.need_max;
        let need_min = need * self.need_min;
        let midchunk = need * self.midchunk;
        let minchunk = need * self.minchunk;

        let mut bigger_rep = Vec::new();
        let mut bigger_unrep = Vec::new();
        let mut smaller = Vec::new();
        for child in search.tree.children(frag) {
            if !search.candidate(child) {
                continue;
            }
            let pop = search.load(child);
            if pop < minchunk {
                continue;
            }
            if need_min < pop && pop < need_max {
                trace!(%child, pop, need, "Lucky fit");
                search.choose(child);
                *have += pop;
                return;
            }
            if pop > need {
                if search.tree.is_replicated(child) {
                    bigger_rep.push(child);
                } else {
                    bigger_unrep.push(child);
                }
            } else if !self.hash_fragmentation || search.hash_admits(child) {
                smaller.push((pop, child));
            }
        }
        smaller.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut next = 0;
        while next < smaller.len() && smaller[next].0 >= midchunk {
            let (pop, child) = smaller[next];
            next += 1;
            search.choose(child);
            *have += pop;
            if *have > need_min {
                return;
            }
        }
        for child in bigger_unrep {
            self.find_exports(search, child, amount, have);
            if *have > need_min {
                return;
            }
        }
        for (pop, child) in smaller[next..].iter().copied() {
            search.choose(child);
            *have += pop;
            if *have > need_min {
                return;
            }
        }
        for child in bigger_rep {
            self.find_exports(search, child, amount, have);
            if *have > need_min {
                return;
            }
        }
    }

    /// Runs the search at the level the workload of `frag` concentrates its load.
    pub fn find_exports_steered(
        &self,
        search: &mut ExportSearch<'_>,
        classifier: &dyn PathClassifier,
        frag: DirFragId,
        amount: f64,
        have: &mut f64,
    ) {
        let tree = search.tree;
        if tree.is_stray(frag) {
            return;
        }
        match classifier.classify(&tree.path(frag)) {
            WorkloadType::HotRoot => {
                let grandchildren: Vec<DirFragId> = tree
                    .children(frag)
                    .into_iter()
                    .flat_map(|child| tree.children(child))
                    .collect();
                for grandchild in grandchildren {
                    if *have >= amount * self.need_min {
                        break;
                    }
                    if search.candidate(grandchild) && search.load(grandchild) > 0.1 * amount {
                        self.find_exports(search, grandchild, amount, have);
                    }
                }
            }
            WorkloadType::Scan => {
                let start = match tree.parent(frag) {
                    Some(parent) if tree.is_auth(parent) => parent,
                    _ => frag,
                };
                self.find_exports(search, start, amount, have);
            }
            WorkloadType::Generic => self.find_exports(search, frag, amount, have),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        classifier::{PrefixClassifier, WorkloadRule},
        decay::DecayRate,
        load::OpType,
    };
    use dirtree::ArenaTree;

    fn selector(config: BalancerConfig) -> ExportSelector {
        ExportSelector::new(&BalancerConfig {
            export_search_budget_ms: 60_000,
            ..config
        })
    }

    // /d with children c0..cN, each hit with the given read load
    fn fixture(loads: &[f64], now: Instant) -> (ArenaTree, LoadAccumulator, Vec<DirFragId>) {
        let mut tree = ArenaTree::new(0, 0);
        let mut children = Vec::new();
        for i in 0..loads.len() {
            children.push(tree.add_path(&format!("/d/c{i}")).unwrap());
        }
        let mut acc = LoadAccumulator::new(DecayRate::new(Duration::from_secs(5)));
        for (child, load) in children.iter().zip(loads) {
            acc.hit(&tree, *child, OpType::Read, *load, now);
        }
        (tree, acc, children)
    }

    #[test]
    fn lucky_fit_is_taken_immediately() {
        let now = Instant::now();
        let (tree, acc, children) = fixture(&[50.0, 30.0], now);
        let view = LoadView {
            accumulator: &acc,
            forecaster: None,
            now,
        };
        let selector = selector(BalancerConfig {
            need_min: 0.5,
            need_max: 1.5,
            ..BalancerConfig::default()
        });
        let mut search = ExportSearch::new(&tree, &view, Instant::now(), 2);
        let d = tree.lookup("/d").unwrap();
        let (chosen, achieved) = selector.select(&mut search, d, 40.0);
        assert_eq!(chosen, vec![children[0]]);
        assert_eq!(achieved, 50.0);
    }

    #[test]
    fn skips_chosen_frozen_and_freezing() {
        let now = Instant::now();
        let (mut tree, acc, children) = fixture(&[10.0, 10.0, 10.0, 10.0, 10.0], now);
        tree.set_frozen(children[0], true).unwrap();
        tree.set_freezing(children[1], true).unwrap();
        let view = LoadView {
            accumulator: &acc,
            forecaster: None,
            now,
        };
        let selector = selector(BalancerConfig::default());
        let mut search = ExportSearch::new(&tree, &view, Instant::now(), 2);
        search.exclude([children[2]]);
        let d = tree.lookup("/d").unwrap();
        let (chosen, achieved) = selector.select(&mut search, d, 100.0);
        assert_eq!(chosen.len(), 2);
        assert!(chosen.contains(&children[3]) && chosen.contains(&children[4]));
        assert_eq!(achieved, 20.0);
        // a second search of the same pass does not pick them again
        let (again, _) = selector.select(&mut search, d, 100.0);
        assert!(again.is_empty());
    }

    #[test]
    fn descends_into_bigger_fragments() {
        let now = Instant::now();
        let mut tree = ArenaTree::new(0, 0);
        let small = tree.add_path("/d/big/small").unwrap();
        let tiny = tree.add_path("/d/big/tiny").unwrap();
        let mut acc = LoadAccumulator::new(DecayRate::new(Duration::from_secs(5)));
        acc.hit(&tree, small, OpType::Read, 9.0, now);
        acc.hit(&tree, tiny, OpType::Read, 3.0, now);
        let view = LoadView {
            accumulator: &acc,
            forecaster: None,
            now,
        };
        let selector = selector(BalancerConfig::default());
        let mut search = ExportSearch::new(&tree, &view, Instant::now(), 2);
        let d = tree.lookup("/d").unwrap();
        // /d/big carries 12, far more than needed
        let (chosen, achieved) = selector.select(&mut search, d, 8.0);
        assert_eq!(chosen, vec![small]);
        assert_eq!(achieved, 9.0);
    }

    #[test]
    fn out_of_time_reports_success_without_picking() {
        let now = Instant::now();
        let (tree, acc, _) = fixture(&[10.0, 10.0], now);
        let view = LoadView {
            accumulator: &acc,
            forecaster: None,
            now,
        };
        let selector = ExportSelector::new(&BalancerConfig {
            export_search_budget_ms: 0,
            ..BalancerConfig::default()
        });
        let mut search = ExportSearch::new(&tree, &view, Instant::now(), 2);
        let d = tree.lookup("/d").unwrap();
        let (chosen, achieved) = selector.select(&mut search, d, 15.0);
        assert!(chosen.is_empty());
        assert_eq!(achieved, 15.0);
    }

    #[test]
    fn hash_mode_prefers_fragments_of_the_target() {
        let now = Instant::now();
        let (tree, acc, children) = fixture(&[1.0; 8], now);
        let view = LoadView {
            accumulator: &acc,
            forecaster: None,
            now,
        };
        let selector = selector(BalancerConfig {
            hash_fragmentation: true,
            minchunk: 0.001,
            ..BalancerConfig::default()
        });
        let mut search = ExportSearch::new(&tree, &view, Instant::now(), 2);
        search.retarget(1);
        let d = tree.lookup("/d").unwrap();
        let (chosen, _) = selector.select(&mut search, d, 100.0);
        let hashes_to_target = |frag: &DirFragId| {
            let key = tree.ino(*frag) + u64::from(tree.frag_tag(*frag).value());
            xxh64(&key.to_le_bytes(), 0) % 2 == 1
        };
        let matching: Vec<_> = children.iter().filter(|c| hashes_to_target(c)).collect();
        for frag in &matching {
            assert!(chosen.contains(frag));
        }
        if children.len() - matching.len() >= 2 {
            assert!(chosen.len() < children.len());
        }
    }

    #[test]
    fn hot_root_searches_grandchildren() {
        let now = Instant::now();
        let mut tree = ArenaTree::new(0, 0);
        let hot = tree.add_path("/hot/a/x").unwrap();
        let cold = tree.add_path("/hot/b/y").unwrap();
        let leaf = tree.add_path("/hot/a/x/leaf").unwrap();
        let mut acc = LoadAccumulator::new(DecayRate::new(Duration::from_secs(5)));
        acc.hit(&tree, leaf, OpType::Read, 10.0, now);
        acc.hit(&tree, cold, OpType::Read, 0.01, now);
        let view = LoadView {
            accumulator: &acc,
            forecaster: None,
            now,
        };
        let classifier = PrefixClassifier::new(vec![WorkloadRule {
            prefix: "/hot".to_string(),
            workload: WorkloadType::HotRoot,
        }]);
        let selector = selector(BalancerConfig::default());
        let mut search = ExportSearch::new(&tree, &view, Instant::now(), 2);
        let root = tree.lookup("/hot").unwrap();
        let mut have = 0.0;
        selector.find_exports_steered(&mut search, &classifier, root, 10.0, &mut have);
        assert_eq!(search.chosen(), &[leaf]);
        assert!(!search.chosen().contains(&hot));
        assert_eq!(have, 10.0);
    }
}
