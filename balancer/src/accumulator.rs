use std::{collections::HashMap, time::Instant};

use dirtree::{DirFragId, DirectoryTree};
use tracing::trace;

use crate::{
    decay::DecayRate,
    load::{DirFragLoad, LoadSample, LoadVector, OpType},
};

/// Decayed popularity of every fragment this rank has seen, rolled up the tree.
pub struct LoadAccumulator {
    rate: DecayRate,
    loads: HashMap<DirFragId, DirFragLoad>,
}

impl LoadAccumulator {
    pub fn new(rate: DecayRate) -> Self {
        Self {
            rate,
            loads: HashMap::new(),
        }
    }
    pub fn get(&self, frag: DirFragId) -> Option<&DirFragLoad> {
        self.loads.get(&frag)
    }
    fn entry(&mut self, frag: DirFragId, now: Instant) -> &mut DirFragLoad {
        let rate = self.rate;
        self.loads
            .entry(frag)
            .or_insert_with(|| DirFragLoad::new(rate, now))
    }
    pub fn auth_load(&self, frag: DirFragId, now: Instant) -> f64 {
        self.loads
            .get(&frag)
            .map(|load| load.auth_subtree.meta_load(now))
            .unwrap_or(0.0)
    }
    pub fn auth_sample(&self, frag: DirFragId, now: Instant) -> LoadSample {
        self.loads
            .get(&frag)
            .map(|load| load.auth_subtree.sample(now))
            .unwrap_or_default()
    }
    pub fn tracked(&self) -> impl Iterator<Item = (&DirFragId, &DirFragLoad)> {
        self.loads.iter()
    }

    /// Records `amount` hits of `op` on `frag` and returns the new value of the
    /// fragment's own counter for that op.
    ///
    /// `nested` is bumped all the way up. `auth_subtree` stops after the first
    /// subtree root or before a non-auth parent. `auth_subtree_nested` follows
    /// the whole chain as long as `frag` itself is auth.
    pub fn hit(
        &mut self,
        tree: &dyn DirectoryTree,
        frag: DirFragId,
        op: OpType,
        amount: f64,
        now: Instant,
    ) -> f64 {
        let value = self.entry(frag, now).self_load.hit(op, amount, now);
        let is_auth = tree.is_auth(frag);
        let mut hit_subtree = is_auth;
        let mut cursor = Some(frag);
        while let Some(dir) = cursor {
            let parent = tree.parent(dir);
            let load = self.entry(dir, now);
            load.nested.hit(op, amount, now);
            if hit_subtree {
                load.auth_subtree.hit(op, amount, now);
                if tree.is_subtree_root(dir) || parent.is_some_and(|p| !tree.is_auth(p)) {
                    hit_subtree = false;
                }
            }
            if is_auth {
                load.auth_subtree_nested.hit(op, amount, now);
            }
            cursor = parent;
        }
        trace!(%frag, ?op, value, "Hit dirfrag");
        value
    }

    // ancestors whose auth_subtree counts `frag`'s auth_subtree
    fn auth_chain(tree: &dyn DirectoryTree, frag: DirFragId) -> Vec<DirFragId> {
        let mut chain = Vec::new();
        if tree.is_subtree_root(frag) {
            return chain;
        }
        let mut cursor = tree.parent(frag);
        while let Some(dir) = cursor {
            chain.push(dir);
            if tree.is_subtree_root(dir) {
                break;
            }
            cursor = tree.parent(dir);
        }
        chain
    }

    /// Removes the contribution of `frag` from its ancestors before it leaves
    /// this rank. The fragment's own counters are left alone.
    pub fn subtract_export(&mut self, tree: &dyn DirectoryTree, frag: DirFragId, now: Instant) {
        let subload = self.auth_sample(frag, now);
        for dir in Self::auth_chain(tree, frag) {
            self.entry(dir, now).auth_subtree.sub(&subload, now);
        }
        let mut cursor = tree.parent(frag);
        while let Some(dir) = cursor {
            let load = self.entry(dir, now);
            load.nested.sub(&subload, now);
            load.auth_subtree_nested.sub(&subload, now);
            cursor = tree.parent(dir);
        }
        trace!(%frag, meta_load = subload.meta_load(), "Subtracted export");
    }

    /// Adds the contribution of a freshly imported `frag` to its ancestors.
    pub fn add_import(&mut self, tree: &dyn DirectoryTree, frag: DirFragId, now: Instant) {
        let subload = self.auth_sample(frag, now);
        for dir in Self::auth_chain(tree, frag) {
            self.entry(dir, now).auth_subtree.add(&subload, now);
        }
        let mut cursor = tree.parent(frag);
        while let Some(dir) = cursor {
            let load = self.entry(dir, now);
            load.nested.add(&subload, now);
            load.auth_subtree_nested.add(&subload, now);
            cursor = tree.parent(dir);
        }
        trace!(%frag, meta_load = subload.meta_load(), "Added import");
    }

    /// Takes over the counters an exporter sent along with `frag` and rolls
    /// them into the ancestors.
    pub fn import_with(
        &mut self,
        tree: &dyn DirectoryTree,
        frag: DirFragId,
        carried: &LoadSample,
        now: Instant,
    ) {
        let load = self.entry(frag, now);
        load.nested.add(carried, now);
        load.auth_subtree.add(carried, now);
        load.auth_subtree_nested.add(carried, now);
        self.add_import(tree, frag, now);
    }

    /// Moves the contribution of `frag` from the chain above `old_parent` to the
    /// chain above `new_parent`.
    pub fn adjust_for_rename(
        &mut self,
        tree: &dyn DirectoryTree,
        old_parent: Option<DirFragId>,
        new_parent: Option<DirFragId>,
        frag: DirFragId,
        now: Instant,
    ) {
        let Some(moved) = self.loads.get(&frag) else {
            return;
        };
        let nested = moved.nested.sample(now);
        let auth_subtree = moved.auth_subtree.sample(now);
        let auth_nested = moved.auth_subtree_nested.sample(now);
        let is_auth = tree.is_auth(frag);
        let adjust_subtree = is_auth && !tree.is_subtree_root(frag);
        for (start, sign) in [(old_parent, -1.0), (new_parent, 1.0)] {
            let mut in_subtree = adjust_subtree;
            let mut cursor = start;
            while let Some(dir) = cursor {
                let load = self.entry(dir, now);
                apply(&mut load.nested, &nested, sign, now);
                if in_subtree {
                    apply(&mut load.auth_subtree, &auth_subtree, sign, now);
                }
                if is_auth {
                    apply(&mut load.auth_subtree_nested, &auth_nested, sign, now);
                }
                if tree.is_subtree_root(dir) {
                    in_subtree = false;
                }
                cursor = tree.parent(dir);
            }
        }
    }

    pub fn roll_epoch(&mut self, now: Instant) {
        for load in self.loads.values_mut() {
            load.roll_epoch(now);
        }
    }

    /// Spreads the counters of a split fragment evenly over its pieces.
    pub fn split(&mut self, pieces: &[DirFragId], now: Instant) {
        let Some(first) = pieces.first() else {
            return;
        };
        let Some(mut template) = self.loads.get(first).cloned() else {
            return;
        };
        template.scale(1.0 / pieces.len() as f64, now);
        for piece in pieces {
            self.loads.insert(*piece, template.clone());
        }
    }

    /// Folds the counters of merged away fragments into the survivor.
    pub fn merge(&mut self, survivor: DirFragId, merged: &[DirFragId], now: Instant) {
        for frag in merged.iter().filter(|f| **f != survivor) {
            if let Some(load) = self.loads.remove(frag) {
                self.entry(survivor, now).absorb(&load, now);
            }
        }
    }

    /// Drops counters of fragments that no longer exist.
    pub fn prune(&mut self, tree: &dyn DirectoryTree) {
        self.loads.retain(|frag, _| tree.contains(*frag));
    }
}

fn apply(vector: &mut LoadVector, sample: &LoadSample, sign: f64, now: Instant) {
    if sign < 0.0 {
        vector.sub(sample, now);
    } else {
        vector.add(sample, now);
    }
}
