use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::decay::{DecayCounter, DecayRate};

pub const OP_COUNT: usize = 5;
/// Epochs of per-fragment history kept for forecasting.
pub const RECENT_LOAD_EPOCHS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Read,
    Write,
    Readdir,
    Fetch,
    Store,
}

impl OpType {
    pub const ALL: [OpType; OP_COUNT] = [
        OpType::Read,
        OpType::Write,
        OpType::Readdir,
        OpType::Fetch,
        OpType::Store,
    ];
    pub fn index(self) -> usize {
        self as usize
    }
    /// Weight of one hit of this type in the meta load.
    pub fn meta_weight(self) -> f64 {
        match self {
            OpType::Read => 1.0,
            OpType::Write => 2.0,
            OpType::Readdir => 1.0,
            OpType::Fetch => 2.0,
            OpType::Store => 4.0,
        }
    }
}

/// Plain values of a [`LoadVector`] at one instant, what travels in heartbeats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub values: [f64; OP_COUNT],
}

impl LoadSample {
    pub fn get(&self, op: OpType) -> f64 {
        self.values[op.index()]
    }
    pub fn meta_load(&self) -> f64 {
        OpType::ALL
            .iter()
            .map(|op| op.meta_weight() * self.get(*op))
            .sum()
    }
    pub fn add(&mut self, other: &LoadSample) {
        for (mine, theirs) in self.values.iter_mut().zip(other.values.iter()) {
            *mine += theirs;
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoadVector {
    rate: DecayRate,
    counters: [DecayCounter; OP_COUNT],
}

impl LoadVector {
    pub fn new(rate: DecayRate, now: Instant) -> Self {
        Self {
            rate,
            counters: [DecayCounter::new(now); OP_COUNT],
        }
    }
    pub fn hit(&mut self, op: OpType, amount: f64, now: Instant) -> f64 {
        self.counters[op.index()].hit(self.rate, amount, now)
    }
    pub fn adjust(&mut self, op: OpType, delta: f64, now: Instant) {
        self.counters[op.index()].adjust(self.rate, delta, now);
    }
    pub fn value(&self, op: OpType, now: Instant) -> f64 {
        self.counters[op.index()].get(self.rate, now)
    }
    pub fn add(&mut self, other: &LoadSample, now: Instant) {
        for op in OpType::ALL {
            self.adjust(op, other.get(op), now);
        }
    }
    pub fn sub(&mut self, other: &LoadSample, now: Instant) {
        for op in OpType::ALL {
            self.adjust(op, -other.get(op), now);
        }
    }
    pub fn scale(&mut self, factor: f64, now: Instant) {
        let rate = self.rate;
        for counter in self.counters.iter_mut() {
            counter.scale(rate, factor, now);
        }
    }
    pub fn sample(&self, now: Instant) -> LoadSample {
        let mut sample = LoadSample::default();
        for op in OpType::ALL {
            sample.values[op.index()] = self.value(op, now);
        }
        sample
    }
    pub fn meta_load(&self, now: Instant) -> f64 {
        self.sample(now).meta_load()
    }
}

/// Counters attached to one dirfrag.
#[derive(Clone, Debug)]
pub struct DirFragLoad {
    /// Hits on the fragment itself.
    pub self_load: LoadVector,
    /// Hits anywhere below, whoever serves them.
    pub nested: LoadVector,
    /// Hits below that stay inside this rank's authority region.
    pub auth_subtree: LoadVector,
    /// Hits below on fragments this rank is authority for.
    pub auth_subtree_nested: LoadVector,
    history: Vec<LoadSample>,
}

impl DirFragLoad {
    pub fn new(rate: DecayRate, now: Instant) -> Self {
        Self {
            self_load: LoadVector::new(rate, now),
            nested: LoadVector::new(rate, now),
            auth_subtree: LoadVector::new(rate, now),
            auth_subtree_nested: LoadVector::new(rate, now),
            history: Vec::new(),
        }
    }
    /// Auth subtree samples of the last epochs, oldest first.
    pub fn history(&self) -> &[LoadSample] {
        &self.history
    }
    pub fn roll_epoch(&mut self, now: Instant) {
        if self.history.len() == RECENT_LOAD_EPOCHS {
            self.history.remove(0);
        }
        self.history.push(self.auth_subtree.sample(now));
    }
    pub fn scale(&mut self, factor: f64, now: Instant) {
        self.self_load.scale(factor, now);
        self.nested.scale(factor, now);
        self.auth_subtree.scale(factor, now);
        self.auth_subtree_nested.scale(factor, now);
    }
    pub fn absorb(&mut self, other: &DirFragLoad, now: Instant) {
        self.self_load.add(&other.self_load.sample(now), now);
        self.nested.add(&other.nested.sample(now), now);
        self.auth_subtree.add(&other.auth_subtree.sample(now), now);
        self.auth_subtree_nested
            .add(&other.auth_subtree_nested.sample(now), now);
    }
}
