use std::time::{Duration, Instant};

/// Exponential decay with a fixed half-life.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecayRate {
    k: f64,
}

impl DecayRate {
    pub fn new(half_life: Duration) -> Self {
        let secs = half_life.as_secs_f64();
        let k = if secs > 0.0 {
            -std::f64::consts::LN_2 / secs
        } else {
            0.0
        };
        Self { k }
    }
    fn factor(&self, elapsed: Duration) -> f64 {
        (self.k * elapsed.as_secs_f64()).exp()
    }
}

/// A counter whose value halves every half-life. Time is always passed in so the
/// whole tree can be evaluated against the same instant.
#[derive(Clone, Copy, Debug)]
pub struct DecayCounter {
    value: f64,
    stamp: Instant,
}

impl DecayCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            value: 0.0,
            stamp: now,
        }
    }
    pub fn get(&self, rate: DecayRate, now: Instant) -> f64 {
        self.value * rate.factor(now.saturating_duration_since(self.stamp))
    }
    fn decay(&mut self, rate: DecayRate, now: Instant) {
        if now > self.stamp {
            self.value = self.get(rate, now);
            self.stamp = now;
        }
    }
    pub fn hit(&mut self, rate: DecayRate, amount: f64, now: Instant) -> f64 {
        self.adjust(rate, amount, now);
        self.value
    }
    /// Never drops below zero.
    pub fn adjust(&mut self, rate: DecayRate, delta: f64, now: Instant) {
        self.decay(rate, now);
        self.value = (self.value + delta).max(0.0);
    }
    pub fn scale(&mut self, rate: DecayRate, factor: f64, now: Instant) {
        self.decay(rate, now);
        self.value = (self.value * factor).max(0.0);
    }
}
