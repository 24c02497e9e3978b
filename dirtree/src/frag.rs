use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of one fragment inside its directory's hash space. A directory starts
/// as the single root fragment (`bits == 0`); splitting by `n` bits yields `2^n`
/// children whose values extend the parent's value on the right.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragTag {
    value: u32,
    bits: u8,
}

pub const MAX_FRAG_BITS: u8 = 24;

impl FragTag {
    pub const ROOT: FragTag = FragTag { value: 0, bits: 0 };

    pub fn new(value: u32, bits: u8) -> Option<Self> {
        if bits > MAX_FRAG_BITS || (value >> bits) != 0 {
            return None;
        }
        Some(Self { value, bits })
    }
    pub fn value(&self) -> u32 {
        self.value
    }
    pub fn bits(&self) -> u8 {
        self.bits
    }
    pub fn is_root(&self) -> bool {
        self.bits == 0
    }
    pub fn parent(&self) -> Option<FragTag> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            value: self.value >> 1,
            bits: self.bits - 1,
        })
    }
    pub fn sibling(&self) -> Option<FragTag> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            value: self.value ^ 1,
            bits: self.bits,
        })
    }
    /// The `2^by` fragments this one turns into when split.
    pub fn split(&self, by: u8) -> Vec<FragTag> {
        if by == 0 || self.bits + by > MAX_FRAG_BITS {
            return vec![*self];
        }
        (0..(1u32 << by))
            .map(|i| Self {
                value: (self.value << by) | i,
                bits: self.bits + by,
            })
            .collect()
    }
    pub fn contains(&self, other: &FragTag) -> bool {
        other.bits >= self.bits && (other.value >> (other.bits - self.bits)) == self.value
    }
}

impl fmt::Display for FragTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "*");
        }
        write!(f, "{:0width$b}*", self.value, width = self.bits as usize)
    }
}
