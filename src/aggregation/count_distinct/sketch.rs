use std::collections::HashSet;
use std::mem::size_of;

use serde::{Deserialize, Serialize};

/// Register index bits of the HyperLogLog sketch.
pub const HLL_PRECISION: u32 = 14;
const HLL_REGISTERS: usize = 1 << HLL_PRECISION;

/// Distinct hashes of one group.
///
/// Hashes are kept exactly until there are more than the precision threshold
/// of them, then the set is folded into a HyperLogLog sketch for good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DistinctSketch {
    Exact(HashSet<u64>),
    Approximate(HyperLogLog),
}

impl DistinctSketch {
    pub fn new() -> Self {
        Self::Exact(HashSet::new())
    }

    pub fn bytes_used(&self) -> usize {
        size_of::<Self>()
            + match self {
                Self::Exact(set) => set.len() * size_of::<u64>(),
                Self::Approximate(_) => HLL_REGISTERS,
            }
    }

    /// Bytes this sketch will use once `hash` is inserted.
    pub fn bytes_after_insert(&self, hash: u64, threshold: usize) -> usize {
        match self {
            Self::Exact(set) if set.contains(&hash) => self.bytes_used(),
            Self::Exact(set) if set.len() + 1 > threshold => size_of::<Self>() + HLL_REGISTERS,
            Self::Exact(_) => self.bytes_used() + size_of::<u64>(),
            Self::Approximate(_) => self.bytes_used(),
        }
    }

    pub fn insert(&mut self, hash: u64, threshold: usize) {
        match self {
            Self::Exact(set) => {
                set.insert(hash);
                if set.len() > threshold {
                    *self = Self::Approximate(HyperLogLog::from_hashes(set.iter().copied()));
                }
            }
            Self::Approximate(hll) => hll.insert(hash),
        }
    }

    /// Union of two sketches, approximate if either side is or the exact
    /// union outgrows `threshold`.
    pub fn merged(&self, other: &Self, threshold: usize) -> Self {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => {
                let union: HashSet<u64> = a.union(b).copied().collect();
                if union.len() > threshold {
                    Self::Approximate(HyperLogLog::from_hashes(union))
                } else {
                    Self::Exact(union)
                }
            }
            (Self::Approximate(a), Self::Approximate(b)) => Self::Approximate(a.merged(b)),
            (Self::Approximate(hll), Self::Exact(set)) | (Self::Exact(set), Self::Approximate(hll)) => {
                let mut hll = hll.clone();
                set.iter().for_each(|h| hll.insert(*h));
                Self::Approximate(hll)
            }
        }
    }

    pub fn cardinality(&self) -> i64 {
        match self {
            Self::Exact(set) => set.len() as i64,
            Self::Approximate(hll) => hll.estimate(),
        }
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

impl Default for DistinctSketch {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HyperLogLog {
    registers: Vec<u8>,
}

impl HyperLogLog {
    pub fn new() -> Self {
        Self {
            registers: vec![0; HLL_REGISTERS],
        }
    }

    pub fn from_hashes(hashes: impl IntoIterator<Item = u64>) -> Self {
        let mut hll = Self::new();
        hashes.into_iter().for_each(|h| hll.insert(h));
        hll
    }

    #[inline]
    pub fn insert(&mut self, hash: u64) {
        let index = (hash >> (64 - HLL_PRECISION)) as usize;
        // sentinel bit bounds the rank at 64 - precision + 1
        let rank = ((hash << HLL_PRECISION) | (1 << (HLL_PRECISION - 1))).leading_zeros() + 1;
        let register = &mut self.registers[index];
        *register = (*register).max(rank as u8);
    }

    pub fn merged(&self, other: &Self) -> Self {
        Self {
            registers: self
                .registers
                .iter()
                .zip(&other.registers)
                .map(|(a, b)| *a.max(b))
                .collect(),
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.registers.len() == HLL_REGISTERS
    }

    pub fn estimate(&self) -> i64 {
        let m = HLL_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let mut sum = 0.0;
        let mut zeros = 0usize;
        for &r in &self.registers {
            sum += 1.0 / (1u64 << r) as f64;
            if r == 0 {
                zeros += 1;
            }
        }
        let raw = alpha * m * m / sum;
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        estimate.round() as i64
    }
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new()
    }
}
