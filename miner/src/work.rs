//! Canonical work package and solution types.

use ember_progpow::{period_of_height, Epoch};
use serde::{Deserialize, Serialize};

/// 32-byte hash, big-endian where a numeric reading applies.
pub type H256 = [u8; 32];

pub fn h256_from_hex(s: &str) -> Option<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() != 64 {
        return None;
    }
    let bytes = hex::decode(s).ok()?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

pub fn h256_to_hex(h: &H256) -> String {
    hex::encode(h)
}

/// One unit of work from the pool. Immutable once published; workers
/// only ever swap whole packages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPackage {
    /// Block header hash to mine on. All zero means "no work".
    pub header: H256,
    /// Seed hash identifying the epoch.
    pub seed_hash: H256,
    /// Epoch derived from `seed_hash`.
    pub epoch: u64,
    /// Share boundary, big-endian. Valid iff value < boundary.
    pub boundary: H256,
    /// Block height; `height / 50` selects the kernel period.
    pub height: u64,
    /// Pool job id, echoed verbatim on submit.
    pub job_id: String,
    /// Length of the original job id (ethereum-stratum pads ids for
    /// internal storage; submits must truncate back).
    pub job_len: usize,
    /// First nonce of the assigned range (ethereum-stratum only).
    pub start_nonce: u64,
    /// Width in bits of the pool-assigned nonce prefix; -1 when the
    /// pool does not segment the nonce space.
    pub extra_size_bits: i32,
}

impl Default for WorkPackage {
    fn default() -> Self {
        Self {
            header: [0u8; 32],
            seed_hash: [0u8; 32],
            epoch: 0,
            boundary: [0u8; 32],
            height: 0,
            job_id: String::new(),
            job_len: 0,
            start_nonce: 0,
            extra_size_bits: -1,
        }
    }
}

impl WorkPackage {
    pub fn is_empty(&self) -> bool {
        self.header == [0u8; 32]
    }

    pub fn period(&self) -> u64 {
        period_of_height(self.height)
    }

    /// Fill `epoch` from `seed_hash`. Returns false for a seed outside
    /// the supported epoch range.
    pub fn derive_epoch(&mut self) -> bool {
        match Epoch::of_seed_hash(&self.seed_hash) {
            Some(epoch) => {
                self.epoch = epoch.number;
                true
            }
            None => false,
        }
    }

    /// Work identity for change detection: a worker re-dispatches when
    /// any of header, epoch or kernel period differs.
    pub fn changed_from(&self, other: &WorkPackage) -> bool {
        self.header != other.header || self.epoch != other.epoch || self.period() != other.period()
    }

    /// Top 64 bits of the boundary, for the in-kernel compare.
    pub fn upper64_boundary(&self) -> u64 {
        u64::from_be_bytes(self.boundary[..8].try_into().unwrap())
    }
}

/// A candidate nonce on its way back to the pool.
#[derive(Debug, Clone)]
pub struct Solution {
    pub nonce: u64,
    pub mix_hash: H256,
    pub work: WorkPackage,
    /// True when newer work arrived while this candidate's launch was
    /// still in flight.
    pub stale: bool,
}

/// value < boundary, both read as 256-bit big-endian integers.
pub fn meets_boundary(value: &H256, boundary: &H256) -> bool {
    value < boundary
}
