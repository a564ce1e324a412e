//! Ethash/ProgPoW algorithm support for the Ember miner.
//!
//! This crate owns everything that depends only on the chain rules and
//! not on any particular GPU backend: epoch/seed-hash math, cache and
//! dataset sizing, light-cache generation, host-side candidate
//! evaluation and the period-specialized kernel source. The heavy inner
//! loop runs on the GPU; the code here exists so the client can size
//! device allocations, verify GPU candidates and derive epochs from the
//! seed hashes pools send.

mod cache;
mod eval;
mod kern;

pub use cache::LightCache;
pub use eval::eval;
pub use kern::{kernel_source, runtime_source, Kiss99};

use tiny_keccak::{Hasher, Keccak};

/// Blocks per Ethash epoch.
pub const EPOCH_LENGTH: u64 = 30_000;

/// Blocks per ProgPoW period. The generated kernel math changes every
/// period; the DAG only changes every epoch.
pub const PROGPOW_PERIOD: u64 = 50;

pub const PROGPOW_LANES: u32 = 16;
pub const PROGPOW_REGS: u32 = 32;
pub const PROGPOW_DAG_LOADS: u32 = 4;
pub const PROGPOW_CNT_DAG: u32 = 64;
pub const PROGPOW_CNT_CACHE: u32 = 11;
pub const PROGPOW_CNT_MATH: u32 = 18;

/// Bytes per cache/dataset item.
pub const HASH_BYTES: u64 = 64;
/// Bytes per dataset page (two items mixed per access).
pub const MIX_BYTES: u64 = 128;
/// Dataset accesses per evaluation.
pub const DATASET_ACCESSES: usize = 64;
/// Cache parents per dataset item.
pub const DATASET_PARENTS: u32 = 256;

const CACHE_BYTES_INIT: u64 = 1 << 24; // 16 MiB
const CACHE_BYTES_GROWTH: u64 = 1 << 17; // 128 KiB per epoch
const DATASET_BYTES_INIT: u64 = 1 << 30; // 1 GiB
const DATASET_BYTES_GROWTH: u64 = 1 << 23; // 8 MiB per epoch

/// Upper bound for the seed-hash → epoch reverse search. Far beyond any
/// chain this client will see in its lifetime.
pub const MAX_EPOCH: u64 = 32_768;

/// ProgPoW period for a block height.
pub fn period_of_height(height: u64) -> u64 {
    height / PROGPOW_PERIOD
}

/// Everything the client needs to know about one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Epoch {
    pub number: u64,
    pub seed_hash: [u8; 32],
    pub cache_bytes: u64,
    pub dag_bytes: u64,
}

impl Epoch {
    pub fn of_height(height: u64) -> Self {
        Self::of_number(height / EPOCH_LENGTH)
    }

    pub fn of_number(number: u64) -> Self {
        Self {
            number,
            seed_hash: seed_hash_of_epoch(number),
            cache_bytes: cache_size(number),
            dag_bytes: dataset_size(number),
        }
    }

    /// Derive the epoch from a pool-provided seed hash by walking the
    /// keccak chain forward. Returns `None` for a seed no epoch below
    /// [`MAX_EPOCH`] produces.
    pub fn of_seed_hash(seed: &[u8; 32]) -> Option<Self> {
        let mut probe = [0u8; 32];
        for number in 0..MAX_EPOCH {
            if probe == *seed {
                return Some(Self::of_number(number));
            }
            probe = keccak256(&probe);
        }
        None
    }

    /// Number of 64-byte dataset items.
    pub fn dag_items(&self) -> u64 {
        self.dag_bytes / HASH_BYTES
    }
}

/// `keccak256^epoch(0)`, the chain's epoch marker.
pub fn seed_hash_of_epoch(epoch: u64) -> [u8; 32] {
    let mut seed = [0u8; 32];
    for _ in 0..epoch {
        seed = keccak256(&seed);
    }
    seed
}

/// Cache size in bytes: linear growth rounded down so that the item
/// count is prime.
pub fn cache_size(epoch: u64) -> u64 {
    let mut size = CACHE_BYTES_INIT + CACHE_BYTES_GROWTH * epoch - HASH_BYTES;
    while !is_prime(size / HASH_BYTES) {
        size -= 2 * HASH_BYTES;
    }
    size
}

/// Full dataset size in bytes: linear growth rounded down so that the
/// page count is prime.
pub fn dataset_size(epoch: u64) -> u64 {
    let mut size = DATASET_BYTES_INIT + DATASET_BYTES_GROWTH * epoch - MIX_BYTES;
    while !is_prime(size / MIX_BYTES) {
        size -= 2 * MIX_BYTES;
    }
    size
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut i = 5u64;
    while i * i <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

pub(crate) fn keccak256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(input);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

pub(crate) fn keccak512(input: &[u8]) -> [u8; 64] {
    let mut hasher = Keccak::v512();
    hasher.update(input);
    let mut output = [0u8; 64];
    hasher.finalize(&mut output);
    output
}

pub(crate) fn fnv(u: u32, v: u32) -> u32 {
    u.wrapping_mul(0x0100_0193) ^ v
}
