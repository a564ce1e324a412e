//! Light-cache generation.

use crate::{keccak512, Epoch, HASH_BYTES};

const CACHE_ROUNDS: usize = 3;

/// The per-epoch light cache the full dataset is derived from.
///
/// Stored as one contiguous byte buffer so it can be handed to a device
/// upload without reshaping. `num_dataset_items` is carried alongside
/// because on-demand dataset item computation needs the full-set size,
/// not just the cache.
pub struct LightCache {
    pub epoch: u64,
    pub num_dataset_items: u64,
    data: Vec<u8>,
}

impl LightCache {
    /// Generate the cache for an epoch. Takes a few seconds for
    /// mainnet-sized epochs; runs once per epoch change.
    pub fn generate(epoch: &Epoch) -> Self {
        log::info!(
            "generating light cache: epoch {} ({} MiB)",
            epoch.number,
            epoch.cache_bytes / (1024 * 1024)
        );
        Self::with_size(
            epoch.number,
            epoch.seed_hash,
            epoch.cache_bytes,
            epoch.dag_bytes,
        )
    }

    /// Generate a cache with explicit sizes. Mainnet callers go through
    /// [`LightCache::generate`]; reduced sizes keep tests and benches
    /// off the multi-second path. Sizes must be multiples of 64.
    pub fn with_size(epoch: u64, seed: [u8; 32], cache_bytes: u64, dag_bytes: u64) -> Self {
        assert!(cache_bytes >= 2 * HASH_BYTES && cache_bytes % HASH_BYTES == 0);
        assert!(dag_bytes >= 2 * HASH_BYTES && dag_bytes % HASH_BYTES == 0);

        let n = (cache_bytes / HASH_BYTES) as usize;
        let mut data = vec![0u8; n * HASH_BYTES as usize];

        // Sequential keccak512 chain from the seed.
        let mut item = keccak512(&seed);
        data[..64].copy_from_slice(&item);
        for i in 1..n {
            item = keccak512(&item);
            data[i * 64..(i + 1) * 64].copy_from_slice(&item);
        }

        // RandMemoHash mixing rounds.
        for _ in 0..CACHE_ROUNDS {
            for i in 0..n {
                let v = (read_word(&data, i, 0) as usize) % n;
                let prev = (i + n - 1) % n;

                let mut mixed = [0u8; 64];
                for j in 0..64 {
                    mixed[j] = data[prev * 64 + j] ^ data[v * 64 + j];
                }
                let hashed = keccak512(&mixed);
                data[i * 64..(i + 1) * 64].copy_from_slice(&hashed);
            }
        }

        Self {
            epoch,
            num_dataset_items: dag_bytes / HASH_BYTES,
            data,
        }
    }

    pub fn num_items(&self) -> usize {
        self.data.len() / HASH_BYTES as usize
    }

    pub fn item(&self, i: usize) -> &[u8] {
        &self.data[i * 64..(i + 1) * 64]
    }

    /// Little-endian u32 word `w` of item `i`.
    pub fn word(&self, i: usize, w: usize) -> u32 {
        read_word(&self.data, i, w)
    }

    /// The raw cache bytes, for device upload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

fn read_word(data: &[u8], item: usize, word: usize) -> u32 {
    let off = item * 64 + word * 4;
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let a = LightCache::with_size(0, [0u8; 32], 4096, 65_536);
        let b = LightCache::with_size(0, [0u8; 32], 4096, 65_536);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.num_items(), 64);
        assert_eq!(a.num_dataset_items, 1024);
    }

    #[test]
    fn different_seeds_give_different_caches() {
        let a = LightCache::with_size(0, [0u8; 32], 4096, 65_536);
        let b = LightCache::with_size(1, [1u8; 32], 4096, 65_536);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn mixing_rounds_touch_every_item() {
        let cache = LightCache::with_size(0, [7u8; 32], 4096, 65_536);
        // No item should have survived as the plain keccak chain.
        let mut chain = crate::keccak512(&[7u8; 32]);
        for i in 0..cache.num_items() {
            assert_ne!(cache.item(i), &chain[..]);
            chain = crate::keccak512(&chain);
        }
    }
}
