//! Host-side candidate evaluation.
//!
//! Dataset items are computed on demand from the light cache, so a full
//! in-memory DAG is never needed on the host. Used to re-check GPU
//! candidates before submission and by the CPU reference backend.

use crate::{fnv, keccak256, keccak512, LightCache, DATASET_ACCESSES, DATASET_PARENTS};

/// Evaluate `(header, nonce)` against an epoch's cache.
///
/// Returns `(mix_hash, value)`; a candidate is a share iff `value`,
/// read as a 256-bit big-endian integer, is below the boundary.
pub fn eval(cache: &LightCache, header: &[u8; 32], nonce: u64) -> ([u8; 32], [u8; 32]) {
    // Seed: keccak512 over header ++ nonce (little-endian).
    let mut input = [0u8; 40];
    input[..32].copy_from_slice(header);
    input[32..].copy_from_slice(&nonce.to_le_bytes());
    let seed = keccak512(&input);

    let seed_words = to_words(&seed);

    // Mix starts as the seed repeated to page width (2 items, 32 words).
    let mut mix = [0u32; 32];
    mix[..16].copy_from_slice(&seed_words);
    mix[16..].copy_from_slice(&seed_words);

    let num_pages = (cache.num_dataset_items / 2) as u32;
    debug_assert!(num_pages > 0);

    for i in 0..DATASET_ACCESSES as u32 {
        let p = fnv(i ^ seed_words[0], mix[(i % 32) as usize]) % num_pages * 2;
        let even = dataset_item(cache, p as u64);
        let odd = dataset_item(cache, p as u64 + 1);
        for w in 0..16 {
            mix[w] = fnv(mix[w], even[w]);
            mix[16 + w] = fnv(mix[16 + w], odd[w]);
        }
    }

    // Fold 32 words down to the 8-word mix hash.
    let mut cmix = [0u32; 8];
    for w in 0..8 {
        let m = &mix[w * 4..w * 4 + 4];
        cmix[w] = fnv(fnv(fnv(m[0], m[1]), m[2]), m[3]);
    }

    let mut mix_hash = [0u8; 32];
    for (w, chunk) in cmix.iter().zip(mix_hash.chunks_exact_mut(4)) {
        chunk.copy_from_slice(&w.to_le_bytes());
    }

    // Final value: keccak256 over seed ++ mix hash.
    let mut fin = [0u8; 96];
    fin[..64].copy_from_slice(&seed);
    fin[64..].copy_from_slice(&mix_hash);
    let value = keccak256(&fin);

    (mix_hash, value)
}

/// Compute full-dataset item `i` from the cache.
pub fn dataset_item(cache: &LightCache, i: u64) -> [u32; 16] {
    let n = cache.num_items();
    let mut mix = to_words(cache.item(i as usize % n).try_into().unwrap());
    mix[0] ^= i as u32;

    let mut hashed = words_to_bytes(&mix);
    hashed = keccak512(&hashed);
    mix = to_words(&hashed);

    for j in 0..DATASET_PARENTS {
        let parent = fnv(i as u32 ^ j, mix[(j % 16) as usize]) as usize % n;
        for w in 0..16 {
            mix[w] = fnv(mix[w], cache.word(parent, w));
        }
    }

    to_words(&keccak512(&words_to_bytes(&mix)))
}

fn to_words(bytes: &[u8; 64]) -> [u32; 16] {
    let mut words = [0u32; 16];
    for (w, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *w = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    words
}

fn words_to_bytes(words: &[u32; 16]) -> [u8; 64] {
    let mut bytes = [0u8; 64];
    for (w, chunk) in words.iter().zip(bytes.chunks_exact_mut(4)) {
        chunk.copy_from_slice(&w.to_le_bytes());
    }
    bytes
}
