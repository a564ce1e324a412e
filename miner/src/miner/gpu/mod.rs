//! GPU device abstraction.
//!
//! Workers drive devices exclusively through [`Device`]; the CUDA
//! backend is feature-gated the same way other accelerator backends
//! are, and a CPU reference backend is always available so the search
//! pipeline stays testable without hardware.

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;

use crate::work::H256;
use ember_progpow::LightCache;
use std::sync::Arc;
use thiserror::Error;

/// Result slots per launch; a kernel finding more candidates in one
/// batch drops the surplus.
pub const MAX_SEARCH_RESULTS: usize = 4;

/// Search streams (and result buffers) per device.
pub const NUM_STREAMS: usize = 2;

/// Reserved bits for the rig index inside a pool-assigned nonce
/// segment; bounds how many workers can share one extranonce.
pub const LOG2_MAX_MINERS: u32 = 5;

/// One candidate reported by a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchResult {
    /// Thread index within the launch; nonce = nonce_base + gid.
    pub gid: u32,
    /// Kernel-computed mix digest, little-endian words.
    pub mix: [u32; 8],
}

impl SearchResult {
    pub fn mix_bytes(&self) -> H256 {
        let mut out = [0u8; 32];
        for (w, chunk) in self.mix.iter().zip(out.chunks_exact_mut(4)) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub total_memory: u64,
    /// Compute capability (major, minor); zero for non-CUDA backends.
    pub compute: (u32, u32),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    /// Accelerator API failure. Treated as hardware/driver corruption:
    /// the process aborts rather than mining on in an undefined state.
    #[error("device fault: {0}")]
    Fatal(String),
    #[error("DAG of {needed} bytes exceeds device memory of {available} bytes")]
    OutOfMemory { needed: u64, available: u64 },
    #[error("kernel compilation failed: {0}")]
    Compile(String),
}

/// Exclusive handle to one accelerator.
///
/// Stream discipline: `launch(i)` and `drain(i)` pair up per stream;
/// callers must not launch on a stream whose previous launch has not
/// been drained. The search loop's `current_index >= S` guard
/// guarantees this.
pub trait Device: Send {
    fn info(&self) -> &DeviceInfo;

    fn num_streams(&self) -> usize;

    /// Nonces covered by one launch (grid size × block size).
    fn batch_size(&self) -> u64;

    /// Epoch switch, steps 2–4: drop prior allocations, upload the
    /// light cache, allocate the DAG buffer. DAG contents come from
    /// [`Device::generate_dag`] or [`Device::upload_dag`].
    fn prepare_epoch(&mut self, cache: Arc<LightCache>) -> Result<(), DeviceError>;

    /// Populate the DAG from the on-device cache.
    fn generate_dag(&mut self) -> Result<(), DeviceError>;

    /// Read the generated DAG back to host memory (shared-host mode).
    fn download_dag(&mut self) -> Result<Vec<u8>, DeviceError>;

    /// Fill the DAG from a host buffer instead of generating it.
    fn upload_dag(&mut self, dag: &[u8]) -> Result<(), DeviceError>;

    /// JIT-compile and install the search kernel for one period.
    fn load_kernel(&mut self, source: &str) -> Result<(), DeviceError>;

    /// Zero every per-stream result count (start of a fresh search).
    fn zero_result_counts(&mut self) -> Result<(), DeviceError>;

    /// Enqueue one search batch on stream `stream`.
    fn launch(
        &mut self,
        stream: usize,
        start_nonce: u64,
        header: &H256,
        target: u64,
    ) -> Result<(), DeviceError>;

    /// Wait for stream `stream`, copy out its results (clamped to
    /// [`MAX_SEARCH_RESULTS`]) and zero the count in place.
    fn drain(&mut self, stream: usize) -> Result<Vec<SearchResult>, DeviceError>;

    /// Release everything this handle owns on the device.
    fn reset(&mut self) -> Result<(), DeviceError>;
}

/// Enumerate usable devices for the configured backend set.
pub fn detect_devices() -> Vec<DeviceInfo> {
    #[allow(unused_mut)]
    let mut devices: Vec<DeviceInfo> = Vec::new();

    #[cfg(feature = "cuda")]
    match cuda::detect() {
        Ok(found) => devices.extend(found),
        Err(e) => log::warn!("CUDA detection failed: {}", e),
    }

    devices
}
