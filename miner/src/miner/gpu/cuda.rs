//! CUDA backend (NVIDIA) via cudarc: driver API for memory/streams and
//! nvrtc for the per-period kernel JIT.

use super::{Device, DeviceError, DeviceInfo, SearchResult, MAX_SEARCH_RESULTS, NUM_STREAMS};
use crate::work::H256;
use cudarc::driver::sys::CUdevice_attribute;
use cudarc::driver::{CudaDevice, CudaFunction, CudaSlice, CudaStream, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};
use ember_progpow::{LightCache, HASH_BYTES};
use log::{debug, info};
use std::sync::Arc;

const MODULE: &str = "progpow";
const SEARCH_KERNEL: &str = "progpow_search";
const DAG_KERNEL: &str = "ethash_generate_dag";

/// u32 words per result buffer: count + 4 × (gid + 8 mix words).
const RESULT_WORDS: usize = 1 + MAX_SEARCH_RESULTS * 9;

/// Items per DAG-generation launch; chunked to stay under kernel
/// watchdog limits while the DAG builds.
const DAG_CHUNK_ITEMS: u64 = 1 << 22;

pub struct CudaBackend {
    info: DeviceInfo,
    device: Arc<CudaDevice>,
    grid_size: u32,
    block_size: u32,
    streams: Vec<CudaStream>,
    cache_buf: Option<CudaSlice<u8>>,
    cache_items: u32,
    dag_buf: Option<CudaSlice<u8>>,
    dag_items: u64,
    result_bufs: Vec<CudaSlice<u32>>,
    header_buf: Option<CudaSlice<u8>>,
    search_fn: Option<CudaFunction>,
}

/// Enumerate CUDA devices.
pub fn detect() -> Result<Vec<DeviceInfo>, DeviceError> {
    let count = CudaDevice::count().map_err(fatal)? as usize;
    let mut found = Vec::with_capacity(count);
    for index in 0..count {
        let device = CudaDevice::new(index).map_err(fatal)?;
        found.push(query_info(index, &device)?);
    }
    Ok(found)
}

fn query_info(index: usize, device: &Arc<CudaDevice>) -> Result<DeviceInfo, DeviceError> {
    let major = device
        .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
        .map_err(fatal)? as u32;
    let minor = device
        .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
        .map_err(fatal)? as u32;
    Ok(DeviceInfo {
        index,
        name: device.name().map_err(fatal)?,
        total_memory: device.total_memory().map_err(fatal)? as u64,
        compute: (major, minor),
    })
}

impl CudaBackend {
    pub fn open(index: usize, grid_size: u32, block_size: u32) -> Result<Self, DeviceError> {
        let device = CudaDevice::new(index).map_err(fatal)?;
        let info = query_info(index, &device)?;
        info!(
            "cuda {}: {} ({} MiB, sm_{}{})",
            index,
            info.name,
            info.total_memory / (1024 * 1024),
            info.compute.0,
            info.compute.1
        );

        let mut streams = Vec::with_capacity(NUM_STREAMS);
        let mut result_bufs = Vec::with_capacity(NUM_STREAMS);
        for _ in 0..NUM_STREAMS {
            streams.push(device.fork_default_stream().map_err(fatal)?);
            result_bufs.push(device.alloc_zeros::<u32>(RESULT_WORDS).map_err(fatal)?);
        }

        Ok(Self {
            info,
            device,
            grid_size,
            block_size,
            streams,
            cache_buf: None,
            cache_items: 0,
            dag_buf: None,
            dag_items: 0,
            result_bufs,
            header_buf: None,
            search_fn: None,
        })
    }

    fn dag_slice(&self) -> Result<&CudaSlice<u8>, DeviceError> {
        self.dag_buf
            .as_ref()
            .ok_or_else(|| DeviceError::Fatal("no DAG allocated".into()))
    }
}

impl Device for CudaBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn num_streams(&self) -> usize {
        self.streams.len()
    }

    fn batch_size(&self) -> u64 {
        self.grid_size as u64 * self.block_size as u64
    }

    fn prepare_epoch(&mut self, cache: Arc<LightCache>) -> Result<(), DeviceError> {
        let dag_bytes = cache.num_dataset_items * HASH_BYTES;
        if dag_bytes > self.info.total_memory {
            return Err(DeviceError::OutOfMemory {
                needed: dag_bytes,
                available: self.info.total_memory,
            });
        }

        // Drop the previous epoch's buffers before the new allocations
        // so peak usage stays at one DAG.
        self.dag_buf = None;
        self.cache_buf = None;
        self.search_fn = None;

        debug!(
            "cuda {}: uploading {} MiB cache, allocating {} MiB DAG",
            self.info.index,
            cache.as_bytes().len() / (1024 * 1024),
            dag_bytes / (1024 * 1024)
        );
        let cache_buf = self
            .device
            .htod_sync_copy(cache.as_bytes())
            .map_err(fatal)?;
        let dag_buf = self
            .device
            .alloc_zeros::<u8>(dag_bytes as usize)
            .map_err(fatal)?;

        self.cache_items = (cache.as_bytes().len() as u64 / HASH_BYTES) as u32;
        self.dag_items = cache.num_dataset_items;
        self.cache_buf = Some(cache_buf);
        self.dag_buf = Some(dag_buf);
        Ok(())
    }

    fn generate_dag(&mut self) -> Result<(), DeviceError> {
        // The DAG builder is part of the fixed kernel half; compile it
        // standalone so generation does not depend on the period JIT.
        let source = ember_progpow::runtime_source();
        let prelude = "__device__ __forceinline__ void progpow_loop(const unsigned, unsigned*, const void*, const unsigned*, const unsigned) {}\n";
        self.compile_module(&format!("{}{}", prelude, source), &[DAG_KERNEL])?;
        let dag_fn = self
            .device
            .get_func(MODULE, DAG_KERNEL)
            .ok_or_else(|| DeviceError::Fatal("DAG kernel symbol missing".into()))?;

        let cache_buf = self
            .cache_buf
            .as_ref()
            .ok_or_else(|| DeviceError::Fatal("no cache uploaded".into()))?;
        let dag_buf = self
            .dag_buf
            .as_ref()
            .ok_or_else(|| DeviceError::Fatal("no DAG allocated".into()))?;

        let started = std::time::Instant::now();
        let mut start: u64 = 0;
        while start < self.dag_items {
            let items = DAG_CHUNK_ITEMS.min(self.dag_items - start);
            let cfg = LaunchConfig {
                grid_dim: (((items as u32) + 255) / 256, 1, 1),
                block_dim: (256, 1, 1),
                shared_mem_bytes: 0,
            };
            unsafe {
                dag_fn
                    .clone()
                    .launch(
                        cfg,
                        (start, cache_buf, self.cache_items, dag_buf, self.dag_items),
                    )
                    .map_err(fatal)?;
            }
            self.device.synchronize().map_err(fatal)?;
            start += items;
        }
        info!(
            "cuda {}: DAG generated in {:.1}s",
            self.info.index,
            started.elapsed().as_secs_f64()
        );
        Ok(())
    }

    fn download_dag(&mut self) -> Result<Vec<u8>, DeviceError> {
        let dag = self.dag_slice()?;
        self.device.dtoh_sync_copy(dag).map_err(fatal)
    }

    fn upload_dag(&mut self, dag: &[u8]) -> Result<(), DeviceError> {
        let buf = self
            .dag_buf
            .as_mut()
            .ok_or_else(|| DeviceError::Fatal("no DAG allocated".into()))?;
        self.device
            .htod_copy_into(dag.to_vec(), buf)
            .map_err(fatal)
    }

    fn load_kernel(&mut self, source: &str) -> Result<(), DeviceError> {
        self.compile_module(source, &[SEARCH_KERNEL, DAG_KERNEL])?;
        self.search_fn = self.device.get_func(MODULE, SEARCH_KERNEL);
        if self.search_fn.is_none() {
            return Err(DeviceError::Compile(
                "search kernel symbol missing from module".into(),
            ));
        }
        Ok(())
    }

    fn zero_result_counts(&mut self) -> Result<(), DeviceError> {
        for buf in &mut self.result_bufs {
            self.device
                .htod_copy_into(vec![0u32; RESULT_WORDS], buf)
                .map_err(fatal)?;
        }
        Ok(())
    }

    fn launch(
        &mut self,
        stream: usize,
        start_nonce: u64,
        header: &H256,
        target: u64,
    ) -> Result<(), DeviceError> {
        let search_fn = self
            .search_fn
            .as_ref()
            .ok_or_else(|| DeviceError::Fatal("no kernel loaded".into()))?
            .clone();

        let header_buf = match self.header_buf.as_mut() {
            Some(buf) => {
                self.device
                    .htod_copy_into(header.to_vec(), buf)
                    .map_err(fatal)?;
                buf
            }
            None => {
                self.header_buf = Some(self.device.htod_sync_copy(header).map_err(fatal)?);
                self.header_buf.as_mut().expect("just set")
            }
        };

        let cfg = LaunchConfig {
            grid_dim: (self.grid_size, 1, 1),
            block_dim: (self.block_size, 1, 1),
            shared_mem_bytes: 0,
        };
        let dag_buf = self
            .dag_buf
            .as_ref()
            .ok_or_else(|| DeviceError::Fatal("no DAG allocated".into()))?;

        unsafe {
            search_fn
                .launch_on_stream(
                    &self.streams[stream],
                    cfg,
                    (
                        start_nonce,
                        &*header_buf,
                        target,
                        dag_buf,
                        &mut self.result_bufs[stream],
                        0u32,
                    ),
                )
                .map_err(fatal)?;
        }
        Ok(())
    }

    fn drain(&mut self, stream: usize) -> Result<Vec<SearchResult>, DeviceError> {
        self.device.wait_for(&self.streams[stream]).map_err(fatal)?;
        self.device.synchronize().map_err(fatal)?;

        let words = self
            .device
            .dtoh_sync_copy(&self.result_bufs[stream])
            .map_err(fatal)?;
        let count = (words[0] as usize).min(MAX_SEARCH_RESULTS);
        let mut results = Vec::with_capacity(count);
        for slot in 0..count {
            let base = 1 + slot * 9;
            let mut mix = [0u32; 8];
            mix.copy_from_slice(&words[base + 1..base + 9]);
            results.push(SearchResult {
                gid: words[base],
                mix,
            });
        }

        if count > 0 {
            self.device
                .htod_copy_into(vec![0u32; RESULT_WORDS], &mut self.result_bufs[stream])
                .map_err(fatal)?;
        }
        Ok(results)
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.search_fn = None;
        self.header_buf = None;
        self.dag_buf = None;
        self.cache_buf = None;
        self.device.synchronize().map_err(fatal)
    }
}

impl CudaBackend {
    fn compile_module(&mut self, source: &str, symbols: &[&'static str]) -> Result<(), DeviceError> {
        let (major, minor) = self.info.compute;
        let dag_elements = self.dag_items * HASH_BYTES
            / (ember_progpow::PROGPOW_LANES as u64 * ember_progpow::PROGPOW_DAG_LOADS as u64 * 4);
        let opts = CompileOptions {
            options: vec![
                format!("--gpu-architecture=compute_{}{}", major, minor),
                format!("--define-macro=PROGPOW_DAG_ELEMENTS={}", dag_elements),
                format!("--define-macro=SEARCH_RESULTS={}", MAX_SEARCH_RESULTS),
                "--device-as-default-execution-space".to_string(),
                "--generate-line-info".to_string(),
            ],
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(source, opts)
            .map_err(|e| DeviceError::Compile(format!("{:?}", e)))?;
        self.device
            .load_ptx(ptx, MODULE, symbols)
            .map_err(|e| DeviceError::Compile(format!("{:?}", e)))?;
        Ok(())
    }
}

fn fatal<E: std::fmt::Debug>(e: E) -> DeviceError {
    DeviceError::Fatal(format!("{:?}", e))
}
