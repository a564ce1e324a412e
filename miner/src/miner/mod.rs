//! Per-device mining worker lifecycle.
//!
//! Each worker owns one device exclusively and runs on its own OS
//! thread: poll the published work, re-initialize the device on epoch
//! change, rebuild the kernel on period change, then hand off to the
//! search loop until it is kicked or stopped.

pub mod gpu;
pub mod search;

use crate::config::{DagLoadMode, FarmOptions};
use crate::work::{Solution, WorkPackage, H256};
use ember_progpow::{kernel_source, runtime_source, Epoch, LightCache};
use gpu::{Device, DeviceError, LOG2_MAX_MINERS};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use search::{run_search, SearchEvent, SearchExit, SearchState};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Poll interval while idle or waiting on another worker's DAG.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Worker-to-farm traffic.
#[derive(Debug)]
pub enum WorkerEvent {
    Solution(Solution),
    FailedSolution { device: usize },
    Exited { device: usize, fatal: bool },
}

/// The narrow farm-side surface a worker holds; workers never own or
/// extend the farm itself.
#[derive(Clone)]
pub struct WorkerLinks {
    pub work: watch::Receiver<WorkPackage>,
    pub kick: Arc<AtomicBool>,
    pub stop: Arc<AtomicBool>,
    pub hashes: Arc<AtomicU64>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Cross-worker DAG build coordination for the sequential and
/// shared-host load modes.
pub struct DagCoordinator {
    mode: DagLoadMode,
    master: usize,
    num_workers: usize,
    /// Sequential mode: worker `i` waits until the index reaches `i`.
    load_index: AtomicUsize,
    /// Shared-host mode: `(epoch, dag)` once the master published it.
    shared: Mutex<Option<(u64, Arc<Vec<u8>>)>>,
    copies_done: AtomicUsize,
}

impl DagCoordinator {
    pub fn new(mode: DagLoadMode, master: usize, num_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            mode,
            master,
            num_workers,
            load_index: AtomicUsize::new(0),
            shared: Mutex::new(None),
            copies_done: AtomicUsize::new(0),
        })
    }

    fn wait_for_turn(&self, order: usize, stop: &AtomicBool) {
        while self.load_index.load(Ordering::Acquire) < order && !stop.load(Ordering::Relaxed) {
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn finished_turn(&self) {
        self.load_index.fetch_add(1, Ordering::Release);
    }

    fn publish(&self, epoch: u64, dag: Vec<u8>) {
        self.copies_done.store(0, Ordering::Release);
        *self.shared.lock() = Some((epoch, Arc::new(dag)));
    }

    /// Busy-wait for the shared host DAG of `epoch`. The last consumer
    /// frees the buffer.
    fn wait_for_shared(&self, epoch: u64, stop: &AtomicBool) -> Option<Arc<Vec<u8>>> {
        loop {
            if stop.load(Ordering::Relaxed) {
                return None;
            }
            if let Some((e, dag)) = self.shared.lock().as_ref() {
                if *e == epoch {
                    return Some(Arc::clone(dag));
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn consumed_shared(&self) {
        let done = self.copies_done.fetch_add(1, Ordering::AcqRel) + 1;
        if done >= self.num_workers.saturating_sub(1) {
            *self.shared.lock() = None;
            debug!("shared host DAG buffer freed");
        }
    }
}

/// Sentinel forcing the first dispatch to initialize everything.
fn sentinel_work() -> WorkPackage {
    let mut w = WorkPackage::default();
    w.header = {
        let mut h: H256 = [0u8; 32];
        h[31] = 1;
        h
    };
    w
}

pub struct Worker {
    /// Index among the farm's workers; selects the nonce sub-segment
    /// inside a pool-assigned range.
    index: usize,
    device: Box<dyn Device>,
    links: WorkerLinks,
    dag: Arc<DagCoordinator>,
    opts: FarmOptions,
    state: SearchState,
    cache: Option<Arc<LightCache>>,
    current: WorkPackage,
    current_epoch: Option<u64>,
    current_period: u64,
}

impl Worker {
    pub fn new(
        index: usize,
        device: Box<dyn Device>,
        links: WorkerLinks,
        dag: Arc<DagCoordinator>,
        opts: FarmOptions,
    ) -> Self {
        Self {
            index,
            device,
            links,
            dag,
            opts,
            state: SearchState::default(),
            cache: None,
            current: sentinel_work(),
            current_epoch: None,
            current_period: u64::MAX,
        }
    }

    /// Thread entry point. Returns only on stop or a worker-fatal
    /// error; the device is reset on the way out.
    pub fn run(mut self) {
        let device_index = self.device.info().index;
        let fatal = loop {
            if self.links.stop.load(Ordering::Relaxed) {
                break false;
            }

            let work = self.links.work.borrow().clone();
            if work.is_empty() {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            if work.changed_from(&self.current) {
                if let Err(e) = self.adopt(&work) {
                    match e {
                        DeviceError::OutOfMemory { needed, available } => {
                            error!(
                                "device {}: DAG needs {} MiB but only {} MiB present; \
                                 refusing to mine on this device",
                                device_index,
                                needed / (1024 * 1024),
                                available / (1024 * 1024)
                            );
                            break false;
                        }
                        DeviceError::Compile(msg) => {
                            // Not fatal for the worker: warn and retry on
                            // the next poll (the pool may move us to a
                            // different period).
                            warn!("device {}: kernel build failed: {}", device_index, msg);
                            std::thread::sleep(POLL_INTERVAL);
                            continue;
                        }
                        DeviceError::Fatal(msg) => {
                            error!("device {}: fatal error: {}", device_index, msg);
                            break true;
                        }
                    }
                }
            }

            match self.dispatch_search(&work) {
                Ok(SearchExit::Stopped) => break false,
                Ok(SearchExit::NewWork) => continue,
                Err(e) => {
                    error!("device {}: search failed: {}", device_index, e);
                    break true;
                }
            }
        };

        if let Err(e) = self.device.reset() {
            warn!("device {}: reset on exit failed: {}", device_index, e);
        }
        let _ = self.links.events.send(WorkerEvent::Exited {
            device: device_index,
            fatal,
        });
    }

    /// Bring the device in line with a changed work package: DAG per
    /// epoch, kernel per period.
    fn adopt(&mut self, work: &WorkPackage) -> Result<(), DeviceError> {
        if self.current_epoch != Some(work.epoch) {
            self.init_epoch(work)?;
            self.current_epoch = Some(work.epoch);
            // The old kernel binds the old DAG size.
            self.current_period = u64::MAX;
        }
        if self.current_period != work.period() {
            self.build_kernel(work)?;
            self.current_period = work.period();
        }
        self.current = work.clone();
        self.reseed(work);
        Ok(())
    }

    fn init_epoch(&mut self, work: &WorkPackage) -> Result<(), DeviceError> {
        let epoch = Epoch::of_number(work.epoch);
        info!(
            "worker {}: initializing epoch {} (DAG {} MiB)",
            self.index,
            epoch.number,
            epoch.dag_bytes / (1024 * 1024)
        );

        // Fail fast before any generation work if the DAG cannot fit.
        let available = self.device.info().total_memory;
        if epoch.dag_bytes > available {
            return Err(DeviceError::OutOfMemory {
                needed: epoch.dag_bytes,
                available,
            });
        }

        if self.dag.mode == DagLoadMode::Sequential {
            self.dag.wait_for_turn(self.index, &self.links.stop);
        }

        let cache = Arc::new(LightCache::generate(&epoch));
        self.device.prepare_epoch(Arc::clone(&cache))?;

        match self.dag.mode {
            DagLoadMode::Parallel => self.device.generate_dag()?,
            DagLoadMode::Sequential => {
                let outcome = self.device.generate_dag();
                self.dag.finished_turn();
                outcome?;
            }
            DagLoadMode::Single => {
                if self.index == self.dag.master {
                    self.device.generate_dag()?;
                    if self.dag.num_workers > 1 {
                        let host = self.device.download_dag()?;
                        self.dag.publish(epoch.number, host);
                    }
                } else {
                    match self.dag.wait_for_shared(epoch.number, &self.links.stop) {
                        Some(host) => {
                            self.device.upload_dag(&host)?;
                            drop(host);
                            self.dag.consumed_shared();
                        }
                        // Stopping; the outer loop exits on the flag.
                        None => return Ok(()),
                    }
                }
            }
        }

        self.cache = Some(cache);
        Ok(())
    }

    fn build_kernel(&mut self, work: &WorkPackage) -> Result<(), DeviceError> {
        let period = work.period();
        debug!("worker {}: building kernel for period {}", self.index, period);
        let source = format!("{}\n{}", kernel_source(work.height), runtime_source());
        self.device.load_kernel(&source)
    }

    /// Position the nonce pipeline for a (possibly new) nonce region.
    fn reseed(&mut self, work: &WorkPackage) {
        if work.extra_size_bits >= 0 {
            let mut start = work.start_nonce;
            let shift = 64u32
                .saturating_sub(LOG2_MAX_MINERS)
                .saturating_sub(work.extra_size_bits as u32);
            start |= (self.index as u64) << shift;
            let _ = self.device.zero_result_counts();
            if start != self.state.start_nonce {
                self.state.rebase(start);
            }
        } else {
            // Solo-style: random start each time the work changes.
            let _ = self.device.zero_result_counts();
            self.state.rebase(rand::random::<u64>());
        }
    }

    fn dispatch_search(&mut self, work: &WorkPackage) -> Result<SearchExit, DeviceError> {
        let cache = match self.cache.as_ref() {
            Some(cache) => Arc::clone(cache),
            None => return Ok(SearchExit::Stopped),
        };
        let events = self.links.events.clone();
        let device_index = self.device.info().index;
        let mut sink = |event: SearchEvent| {
            let forwarded = match event {
                SearchEvent::Solution(solution) => WorkerEvent::Solution(solution),
                SearchEvent::FailedSolution => WorkerEvent::FailedSolution {
                    device: device_index,
                },
            };
            let _ = events.send(forwarded);
        };
        run_search(
            self.device.as_mut(),
            work,
            &mut self.state,
            &cache,
            self.opts.no_eval,
            &self.links.kick,
            &self.links.stop,
            &self.links.hashes,
            &mut sink,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::gpu::cpu::CpuDevice;

    fn links() -> (
        WorkerLinks,
        watch::Sender<WorkPackage>,
        mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        let (work_tx, work_rx) = watch::channel(WorkPackage::default());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let links = WorkerLinks {
            work: work_rx,
            kick: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            hashes: Arc::new(AtomicU64::new(0)),
            events: event_tx,
        };
        (links, work_tx, event_rx)
    }

    #[test]
    fn stratum_reseed_segments_by_worker_index() {
        let (links, _work_tx, _events) = links();
        let dag = DagCoordinator::new(DagLoadMode::Parallel, 0, 1);
        let device = Box::new(CpuDevice::new(0, 8));
        let mut worker = Worker::new(3, device, links, dag, FarmOptions::default());

        let mut work = WorkPackage::default();
        work.start_nonce = 0xAB00_0000_0000_0000;
        work.extra_size_bits = 8;
        worker.reseed(&work);

        // 64 - 5 - 8 = 51-bit shift for the worker index.
        assert_eq!(
            worker.state.start_nonce,
            0xAB00_0000_0000_0000 | (3u64 << 51)
        );
        assert_eq!(worker.state.current_nonce, worker.state.start_nonce);

        // Same region again: the pipeline position survives.
        worker.state.current_nonce += 64;
        worker.reseed(&work);
        assert_eq!(
            worker.state.current_nonce,
            (0xAB00_0000_0000_0000 | (3u64 << 51)) + 64
        );
    }

    #[test]
    fn solo_reseed_randomizes() {
        let (links, _work_tx, _events) = links();
        let dag = DagCoordinator::new(DagLoadMode::Parallel, 0, 1);
        let device = Box::new(CpuDevice::new(0, 8));
        let mut worker = Worker::new(0, device, links, dag, FarmOptions::default());

        let work = WorkPackage::default();
        worker.reseed(&work);
        let first = worker.state.start_nonce;
        worker.reseed(&work);
        // Two random 64-bit draws colliding is effectively impossible.
        assert_ne!(worker.state.start_nonce, first);
    }

    #[test]
    fn sequential_coordinator_orders_turns() {
        let dag = DagCoordinator::new(DagLoadMode::Sequential, 0, 2);
        let stop = AtomicBool::new(false);
        // Worker 0 may start immediately.
        dag.wait_for_turn(0, &stop);
        dag.finished_turn();
        // Now worker 1's turn is open; this returns without blocking.
        dag.wait_for_turn(1, &stop);
    }

    #[test]
    fn shared_dag_is_freed_after_the_last_copy() {
        let dag = DagCoordinator::new(DagLoadMode::Single, 0, 3);
        dag.publish(5, vec![1, 2, 3]);
        let stop = AtomicBool::new(false);

        let a = dag.wait_for_shared(5, &stop).unwrap();
        assert_eq!(*a, vec![1, 2, 3]);
        dag.consumed_shared();
        assert!(dag.shared.lock().is_some(), "one consumer outstanding");

        let b = dag.wait_for_shared(5, &stop).unwrap();
        drop((a, b));
        dag.consumed_shared();
        assert!(dag.shared.lock().is_none(), "buffer freed after last copy");
    }

    #[test]
    fn shared_dag_wait_aborts_on_stop() {
        let dag = DagCoordinator::new(DagLoadMode::Single, 0, 2);
        let stop = AtomicBool::new(true);
        assert!(dag.wait_for_shared(9, &stop).is_none());
    }
}
