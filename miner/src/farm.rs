//! Farm supervisor: owns the workers, publishes work, aggregates
//! hashrates and routes submissions between workers and the pool
//! client.

use crate::config::FarmOptions;
use crate::miner::gpu::Device;
use crate::miner::{DagCoordinator, Worker, WorkerEvent, WorkerLinks};
use crate::stratum::{ClientEvent, PoolClient};
use crate::work::WorkPackage;
use colored::Colorize;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Period of the hashrate aggregation tick.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Reconnect backoff bounds.
const RECONNECT_MIN: Duration = Duration::from_secs(3);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct FarmStats {
    pub accepted: AtomicU64,
    pub accepted_stale: AtomicU64,
    pub rejected: AtomicU64,
    pub failed: AtomicU64,
    /// Latest aggregated hashrate, hashes per second.
    pub hashrate: AtomicU64,
}

struct WorkerHandle {
    kick: Arc<AtomicBool>,
    hashes: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

pub struct Farm {
    opts: FarmOptions,
    work_tx: watch::Sender<WorkPackage>,
    workers: Mutex<Vec<WorkerHandle>>,
    stop: Arc<AtomicBool>,
    stats: Arc<FarmStats>,
    started: Instant,
    last_counts: Mutex<(Instant, Vec<u64>)>,
}

impl Farm {
    /// Spawn one worker thread per device. The returned receiver
    /// carries solutions and worker faults.
    pub fn start(
        devices: Vec<Box<dyn Device>>,
        opts: FarmOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (work_tx, _) = watch::channel(WorkPackage::default());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let dag = DagCoordinator::new(opts.dag_load_mode, opts.dag_master, devices.len());

        let mut workers = Vec::with_capacity(devices.len());
        for (index, device) in devices.into_iter().enumerate() {
            let kick = Arc::new(AtomicBool::new(false));
            let hashes = Arc::new(AtomicU64::new(0));
            let links = WorkerLinks {
                work: work_tx.subscribe(),
                kick: Arc::clone(&kick),
                stop: Arc::clone(&stop),
                hashes: Arc::clone(&hashes),
                events: event_tx.clone(),
            };
            let worker = Worker::new(index, device, links, Arc::clone(&dag), opts.clone());
            let join = std::thread::Builder::new()
                .name(format!("gpu-worker-{}", index))
                .spawn(move || worker.run())
                .expect("failed to spawn worker thread");
            workers.push(WorkerHandle {
                kick,
                hashes,
                join: Some(join),
            });
        }

        let num_workers = workers.len();
        let farm = Arc::new(Self {
            opts,
            work_tx,
            workers: Mutex::new(workers),
            stop,
            stats: Arc::new(FarmStats::default()),
            started: Instant::now(),
            last_counts: Mutex::new((Instant::now(), vec![0; num_workers])),
        });
        (farm, event_rx)
    }

    pub fn stats(&self) -> Arc<FarmStats> {
        Arc::clone(&self.stats)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn options(&self) -> &FarmOptions {
        &self.opts
    }

    /// Publish new work and invalidate every worker's current batch.
    pub fn publish(&self, work: WorkPackage) {
        self.work_tx.send_replace(work);
        for handle in self.workers.lock().iter() {
            handle.kick.store(true, Ordering::Release);
        }
    }

    /// Idle the workers (connection lost).
    pub fn pause(&self) {
        self.publish(WorkPackage::default());
    }

    /// Aggregate hashrate since the previous tick.
    pub fn tick_hashrate(&self) -> u64 {
        let workers = self.workers.lock();
        let mut last = self.last_counts.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(last.0).as_secs_f64();
        if elapsed <= 0.0 {
            return self.stats.hashrate.load(Ordering::Relaxed);
        }

        let mut delta = 0u64;
        for (handle, prev) in workers.iter().zip(last.1.iter_mut()) {
            let total = handle.hashes.load(Ordering::Relaxed);
            delta += total.saturating_sub(*prev);
            *prev = total;
        }
        last.0 = now;

        let rate = (delta as f64 / elapsed) as u64;
        self.stats.hashrate.store(rate, Ordering::Relaxed);
        rate
    }

    pub fn record_accepted(&self, stale: bool) {
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        if stale {
            self.stats.accepted_stale.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rejected(&self) {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Stop every worker and join the threads.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let mut workers = self.workers.lock();
        for handle in workers.iter() {
            handle.kick.store(true, Ordering::Release);
        }
        for handle in workers.iter_mut() {
            if let Some(join) = handle.join.take() {
                let _ = join.join();
            }
        }
    }
}

/// Supervisor loop: pump client and worker events, tick metrics,
/// reconnect with backoff after disconnects. Runs until `shutdown`
/// resolves.
pub async fn run_supervisor(
    farm: Arc<Farm>,
    client: Arc<PoolClient>,
    mut client_events: mpsc::UnboundedReceiver<ClientEvent>,
    mut worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    report_hashrate: bool,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    let mut reconnect_delay = RECONNECT_MIN;
    let mut reconnect_at: Option<tokio::time::Instant> = None;
    tokio::pin!(shutdown);

    loop {
        let pending_reconnect = reconnect_at;
        let reconnect_sleep = async move {
            match pending_reconnect {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                client.disconnect();
                farm.stop();
                return;
            }

            event = client_events.recv() => {
                let Some(event) = event else { return };
                match event {
                    ClientEvent::Connected => {
                        reconnect_delay = RECONNECT_MIN;
                        info!("{}", "pool session established".green());
                    }
                    ClientEvent::Disconnected => {
                        warn!("{}", "pool connection lost".yellow());
                        farm.pause();
                        reconnect_at = Some(tokio::time::Instant::now() + reconnect_delay);
                    }
                    ClientEvent::WorkReceived(work) => {
                        farm.publish(work);
                    }
                    ClientEvent::SolutionAccepted { stale } => {
                        farm.record_accepted(stale);
                        let tag = if stale { "accepted (stale)" } else { "accepted" };
                        info!(
                            "{} {}",
                            "**".green().bold(),
                            format!(
                                "{} {}/{}",
                                tag,
                                farm.stats().accepted.load(Ordering::Relaxed),
                                farm.stats().rejected.load(Ordering::Relaxed)
                            )
                            .green()
                        );
                    }
                    ClientEvent::SolutionRejected { stale } => {
                        farm.record_rejected();
                        let tag = if stale { "rejected (stale)" } else { "rejected" };
                        warn!("{}", format!("share {}", tag).red());
                    }
                }
            }

            event = worker_events.recv() => {
                let Some(event) = event else { return };
                match event {
                    WorkerEvent::Solution(solution) => {
                        client.submit(solution);
                    }
                    WorkerEvent::FailedSolution { device } => {
                        farm.record_failed();
                        warn!("device {} produced an invalid result", device);
                    }
                    WorkerEvent::Exited { device, fatal } => {
                        if farm.is_stopping() {
                            continue;
                        }
                        if fatal {
                            error!(
                                "device {} hit a fatal accelerator error; aborting",
                                device
                            );
                            std::process::exit(2);
                        }
                        if farm.options().exit_on_error {
                            error!("device {} stopped; exiting (--exit)", device);
                            std::process::exit(1);
                        }
                        warn!("device {} stopped mining", device);
                    }
                }
            }

            _ = tick.tick() => {
                let rate = farm.tick_hashrate();
                info!(
                    "speed {} accepted {} rejected {} failed {}",
                    format_hashrate(rate as f64).cyan().bold(),
                    farm.stats().accepted.load(Ordering::Relaxed),
                    farm.stats().rejected.load(Ordering::Relaxed),
                    farm.stats().failed.load(Ordering::Relaxed),
                );
                if report_hashrate && client.is_connected() {
                    client.submit_hashrate(rate);
                }
            }

            _ = reconnect_sleep => {
                reconnect_at = None;
                match client.connect().await {
                    Ok(()) => {}
                    Err(e) => {
                        warn!("reconnect failed: {}", e);
                        reconnect_delay = (reconnect_delay * 2).min(RECONNECT_MAX);
                        reconnect_at = Some(tokio::time::Instant::now() + reconnect_delay);
                    }
                }
            }
        }
    }
}

pub fn format_hashrate(rate: f64) -> String {
    if rate >= 1e12 {
        format!("{:.2} TH/s", rate / 1e12)
    } else if rate >= 1e9 {
        format!("{:.2} GH/s", rate / 1e9)
    } else if rate >= 1e6 {
        format!("{:.2} MH/s", rate / 1e6)
    } else if rate >= 1e3 {
        format!("{:.2} kH/s", rate / 1e3)
    } else {
        format!("{:.0} H/s", rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DagLoadMode, FarmOptions};
    use crate::miner::gpu::cpu::CpuDevice;

    fn cpu_farm(n: usize) -> (Arc<Farm>, mpsc::UnboundedReceiver<WorkerEvent>) {
        let devices: Vec<Box<dyn Device>> = (0..n)
            .map(|i| Box::new(CpuDevice::new(i, 4)) as Box<dyn Device>)
            .collect();
        let opts = FarmOptions {
            dag_load_mode: DagLoadMode::Parallel,
            ..FarmOptions::default()
        };
        Farm::start(devices, opts)
    }

    #[test]
    fn publish_kicks_every_worker() {
        let (farm, _events) = cpu_farm(2);
        let mut work = WorkPackage::default();
        work.header = [9u8; 32];
        farm.publish(work);
        for handle in farm.workers.lock().iter() {
            assert!(handle.kick.load(Ordering::Relaxed));
        }
        farm.stop();
    }

    #[test]
    fn tick_reports_deltas_not_totals() {
        let (farm, _events) = cpu_farm(1);
        farm.workers.lock()[0].hashes.store(1000, Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        let first = farm.tick_hashrate();
        assert!(first > 0);
        // No further hashes: the next tick reports zero.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(farm.tick_hashrate(), 0);
        farm.stop();
    }

    #[test]
    fn counters_accumulate() {
        let (farm, _events) = cpu_farm(1);
        farm.record_accepted(false);
        farm.record_accepted(true);
        farm.record_rejected();
        farm.record_failed();
        let stats = farm.stats();
        assert_eq!(stats.accepted.load(Ordering::Relaxed), 2);
        assert_eq!(stats.accepted_stale.load(Ordering::Relaxed), 1);
        assert_eq!(stats.rejected.load(Ordering::Relaxed), 1);
        assert_eq!(stats.failed.load(Ordering::Relaxed), 1);
        farm.stop();
    }

    #[test]
    fn format_hashrate_scales_units() {
        assert_eq!(format_hashrate(500.0), "500 H/s");
        assert_eq!(format_hashrate(2_500_000.0), "2.50 MH/s");
        assert_eq!(format_hashrate(3.2e9), "3.20 GH/s");
    }
}
