//! Admin-surface stubs.
//!
//! The HTTP/JSON-RPC endpoint itself lives outside this crate; what is
//! exposed here are the snapshot methods it calls into, in the shapes
//! the conventional miner tooling expects.

use crate::farm::{Farm, FarmStats};
use crate::stratum::messages::CLIENT_AGENT;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Process-control requests raised through the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    Restart,
    Reboot,
}

pub struct AdminApi {
    farm: Arc<Farm>,
    pool_address: String,
    control: mpsc::UnboundedSender<AdminCommand>,
}

impl AdminApi {
    pub fn new(
        farm: Arc<Farm>,
        pool_address: String,
    ) -> (Self, mpsc::UnboundedReceiver<AdminCommand>) {
        let (control, control_rx) = mpsc::unbounded_channel();
        (
            Self {
                farm,
                pool_address,
                control,
            },
            control_rx,
        )
    }

    /// Claymore-compatible nine-field stat array.
    pub fn miner_getstat1(&self) -> Value {
        let stats = self.farm.stats();
        let uptime_min = self.farm.uptime().as_secs() / 60;
        let khs = stats.hashrate.load(Ordering::Relaxed) / 1000;
        let shares = shares_line(&stats);
        let per_gpu_khs = khs.to_string();

        json!([
            CLIENT_AGENT,
            uptime_min.to_string(),
            format!("{};{}", khs, shares),
            per_gpu_khs,
            "0;0;0",
            "off",
            // Temperatures and fan speeds come from the external
            // hardware monitor; reported flat here.
            "0;0",
            self.pool_address,
            format!(
                "{};0;0;0",
                stats.failed.load(Ordering::Relaxed)
            ),
        ])
    }

    /// Extended stats with unscaled hashrates.
    pub fn miner_getstathr(&self) -> Value {
        let stats = self.farm.stats();
        json!({
            "version": CLIENT_AGENT,
            "runtime": self.farm.uptime().as_secs(),
            "ethhashrate": stats.hashrate.load(Ordering::Relaxed),
            "ethshares": stats.accepted.load(Ordering::Relaxed),
            "ethrejected": stats.rejected.load(Ordering::Relaxed),
            "ethinvalid": stats.failed.load(Ordering::Relaxed),
            "pooladdrs": self.pool_address,
        })
    }

    pub fn miner_restart(&self) -> Value {
        let _ = self.control.send(AdminCommand::Restart);
        json!(true)
    }

    pub fn miner_reboot(&self) -> Value {
        let _ = self.control.send(AdminCommand::Reboot);
        json!(true)
    }
}

fn shares_line(stats: &Arc<FarmStats>) -> String {
    format!(
        "{};{}",
        stats.accepted.load(Ordering::Relaxed),
        stats.rejected.load(Ordering::Relaxed)
    )
}
