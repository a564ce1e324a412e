//! Wire message shapes and payload builders.
//!
//! Every outbound request carries one of six fixed ids, so responses
//! are dispatched without a pending-request table.

use crate::config::Dialect;
use crate::work::{h256_to_hex, Solution};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const ID_SUBSCRIBE: u64 = 1;
pub const ID_EXTRANONCE_SUBSCRIBE: u64 = 2;
pub const ID_AUTHORIZE: u64 = 3;
pub const ID_SUBMIT: u64 = 4;
pub const ID_GET_WORK: u64 = 5;
pub const ID_HASHRATE: u64 = 6;

pub const CLIENT_AGENT: &str = concat!("ember-miner/", env!("CARGO_PKG_VERSION"));

/// One inbound JSON frame: a response (id + result/error) or a
/// notification (method + params). Pools are loose about shapes, so
/// everything stays optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Frame {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn id_u64(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    pub fn result_bool(&self) -> bool {
        self.result.as_ref().and_then(Value::as_bool) == Some(true)
    }

    /// Human-readable error text. Pools send `[code, "text", data]`
    /// arrays, objects or bare strings.
    pub fn error_text(&self) -> Option<String> {
        let err = self.error.as_ref()?;
        if err.is_null() {
            return None;
        }
        let text = match err {
            Value::Array(items) => items
                .get(1)
                .map(|v| v.to_string())
                .unwrap_or_else(|| err.to_string()),
            Value::Object(map) => map
                .get("message")
                .map(|v| v.to_string())
                .unwrap_or_else(|| err.to_string()),
            other => other.to_string(),
        };
        Some(text.trim_matches('"').to_string())
    }
}

/// id=1: subscribe/login, dialect-specific.
pub fn subscribe(dialect: Dialect, user: &str, worker: &str, email: Option<&str>) -> String {
    let req = match dialect {
        Dialect::Stratum => json!({
            "id": ID_SUBSCRIBE,
            "method": "mining.subscribe",
            "params": []
        }),
        Dialect::EthProxy => {
            let mut params = vec![Value::String(user.to_string())];
            if let Some(email) = email {
                params.push(Value::String(email.to_string()));
            }
            if worker.is_empty() {
                json!({
                    "id": ID_SUBSCRIBE,
                    "method": "eth_submitLogin",
                    "params": params
                })
            } else {
                json!({
                    "id": ID_SUBSCRIBE,
                    "worker": worker,
                    "method": "eth_submitLogin",
                    "params": params
                })
            }
        }
        Dialect::EthereumStratum => json!({
            "id": ID_SUBSCRIBE,
            "method": "mining.subscribe",
            "params": [CLIENT_AGENT, "EthereumStratum/1.0.0"]
        }),
    };
    req.to_string()
}

/// id=2: extranonce subscription (ethereum-stratum only).
pub fn extranonce_subscribe() -> String {
    json!({
        "id": ID_EXTRANONCE_SUBSCRIBE,
        "method": "mining.extranonce.subscribe",
        "params": []
    })
    .to_string()
}

/// id=3: authorize.
pub fn authorize(user: &str, pass: &str) -> String {
    json!({
        "id": ID_AUTHORIZE,
        "method": "mining.authorize",
        "params": [user, pass]
    })
    .to_string()
}

/// id=5: eth_getWork kickstart (ethproxy only).
pub fn get_work() -> String {
    json!({
        "id": ID_GET_WORK,
        "method": "eth_getWork",
        "params": []
    })
    .to_string()
}

/// id=4: share submission, dialect-specific.
///
/// `extra_nonce_hex_size` is the width of the pool-assigned nonce
/// prefix in hex characters; ethereum-stratum submits strip it.
pub fn submit(
    dialect: Dialect,
    user: &str,
    worker: &str,
    solution: &Solution,
    extra_nonce_hex_size: usize,
) -> String {
    let nonce_hex = format!("{:016x}", solution.nonce);
    let header_hex = h256_to_hex(&solution.work.header);
    let mix_hex = h256_to_hex(&solution.mix_hash);

    let req = match dialect {
        Dialect::Stratum => json!({
            "id": ID_SUBMIT,
            "method": "mining.submit",
            "params": [
                user,
                solution.work.job_id,
                format!("0x{}", nonce_hex),
                format!("0x{}", header_hex),
                format!("0x{}", mix_hex),
            ]
        }),
        Dialect::EthProxy => json!({
            "id": ID_SUBMIT,
            "worker": worker,
            "method": "eth_submitWork",
            "params": [
                format!("0x{}", nonce_hex),
                format!("0x{}", header_hex),
                format!("0x{}", mix_hex),
            ]
        }),
        Dialect::EthereumStratum => {
            let job = &solution.work.job_id[..solution.work.job_len.min(solution.work.job_id.len())];
            json!({
                "id": ID_SUBMIT,
                "method": "mining.submit",
                "params": [user, job, nonce_hex[extra_nonce_hex_size.min(16)..].to_string()]
            })
        }
    };
    req.to_string()
}

/// id=6: hashrate report.
pub fn submit_hashrate(rate: u64, session_id: &str) -> String {
    json!({
        "id": ID_HASHRATE,
        "jsonrpc": "2.0",
        "method": "eth_submitHashrate",
        "params": [format!("0x{:x}", rate), format!("0x{}", session_id)]
    })
    .to_string()
}

/// Reply to `client.get_version`, echoing the request id.
pub fn version_reply(id: &Value) -> String {
    json!({
        "error": null,
        "id": id,
        "result": CLIENT_AGENT
    })
    .to_string()
}
