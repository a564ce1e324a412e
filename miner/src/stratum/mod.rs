//! Asynchronous stratum pool client.
//!
//! One reactor task per connection owns the socket, the protocol state
//! machine and every timer, so all handlers are serialized and the
//! subscribe/extranonce/authorize chain cannot interleave. The rest of
//! the process talks to the session through commands (submit,
//! hashrate, disconnect) and receives [`ClientEvent`]s back.

pub mod difficulty;
pub mod messages;
pub mod session;

use crate::config::{Dialect, Endpoint, SessionOptions};
use crate::work::{h256_from_hex, Solution, WorkPackage, H256};
use difficulty::{diff_to_target, pad_target_hex, MIN_DIFFICULTY};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use messages::Frame;
use rand::RngCore;
use serde_json::Value;
use session::{PoolStream, SOCKET_TIMEOUT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

/// Session activity surfaced to the farm supervisor.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    WorkReceived(WorkPackage),
    SolutionAccepted { stale: bool },
    SolutionRejected { stale: bool },
}

enum Command {
    Submit(Solution),
    SubmitHashrate(u64),
    Disconnect,
}

#[derive(Debug, Error)]
enum EngineError {
    #[error("connection closed by pool")]
    Eof,
    #[error("socket error: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("write timed out")]
    WriteTimeout,
    #[error("no work received within the work timeout")]
    WorkTimeout,
    #[error("no response received to the last submission")]
    ResponseTimeout,
    #[error("subscribe rejected: {0}")]
    Subscribe(String),
    #[error("authorization failed: {0}")]
    Unauthorized(String),
}

/// Pool client handle. `connect` spawns the reactor; dropping the
/// handle does not tear the session down; call `disconnect`.
pub struct PoolClient {
    endpoint: Endpoint,
    opts: SessionOptions,
    session_id: String,
    events: mpsc::UnboundedSender<ClientEvent>,
    cmd_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Command>>>,
    connected: AtomicBool,
}

impl PoolClient {
    pub fn new(
        endpoint: Endpoint,
        opts: SessionOptions,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        Self {
            endpoint,
            opts,
            session_id: hex::encode(id),
            events,
            cmd_tx: parking_lot::Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Open the socket (and TLS when configured) and start the
    /// protocol reactor. Returns once the transport is up; progress
    /// through subscribe/authorize is reported via events.
    pub async fn connect(self: &Arc<Self>) -> Result<(), session::SessionError> {
        let stream = session::open(&self.endpoint).await?;
        info!(
            "connected to {}:{}",
            self.endpoint.host, self.endpoint.port
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.cmd_tx.lock() = Some(cmd_tx);
        self.connected.store(true, Ordering::Relaxed);

        let client = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = run_session(&client, stream, cmd_rx).await;
            match outcome {
                Ok(()) => info!("session closed"),
                Err(e) => warn!("session ended: {}", e),
            }
            client.connected.store(false, Ordering::Relaxed);
            *client.cmd_tx.lock() = None;
            let _ = client.events.send(ClientEvent::Disconnected);
        });

        Ok(())
    }

    pub fn submit(&self, solution: Solution) {
        self.send_command(Command::Submit(solution));
    }

    pub fn submit_hashrate(&self, rate: u64) {
        self.send_command(Command::SubmitHashrate(rate));
    }

    pub fn disconnect(&self) {
        self.send_command(Command::Disconnect);
    }

    fn send_command(&self, cmd: Command) {
        if let Some(tx) = self.cmd_tx.lock().as_ref() {
            let _ = tx.send(cmd);
        } else {
            debug!("not connected; command dropped");
        }
    }
}

/// Mutable per-connection protocol state.
struct EngineState {
    dialect: Dialect,
    user: String,
    worker: String,
    authorized: bool,
    response_pending: bool,
    pending_stale: bool,
    next_work_difficulty: f64,
    extra_nonce: [u8; 8],
    extra_nonce_hex_size: u8,
    current_header: H256,
    pending_hashrate: u64,
    /// Set whenever a frame carried work, changed or not; feeds the
    /// work timer, which tracks pool liveness rather than job churn.
    work_seen: bool,
}

impl EngineState {
    fn new(endpoint: &Endpoint) -> Self {
        let (user, worker) = match endpoint.dialect {
            // eth-proxy logs in with the account part only.
            Dialect::EthProxy => {
                let (account, worker) = endpoint.split_user();
                (account.to_string(), worker.to_string())
            }
            _ => (endpoint.user.clone(), String::new()),
        };
        Self {
            dialect: endpoint.dialect,
            user,
            worker,
            authorized: false,
            response_pending: false,
            pending_stale: false,
            next_work_difficulty: 1.0,
            extra_nonce: [0u8; 8],
            extra_nonce_hex_size: 0,
            current_header: [0u8; 32],
            pending_hashrate: 0,
            work_seen: false,
        }
    }

    /// Record a pool-assigned extranonce, right-padded to 8 bytes.
    fn set_extranonce(&mut self, hex_str: &str) {
        let digits = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        if digits.len() > 16 || digits.chars().any(|c| !c.is_ascii_hexdigit()) {
            warn!("ignoring invalid extranonce '{}'", hex_str);
            return;
        }
        let padded = format!("{:0<16}", digits);
        let bytes = hex::decode(&padded).expect("validated hex");
        self.extra_nonce.copy_from_slice(&bytes);
        self.extra_nonce_hex_size = digits.len() as u8;
        debug!(
            "extranonce {} ({} hex chars)",
            padded, self.extra_nonce_hex_size
        );
    }

    fn start_nonce(&self) -> u64 {
        u64::from_be_bytes(self.extra_nonce)
    }
}

async fn run_session(
    client: &PoolClient,
    stream: PoolStream,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) -> Result<(), EngineError> {
    let mut framed = Framed::new(stream, LinesCodec::new());
    let mut st = EngineState::new(&client.endpoint);

    let mut work_deadline = Instant::now() + client.opts.work_timeout;
    let mut response_deadline: Option<Instant> = None;
    let mut hashrate_deadline: Option<Instant> = None;

    send_line(
        &mut framed,
        messages::subscribe(
            st.dialect,
            &st.user,
            &st.worker,
            client.endpoint.email.as_deref(),
        ),
    )
    .await?;

    loop {
        let next_deadline = [Some(work_deadline), response_deadline, hashrate_deadline]
            .into_iter()
            .flatten()
            .min()
            .expect("work deadline is always set");

        tokio::select! {
            maybe_line = framed.next() => {
                let line = match maybe_line {
                    None => return Err(EngineError::Eof),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(line)) => line,
                };
                let work = handle_line(client, &mut framed, &mut st, &line).await?;
                if std::mem::take(&mut st.work_seen) {
                    work_deadline = Instant::now() + client.opts.work_timeout;
                }
                if let Some(work) = work {
                    if st.response_pending {
                        // The outstanding submission now races newer work.
                        st.pending_stale = true;
                    }
                    let _ = client.events.send(ClientEvent::WorkReceived(work));
                }
                if !st.response_pending {
                    response_deadline = None;
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(Command::Disconnect) => return Ok(()),
                    Some(Command::Submit(solution)) => {
                        if !st.authorized {
                            warn!("not authorized; dropping solution");
                            continue;
                        }
                        let line = messages::submit(
                            st.dialect,
                            &client.endpoint.user,
                            &st.worker,
                            &solution,
                            st.extra_nonce_hex_size as usize,
                        );
                        send_line(&mut framed, line).await?;
                        st.response_pending = true;
                        st.pending_stale = solution.stale;
                        response_deadline = Some(Instant::now() + client.opts.response_timeout);
                    }
                    Some(Command::SubmitHashrate(rate)) => {
                        // Trailing debounce: every report pushes the send out.
                        st.pending_hashrate = rate;
                        hashrate_deadline = Some(Instant::now() + client.opts.hashrate_debounce);
                    }
                }
            }

            _ = tokio::time::sleep_until(next_deadline) => {
                let now = Instant::now();
                if now >= work_deadline {
                    return Err(EngineError::WorkTimeout);
                }
                if response_deadline.map_or(false, |t| now >= t) {
                    return Err(EngineError::ResponseTimeout);
                }
                if hashrate_deadline.map_or(false, |t| now >= t) {
                    hashrate_deadline = None;
                    let line = messages::submit_hashrate(st.pending_hashrate, &client.session_id);
                    send_line(&mut framed, line).await?;
                }
            }
        }
    }
}

/// Handle one inbound line; returns new work when the line carried it.
async fn handle_line(
    client: &PoolClient,
    framed: &mut Framed<PoolStream, LinesCodec>,
    st: &mut EngineState,
    line: &str,
) -> Result<Option<WorkPackage>, EngineError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    // Defensive framing check: anything that is not a whole JSON object
    // is noise from a partial read or a confused proxy.
    if !(line.starts_with('{') && line.ends_with('}')) {
        if st.dialect != Dialect::EthProxy {
            warn!("discarding malformed line from pool: {:.80}", line);
        }
        return Ok(None);
    }

    let frame = match Frame::parse(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("unparseable frame from pool: {}", e);
            return Ok(None);
        }
    };

    if let Some(text) = frame.error_text() {
        warn!("pool error: {}", text);
    }

    if let Some(method) = frame.method.clone() {
        return handle_notification(framed, st, &frame, &method).await;
    }

    match frame.id_u64() {
        Some(messages::ID_SUBSCRIBE) => {
            handle_subscribe_result(client, framed, st, &frame).await?;
            Ok(None)
        }
        Some(messages::ID_EXTRANONCE_SUBSCRIBE) => {
            debug!("extranonce subscription acknowledged");
            Ok(None)
        }
        Some(messages::ID_AUTHORIZE) => {
            if frame.result_bool() {
                st.authorized = true;
                info!("authorized as {}", client.endpoint.user);
                let _ = client.events.send(ClientEvent::Connected);
                Ok(None)
            } else {
                Err(EngineError::Unauthorized(
                    frame.error_text().unwrap_or_else(|| "result=false".into()),
                ))
            }
        }
        Some(messages::ID_SUBMIT) => {
            let stale = st.pending_stale;
            st.response_pending = false;
            st.pending_stale = false;
            let event = if frame.result_bool() {
                ClientEvent::SolutionAccepted { stale }
            } else {
                ClientEvent::SolutionRejected { stale }
            };
            let _ = client.events.send(event);
            Ok(None)
        }
        Some(messages::ID_HASHRATE) => Ok(None),
        _ => {
            // eth-proxy pools push work as bare responses (id 0 or the
            // id=5 kickstart reply).
            if st.dialect == Dialect::EthProxy {
                if let Some(params) = frame.result.as_ref().and_then(Value::as_array) {
                    return Ok(work_from_notify(st, params));
                }
            }
            debug!("unhandled frame: {:.120}", line);
            Ok(None)
        }
    }
}

async fn handle_notification(
    framed: &mut Framed<PoolStream, LinesCodec>,
    st: &mut EngineState,
    frame: &Frame,
    method: &str,
) -> Result<Option<WorkPackage>, EngineError> {
    match method {
        "mining.notify" => {
            let params = match frame.params.as_ref().and_then(Value::as_array) {
                Some(p) => p,
                None => {
                    warn!("mining.notify without params");
                    return Ok(None);
                }
            };
            Ok(work_from_notify(st, params))
        }
        "mining.set_difficulty" => {
            if let Some(diff) = frame
                .params
                .as_ref()
                .and_then(Value::as_array)
                .and_then(|p| p.first())
                .and_then(Value::as_f64)
            {
                st.next_work_difficulty = diff.max(MIN_DIFFICULTY);
                debug!("difficulty set to {}", st.next_work_difficulty);
            }
            Ok(None)
        }
        "mining.set_extranonce" => {
            if let Some(hex_str) = frame
                .params
                .as_ref()
                .and_then(Value::as_array)
                .and_then(|p| p.first())
                .and_then(Value::as_str)
            {
                st.set_extranonce(hex_str);
            }
            Ok(None)
        }
        "client.get_version" => {
            let id = frame.id.clone().unwrap_or(Value::Null);
            send_line(framed, messages::version_reply(&id)).await?;
            Ok(None)
        }
        other => {
            debug!("ignoring notification '{}'", other);
            Ok(None)
        }
    }
}

async fn handle_subscribe_result(
    client: &PoolClient,
    framed: &mut Framed<PoolStream, LinesCodec>,
    st: &mut EngineState,
    frame: &Frame,
) -> Result<(), EngineError> {
    match st.dialect {
        Dialect::Stratum => {
            st.authorized = true;
            send_line(
                framed,
                messages::authorize(&client.endpoint.user, &client.endpoint.pass),
            )
            .await?;
        }
        Dialect::EthProxy => {
            if !frame.result_bool() {
                return Err(EngineError::Subscribe(
                    frame.error_text().unwrap_or_else(|| "login rejected".into()),
                ));
            }
            st.authorized = true;
            info!("logged in as {}", st.user);
            let _ = client.events.send(ClientEvent::Connected);
            send_line(framed, messages::get_work()).await?;
        }
        Dialect::EthereumStratum => {
            let extranonce = frame
                .result
                .as_ref()
                .and_then(Value::as_array)
                .and_then(|r| r.get(1))
                .and_then(Value::as_str);
            match extranonce {
                Some(hex_str) => st.set_extranonce(hex_str),
                None => {
                    return Err(EngineError::Subscribe(
                        "subscribe result carried no extranonce".into(),
                    ))
                }
            }
            send_line(framed, messages::extranonce_subscribe()).await?;
            send_line(
                framed,
                messages::authorize(&client.endpoint.user, &client.endpoint.pass),
            )
            .await?;
        }
    }
    Ok(())
}

/// Build a [`WorkPackage`] from notify parameters. Returns `None` when
/// the parameters are unusable or the header has not changed.
fn work_from_notify(st: &mut EngineState, params: &[Value]) -> Option<WorkPackage> {
    st.work_seen = true;
    let mut work = WorkPackage::default();

    match st.dialect {
        Dialect::Stratum | Dialect::EthProxy => {
            // [job?, header, seed, target, height]; eth-proxy omits the
            // job id and identifies work by header.
            let base = if st.dialect == Dialect::EthProxy { 0 } else { 1 };
            if params.len() < base + 3 {
                warn!("notify with too few params ({})", params.len());
                return None;
            }
            work.header = h256_from_hex(params[base].as_str()?)?;
            work.seed_hash = h256_from_hex(params[base + 1].as_str()?)?;
            let target_hex = pad_target_hex(params[base + 2].as_str()?);
            work.boundary = h256_from_hex(&target_hex)?;
            work.height = params.get(base + 3).map(param_u64).unwrap_or(0);
            work.job_id = if base == 1 {
                params[0].as_str()?.to_string()
            } else {
                params[0].as_str()?.trim_start_matches("0x").to_string()
            };
            work.job_len = work.job_id.len();
        }
        Dialect::EthereumStratum => {
            // [job, seed, header, height]; the boundary comes from the
            // session difficulty, the nonce range from the extranonce.
            if params.len() < 3 {
                warn!("notify with too few params ({})", params.len());
                return None;
            }
            let job = params[0].as_str()?;
            work.seed_hash = h256_from_hex(&pad_target_hex(params[1].as_str()?))?;
            work.header = h256_from_hex(params[2].as_str()?)?;
            work.height = params.get(3).map(param_u64).unwrap_or(0);
            work.boundary = diff_to_target(st.next_work_difficulty);
            work.job_len = job.len();
            work.job_id = format!("{:0<32}", job);
            work.start_nonce = st.start_nonce();
            work.extra_size_bits = 4 * st.extra_nonce_hex_size as i32;
        }
    }

    if work.header == st.current_header {
        return None;
    }
    if !work.derive_epoch() {
        warn!(
            "seed hash {} does not belong to a known epoch; ignoring job",
            hex::encode(work.seed_hash)
        );
        return None;
    }

    st.current_header = work.header;
    info!(
        "new job {} height {} epoch {}",
        &work.job_id[..work.job_len.min(work.job_id.len())],
        work.height,
        work.epoch
    );
    Some(work)
}

/// Heights arrive as numbers, decimal strings or 0x-hex strings.
fn param_u64(v: &Value) -> u64 {
    if let Some(n) = v.as_u64() {
        return n;
    }
    if let Some(s) = v.as_str() {
        if let Some(hex_digits) = s.strip_prefix("0x") {
            return u64::from_str_radix(hex_digits, 16).unwrap_or(0);
        }
        return s.parse().unwrap_or(0);
    }
    0
}

async fn send_line(
    framed: &mut Framed<PoolStream, LinesCodec>,
    line: String,
) -> Result<(), EngineError> {
    debug!("tx: {}", line);
    tokio::time::timeout(SOCKET_TIMEOUT, framed.send(line))
        .await
        .map_err(|_| EngineError::WriteTimeout)?
        .map_err(EngineError::from)
}
