//! Upstream pool session.
//!
//! One per configured pool. Holds the TCP (or TLS) connection, performs the
//! subscribe/authorize handshake, keeps the job ring and current difficulty,
//! and correlates `mining.submit` responses by request id. Reconnects with
//! jittered exponential backoff. Readers elsewhere in the proxy never touch
//! session internals; they observe an immutable [`UpstreamSnapshot`] that is
//! replaced, not mutated, on every change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, PoolFlavour, PoolId};
use crate::events::{Event, EventBus};
use crate::jobs::{Job, JobPresence, JobRing, JOB_RING_CAPACITY};
use crate::metrics::prometheus as metrics;
use crate::stratum::codec::{read_frame, FrameError};
use crate::stratum::protocol::{classify, Inbound, RpcReply};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(120);
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Consecutive submit timeouts before the session is considered unhealthy
/// and forced to reconnect.
pub const UNHEALTHY_TIMEOUTS: u32 = 5;

const USER_AGENT: &str = concat!("dpmp-proxy/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamState {
    Connecting,
    Subscribing,
    Authorizing,
    Ready,
    Reconnecting,
    Down,
}

/// How a miner submit maps back into this upstream's extranonce space.
/// Fixed per connection at subscribe time; replaced on `mining.set_extranonce`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtranonceLayout {
    pub extranonce1: String,
    pub extranonce2_size: usize,
    /// Bytes of the miner's session counter embedded at the front of the
    /// upstream extranonce2.
    pub counter_bytes: usize,
    /// Zero bytes appended to fill the upstream extranonce2 width.
    pub pad_bytes: usize,
    /// Bytes of the miner-chosen extranonce2 that survive.
    pub miner_bytes: usize,
}

impl ExtranonceLayout {
    pub fn for_sizes(
        extranonce1: String,
        extranonce2_size: usize,
        miner_extranonce2_size: usize,
    ) -> Self {
        let counter_bytes = extranonce2_size
            .saturating_sub(miner_extranonce2_size)
            .min(2);
        let miner_bytes = miner_extranonce2_size.min(extranonce2_size - counter_bytes);
        let pad_bytes = extranonce2_size - counter_bytes - miner_bytes;
        Self {
            extranonce1,
            extranonce2_size,
            counter_bytes,
            pad_bytes,
            miner_bytes,
        }
    }

    /// Rebuild the pool-bound extranonce2 from the per-miner session counter
    /// and the miner's chosen extranonce2 hex.
    pub fn rebuild_extranonce2(&self, session_counter: u16, miner_extranonce2: &str) -> String {
        let counter_hex = format!("{:04x}", session_counter);
        let counter_part = &counter_hex[4 - self.counter_bytes * 2..];
        let miner_take = (self.miner_bytes * 2).min(miner_extranonce2.len());
        format!(
            "{}{}{}",
            counter_part,
            &miner_extranonce2[..miner_take],
            "0".repeat(self.pad_bytes * 2)
        )
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamSnapshot {
    pub pool_id: PoolId,
    pub state: UpstreamState,
    pub extranonce: Option<ExtranonceLayout>,
    pub difficulty: f64,
    pub version_rolling_mask: Option<String>,
    pub latest_job: Option<Arc<Job>>,
}

impl UpstreamSnapshot {
    fn empty(pool_id: PoolId) -> Self {
        Self {
            pool_id,
            state: UpstreamState::Down,
            extranonce: None,
            difficulty: 0.0,
            version_rolling_mask: None,
            latest_job: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == UpstreamState::Ready
    }

    pub fn last_job_age(&self) -> Option<Duration> {
        self.latest_job.as_ref().map(|j| j.received_at.elapsed())
    }
}

#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    StateChanged { pool: PoolId, state: UpstreamState },
    NewJob { pool: PoolId, job: Arc<Job> },
    DifficultyChanged { pool: PoolId, difficulty: f64 },
    ExtranonceChanged { pool: PoolId, layout: ExtranonceLayout },
}

/// Outcome of one forwarded submit, paired by request id.
#[derive(Debug, Clone)]
pub enum SubmitVerdict {
    Accepted { result: Value },
    Rejected { result: Value, error: Option<Value> },
    Timeout,
    Disconnected,
}

struct PendingEntry {
    tx: oneshot::Sender<RpcReply>,
    sent_at: Instant,
}

enum LineOutcome {
    Continue,
    Reply(RpcReply),
    Reconnect,
}

trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}
type BoxedStream = Box<dyn IoStream>;

pub struct UpstreamSession {
    pool_id: PoolId,
    config: PoolConfig,
    miner_extranonce2_size: usize,
    snapshot_tx: watch::Sender<Arc<UpstreamSnapshot>>,
    events_tx: broadcast::Sender<UpstreamEvent>,
    bus: Arc<EventBus>,
    jobs: Mutex<JobRing>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    next_id: AtomicU64,
    consecutive_timeouts: AtomicU32,
    force_reconnect: Notify,
    /// Endpoint suggested by `client.reconnect`, honoured on the next attempt.
    redirect: Mutex<Option<(String, u16)>>,
    shutdown: watch::Receiver<bool>,
}

impl UpstreamSession {
    pub fn new(
        pool_id: PoolId,
        config: PoolConfig,
        miner_extranonce2_size: usize,
        events_tx: broadcast::Sender<UpstreamEvent>,
        bus: Arc<EventBus>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(Arc::new(UpstreamSnapshot::empty(pool_id)));
        Arc::new(Self {
            pool_id,
            config,
            miner_extranonce2_size,
            snapshot_tx,
            events_tx,
            bus,
            jobs: Mutex::new(JobRing::new(JOB_RING_CAPACITY)),
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            consecutive_timeouts: AtomicU32::new(0),
            force_reconnect: Notify::new(),
            redirect: Mutex::new(None),
            shutdown,
        })
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<UpstreamSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<Arc<UpstreamSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Session loop: connect, handshake, read until failure, back off, retry.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = BACKOFF_BASE;
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(UpstreamState::Connecting);
            let session = match self.connect_stream().await {
                Ok(stream) => self.drive_session(stream).await,
                Err(e) => {
                    warn!("[{}] connect failed: {}", self.pool_id, e);
                    Err(e)
                }
            };

            // A session that made it to Ready resets the backoff even if it
            // later died with an error.
            let reached_ready = self.snapshot().state == UpstreamState::Ready;
            if let Err(e) = session {
                warn!("[{}] session ended: {}", self.pool_id, e);
                self.bus.emit(Event::PoolDisconnected {
                    pool: self.pool_id,
                    reason: e.to_string(),
                });
            }

            self.teardown().await;

            if *shutdown.borrow() {
                break;
            }

            if reached_ready {
                backoff = BACKOFF_BASE;
            }

            self.set_state(UpstreamState::Reconnecting);
            metrics::inc_reconnect(self.pool_id.label());

            let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            let delay = backoff + Duration::from_millis(jitter_ms);
            debug!("[{}] reconnecting in {:?}", self.pool_id, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }

            backoff = (backoff * 2).min(BACKOFF_CAP);
        }

        self.teardown().await;
        self.set_state(UpstreamState::Down);
    }

    async fn connect_stream(&self) -> Result<BoxedStream> {
        let (host, port) = match self.redirect.lock().await.take() {
            Some((h, p)) => (h, p),
            None => (self.config.host.clone(), self.config.port),
        };
        let addr = format!("{}:{}", host, port);

        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", addr))?
            .with_context(|| format!("connect to {}", addr))?;
        tcp.set_nodelay(true).ok();

        if self.config.tls {
            let connector = native_tls::TlsConnector::builder()
                .build()
                .context("building TLS connector")?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let stream = connector
                .connect(&host, tcp)
                .await
                .with_context(|| format!("TLS handshake with {}", addr))?;
            Ok(Box::new(stream))
        } else {
            Ok(Box::new(tcp))
        }
    }

    async fn drive_session(&self, stream: BoxedStream) -> Result<()> {
        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);

        let mut reader = BufReader::new(read_half);
        self.handshake(&mut reader).await?;
        self.read_loop(&mut reader).await
    }

    async fn handshake<R>(&self, reader: &mut R) -> Result<()>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        self.set_state(UpstreamState::Subscribing);

        let reply = self
            .request(reader, "mining.subscribe", json!([USER_AGENT]))
            .await?;
        if reply.is_error() {
            self.set_state(UpstreamState::Down);
            bail!("subscribe rejected: {:?}", reply.error);
        }
        let layout = self.parse_subscribe_result(&reply.result)?;
        info!(
            "[{}] subscribed: extranonce1={} extranonce2_size={}",
            self.pool_id, layout.extranonce1, layout.extranonce2_size
        );
        self.update_snapshot(|s| s.extranonce = Some(layout.clone()));

        // ck-type pools require the extranonce subscription before authorize.
        if self.config.flavour == PoolFlavour::CkType {
            let reply = self
                .request(reader, "mining.extranonce.subscribe", json!([]))
                .await?;
            if reply.is_error() {
                debug!(
                    "[{}] extranonce.subscribe not honoured: {:?}",
                    self.pool_id, reply.error
                );
            }
        }

        self.set_state(UpstreamState::Authorizing);
        let reply = self
            .request(
                reader,
                "mining.authorize",
                json!([self.config.user, self.config.pass]),
            )
            .await?;
        if reply.is_error() || reply.result.as_bool() != Some(true) {
            self.set_state(UpstreamState::Down);
            bail!(
                "authorize rejected for {}: result={:?} error={:?}",
                self.config.user,
                reply.result,
                reply.error
            );
        }

        if self.config.flavour == PoolFlavour::Generic && self.config.extranonce_subscribe {
            let reply = self
                .request(reader, "mining.extranonce.subscribe", json!([]))
                .await?;
            if reply.is_error() {
                debug!(
                    "[{}] extranonce.subscribe not honoured: {:?}",
                    self.pool_id, reply.error
                );
            }
        }

        self.consecutive_timeouts.store(0, Ordering::Relaxed);
        self.set_state(UpstreamState::Ready);
        info!("[{}] ready as {}", self.pool_id, self.config.user);
        Ok(())
    }

    /// Write a request and pump frames until its reply arrives. Notifications
    /// received meanwhile (ck-type pools push difficulty before the first
    /// job) are processed normally.
    async fn request<R>(&self, reader: &mut R, method: &str, params: Value) -> Result<RpcReply>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write_line(&json!({"id": id, "method": method, "params": params}))
            .await?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut buf = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("{} timed out", method);
            }
            let frame = timeout(remaining, read_frame(reader, &mut buf))
                .await
                .map_err(|_| anyhow!("{} timed out", method))?;
            let line = match frame {
                Ok(Some(line)) => line,
                Ok(None) => bail!("connection closed during {}", method),
                Err(e) => return Err(self.frame_error(e)),
            };
            if line.is_empty() {
                continue;
            }
            match self.handle_line(&line).await? {
                LineOutcome::Reply(reply) if reply.id == id => return Ok(reply),
                LineOutcome::Reply(reply) => {
                    debug!("[{}] dropping unexpected reply id={}", self.pool_id, reply.id);
                }
                LineOutcome::Reconnect => bail!("pool requested reconnect during {}", method),
                LineOutcome::Continue => {}
            }
        }
    }

    async fn read_loop<R>(&self, reader: &mut R) -> Result<()>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        let mut shutdown = self.shutdown.clone();
        let mut buf = Vec::new();

        loop {
            tokio::select! {
                frame = timeout(IDLE_READ_TIMEOUT, read_frame(reader, &mut buf)) => {
                    let line = match frame {
                        Err(_) => bail!("no traffic for {:?}, forcing reconnect", IDLE_READ_TIMEOUT),
                        Ok(Ok(Some(line))) => line,
                        Ok(Ok(None)) => bail!("connection closed by pool"),
                        Ok(Err(e)) => return Err(self.frame_error(e)),
                    };
                    if line.is_empty() {
                        continue;
                    }
                    match self.handle_line(&line).await? {
                        LineOutcome::Reconnect => {
                            info!("[{}] honoring client.reconnect", self.pool_id);
                            return Ok(());
                        }
                        LineOutcome::Reply(reply) => {
                            debug!("[{}] unmatched reply id={}", self.pool_id, reply.id);
                        }
                        LineOutcome::Continue => {}
                    }
                }
                _ = self.force_reconnect.notified() => {
                    warn!("[{}] forced reconnect ({} consecutive submit timeouts)",
                        self.pool_id, self.consecutive_timeouts.load(Ordering::Relaxed));
                    return Ok(());
                }
                _ = shutdown.changed() => {
                    return Ok(());
                }
            }
        }
    }

    fn frame_error(&self, e: FrameError) -> anyhow::Error {
        metrics::inc_protocol_error();
        self.bus.emit(Event::ProtocolError {
            pool: Some(self.pool_id),
            detail: e.to_string(),
        });
        anyhow!("framing error: {}", e)
    }

    async fn handle_line(&self, line: &str) -> Result<LineOutcome> {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                metrics::inc_protocol_error();
                self.bus.emit(Event::ProtocolError {
                    pool: Some(self.pool_id),
                    detail: format!("malformed JSON: {}", e),
                });
                bail!("malformed JSON from pool: {}", e);
            }
        };

        let inbound = match classify(value) {
            Ok(i) => i,
            Err(e) => {
                metrics::inc_protocol_error();
                self.bus.emit(Event::ProtocolError {
                    pool: Some(self.pool_id),
                    detail: e.to_string(),
                });
                bail!("unclassifiable message from pool: {}", e);
            }
        };

        match inbound {
            Inbound::Notification(n) => self.handle_notification(n.method.as_str(), &n.params).await,
            Inbound::Response(reply) => {
                if let Some(entry) = self.pending.lock().await.remove(&reply.id) {
                    self.consecutive_timeouts.store(0, Ordering::Relaxed);
                    let _ = entry.tx.send(reply);
                    return Ok(LineOutcome::Continue);
                }
                Ok(LineOutcome::Reply(reply))
            }
            Inbound::Request(r) => {
                // Pools do not issue requests that expect an answer from us
                // beyond the notification set; log and move on.
                debug!("[{}] unexpected request from pool: {}", self.pool_id, r.method);
                Ok(LineOutcome::Continue)
            }
        }
    }

    async fn handle_notification(&self, method: &str, params: &[Value]) -> Result<LineOutcome> {
        match method {
            "mining.notify" => {
                let difficulty = self.snapshot().difficulty;
                let job = Arc::new(Job::from_notify(self.pool_id, params, difficulty)?);
                debug!(
                    "[{}] job {} (diff {}, clean={})",
                    self.pool_id, job.pool_job_id, job.difficulty, job.clean_jobs
                );
                self.jobs.lock().await.push(job.clone());
                self.update_snapshot(|s| s.latest_job = Some(job.clone()));
                metrics::inc_job_received(self.pool_id.label());
                let _ = self.events_tx.send(UpstreamEvent::NewJob {
                    pool: self.pool_id,
                    job,
                });
            }
            "mining.set_difficulty" => {
                let difficulty = params
                    .first()
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| anyhow!("set_difficulty without numeric param"))?;
                debug!("[{}] difficulty {}", self.pool_id, difficulty);
                self.update_snapshot(|s| s.difficulty = difficulty);
                metrics::set_upstream_difficulty(self.pool_id.label(), difficulty);
                let _ = self.events_tx.send(UpstreamEvent::DifficultyChanged {
                    pool: self.pool_id,
                    difficulty,
                });
            }
            "mining.set_extranonce" => {
                let extranonce1 = params
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("set_extranonce without extranonce1"))?
                    .to_string();
                let extranonce2_size = params
                    .get(1)
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| anyhow!("set_extranonce without extranonce2_size"))?
                    as usize;
                let layout = ExtranonceLayout::for_sizes(
                    extranonce1,
                    extranonce2_size,
                    self.miner_extranonce2_size,
                );
                info!(
                    "[{}] extranonce changed: {} / {}B",
                    self.pool_id, layout.extranonce1, layout.extranonce2_size
                );
                self.update_snapshot(|s| s.extranonce = Some(layout.clone()));
                self.bus.emit(Event::ExtranonceChange {
                    pool: self.pool_id,
                    extranonce2_size,
                });
                let _ = self.events_tx.send(UpstreamEvent::ExtranonceChanged {
                    pool: self.pool_id,
                    layout,
                });
            }
            "mining.set_version_mask" => {
                if let Some(mask) = params.first().and_then(|v| v.as_str()) {
                    let mask = mask.to_string();
                    self.update_snapshot(|s| s.version_rolling_mask = Some(mask.clone()));
                }
            }
            "client.reconnect" => {
                let host = params.first().and_then(|v| v.as_str()).map(|s| s.to_string());
                let port = params.get(1).and_then(|v| v.as_u64()).map(|p| p as u16);
                if let (Some(host), Some(port)) = (host, port) {
                    if !host.is_empty() && port != 0 {
                        info!("[{}] pool redirects to {}:{}", self.pool_id, host, port);
                        *self.redirect.lock().await = Some((host, port));
                    }
                }
                return Ok(LineOutcome::Reconnect);
            }
            other => {
                debug!("[{}] unhandled notification: {}", self.pool_id, other);
            }
        }
        Ok(LineOutcome::Continue)
    }

    /// Submit a share upstream and wait for the pool's verdict.
    pub async fn submit_share(
        &self,
        pool_job_id: &str,
        extranonce2: &str,
        ntime: &str,
        nonce: &str,
    ) -> SubmitVerdict {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(id, PendingEntry { tx, sent_at: Instant::now() });

        let request = json!({
            "id": id,
            "method": "mining.submit",
            "params": [self.config.user, pool_job_id, extranonce2, ntime, nonce],
        });

        if let Err(e) = self.write_line(&request).await {
            self.pending.lock().await.remove(&id);
            debug!("[{}] submit write failed: {}", self.pool_id, e);
            return SubmitVerdict::Disconnected;
        }
        metrics::inc_forwarded(self.pool_id.label());

        match timeout(SUBMIT_TIMEOUT, rx).await {
            Ok(Ok(reply)) => {
                if !reply.is_error() && reply.result.as_bool() == Some(true) {
                    SubmitVerdict::Accepted { result: reply.result }
                } else {
                    SubmitVerdict::Rejected {
                        result: reply.result,
                        error: reply.error,
                    }
                }
            }
            Ok(Err(_)) => SubmitVerdict::Disconnected,
            Err(_) => {
                self.pending.lock().await.remove(&id);
                metrics::inc_share_timeout(self.pool_id.label());
                let timeouts = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                if timeouts >= UNHEALTHY_TIMEOUTS {
                    self.force_reconnect.notify_waiters();
                }
                SubmitVerdict::Timeout
            }
        }
    }

    /// Grade a pool job id against the ring and the stale-grace window.
    pub async fn job_presence(&self, pool_job_id: &str, grace: Duration) -> JobPresence {
        self.jobs
            .lock()
            .await
            .presence(pool_job_id, grace, Instant::now())
    }

    pub async fn latest_job(&self) -> Option<Arc<Job>> {
        self.jobs.lock().await.latest()
    }

    /// Drop pending submits older than `max_age` and aged eviction records.
    pub async fn prune(&self, max_age: Duration, evicted_max_age: Duration) {
        let now = Instant::now();
        self.pending
            .lock()
            .await
            .retain(|_, entry| now.saturating_duration_since(entry.sent_at) <= max_age);
        self.jobs.lock().await.prune_evicted(evicted_max_age, now);
    }

    async fn write_line(&self, value: &Value) -> Result<()> {
        let mut payload = serde_json::to_vec(value)?;
        payload.push(b'\n');

        // Single-writer lock: concurrent submitters serialize here, so lines
        // are emitted atomically.
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        stream.write_all(&payload).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn teardown(&self) {
        *self.writer.lock().await = None;
        self.jobs.lock().await.clear();
        self.update_snapshot(|s| {
            s.latest_job = None;
            s.extranonce = None;
        });
        // Pending submitters learn the connection is gone.
        self.pending.lock().await.clear();
    }

    fn set_state(&self, state: UpstreamState) {
        let previous = self.snapshot().state;
        if previous == state {
            return;
        }
        self.update_snapshot(|s| s.state = state);
        metrics::set_upstream_ready(self.pool_id.label(), state == UpstreamState::Ready);
        let _ = self.events_tx.send(UpstreamEvent::StateChanged {
            pool: self.pool_id,
            state,
        });
    }

    fn update_snapshot<F: FnOnce(&mut UpstreamSnapshot)>(&self, f: F) {
        let mut next = (**self.snapshot_tx.borrow()).clone();
        f(&mut next);
        let _ = self.snapshot_tx.send(Arc::new(next));
    }

    fn parse_subscribe_result(&self, result: &Value) -> Result<ExtranonceLayout> {
        // Standard shape: [[["mining.notify", sid], ...], extranonce1, extranonce2_size]
        let arr = result
            .as_array()
            .ok_or_else(|| anyhow!("subscribe result is not an array"))?;
        if arr.len() < 3 {
            bail!("subscribe result too short: {} elements", arr.len());
        }
        let extranonce1 = arr[1]
            .as_str()
            .ok_or_else(|| anyhow!("subscribe result missing extranonce1"))?
            .to_string();
        let extranonce2_size = arr[2]
            .as_u64()
            .ok_or_else(|| anyhow!("subscribe result missing extranonce2_size"))?
            as usize;
        if extranonce2_size == 0 {
            bail!("pool advertises zero extranonce2_size");
        }
        if extranonce2_size < self.miner_extranonce2_size + 2 {
            warn!(
                "[{}] extranonce2_size {} leaves less than {}B of miner space; \
                 uniqueness degrades across miners",
                self.pool_id,
                extranonce2_size,
                self.miner_extranonce2_size + 2
            );
        }
        Ok(ExtranonceLayout::for_sizes(
            extranonce1,
            extranonce2_size,
            self.miner_extranonce2_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_embeds_counter_and_pads() {
        // Upstream gives 8 bytes: 2 counter + 4 miner + 2 pad.
        let layout = ExtranonceLayout::for_sizes("ab12".into(), 8, 4);
        assert_eq!(layout.counter_bytes, 2);
        assert_eq!(layout.miner_bytes, 4);
        assert_eq!(layout.pad_bytes, 2);

        let rebuilt = layout.rebuild_extranonce2(0x0102, "deadbeef");
        assert_eq!(rebuilt, "0102deadbeef0000");
        assert_eq!(rebuilt.len(), layout.extranonce2_size * 2);
    }

    #[test]
    fn layout_with_exact_fit() {
        let layout = ExtranonceLayout::for_sizes("ab".into(), 6, 4);
        assert_eq!(layout.counter_bytes, 2);
        assert_eq!(layout.pad_bytes, 0);
        assert_eq!(layout.rebuild_extranonce2(0xffff, "00112233"), "ffff00112233");
    }

    #[test]
    fn layout_shrinks_counter_when_space_is_tight() {
        // 5 bytes: only 1 byte left over for the counter.
        let layout = ExtranonceLayout::for_sizes("ab".into(), 5, 4);
        assert_eq!(layout.counter_bytes, 1);
        assert_eq!(layout.miner_bytes, 4);
        let rebuilt = layout.rebuild_extranonce2(0x0102, "deadbeef");
        assert_eq!(rebuilt, "02deadbeef");
    }

    #[test]
    fn layout_truncates_miner_bytes_when_upstream_is_narrow() {
        let layout = ExtranonceLayout::for_sizes("ab".into(), 3, 4);
        assert_eq!(layout.counter_bytes, 0);
        assert_eq!(layout.miner_bytes, 3);
        assert_eq!(layout.rebuild_extranonce2(1, "deadbeef"), "deadbe");
    }
}
