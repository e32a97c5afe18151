//! Downstream miner sessions.
//!
//! The proxy presents itself as a pool: it accepts `mining.subscribe` /
//! `mining.authorize` / `mining.submit`, advertises its own stable
//! extranonce1 (`proxy_prefix ∥ session_counter`), rewrites job ids before
//! forwarding, and keeps the per-session attribution map the router resolves
//! submits against. Each connection gets a reader loop and a single writer
//! task; all writes to one miner funnel through its outbound channel, so
//! `mining.set_difficulty` before `mining.notify` ordering on a pool switch
//! holds by construction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{PoolId, StratumConfig};
use crate::events::{Event, EventBus};
use crate::jobs::Job;
use crate::metrics::prometheus as metrics;
use crate::router::ShareRouter;
use crate::scheduler::{MinerSwitch, Scheduler};
use crate::stratum::codec::{read_frame, FrameError};
use crate::stratum::protocol::{StratumError, StratumRequest, StratumResponse};
use crate::upstream::{UpstreamSession, UpstreamSnapshot};

/// Extranonce2 width advertised to miners, independent of either upstream.
pub const MINER_EXTRANONCE2_SIZE: usize = 4;

/// Recent-submits window per session for duplicate detection.
pub const DUPLICATE_WINDOW: usize = 2048;

/// Proxy job-id mappings retained per session.
const JOB_MAP_CAPACITY: usize = 256;

/// First two bytes of every downstream extranonce1.
pub const PROXY_EXTRANONCE_PREFIX: u16 = 0x6d78;

pub type SharedUpstreams = Arc<RwLock<HashMap<PoolId, Arc<UpstreamSession>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MinerState {
    Hello,
    Subscribed,
    Authorized,
    Active,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubmitKey {
    pub proxy_job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
}

/// Which pool a proxy job id belongs to. Immutable once minted: a later
/// pool switch never rewrites older mappings, so late submits still land on
/// the pool that issued the job.
#[derive(Debug, Clone)]
pub struct JobAttribution {
    pub pool_id: PoolId,
    pub pool_job_id: String,
}

pub struct MinerConn {
    pub session_id: String,
    pub peer_addr: SocketAddr,
    pub state: MinerState,
    pub session_counter: u16,
    pub extranonce1: String,
    pub extranonce2_size: usize,
    pub username: Option<String>,
    pub user_agent: Option<String>,
    pub advertised_difficulty: f64,
    pub suggested_difficulty: Option<f64>,
    pub active_pool: Option<PoolId>,
    pub connected_at: Instant,
    pub shares_submitted: u64,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    job_map: HashMap<String, JobAttribution>,
    job_order: VecDeque<String>,
    recent_submits: HashSet<SubmitKey>,
    recent_order: VecDeque<(SubmitKey, Instant)>,
    pub outbound: Option<mpsc::UnboundedSender<String>>,
}

impl MinerConn {
    pub fn new(session_id: String, peer_addr: SocketAddr, session_counter: u16) -> Self {
        Self {
            session_id,
            peer_addr,
            state: MinerState::Hello,
            session_counter,
            extranonce1: format!("{:04x}{:04x}", PROXY_EXTRANONCE_PREFIX, session_counter),
            extranonce2_size: MINER_EXTRANONCE2_SIZE,
            username: None,
            user_agent: None,
            advertised_difficulty: 0.0,
            suggested_difficulty: None,
            active_pool: None,
            connected_at: Instant::now(),
            shares_submitted: 0,
            shares_accepted: 0,
            shares_rejected: 0,
            job_map: HashMap::new(),
            job_order: VecDeque::new(),
            recent_submits: HashSet::new(),
            recent_order: VecDeque::new(),
            outbound: None,
        }
    }

    /// Queue one line for the writer task.
    pub fn send(&self, message: &Value) {
        if let Some(tx) = &self.outbound {
            let mut line = message.to_string();
            line.push('\n');
            let _ = tx.send(line);
        }
    }

    pub fn record_job(&mut self, proxy_job_id: String, attribution: JobAttribution) {
        self.job_order.push_back(proxy_job_id.clone());
        self.job_map.insert(proxy_job_id, attribution);
        while self.job_order.len() > JOB_MAP_CAPACITY {
            if let Some(old) = self.job_order.pop_front() {
                self.job_map.remove(&old);
            }
        }
    }

    pub fn attribution(&self, proxy_job_id: &str) -> Option<JobAttribution> {
        self.job_map.get(proxy_job_id).cloned()
    }

    /// Record a submit tuple; `false` means it was already seen.
    pub fn check_and_record_submit(&mut self, key: SubmitKey, now: Instant) -> bool {
        if self.recent_submits.contains(&key) {
            return false;
        }
        self.recent_submits.insert(key.clone());
        self.recent_order.push_back((key, now));
        while self.recent_order.len() > DUPLICATE_WINDOW {
            if let Some((old, _)) = self.recent_order.pop_front() {
                self.recent_submits.remove(&old);
            }
        }
        true
    }

    pub fn prune_submits(&mut self, max_age: Duration, now: Instant) {
        while let Some((key, at)) = self.recent_order.front() {
            if now.saturating_duration_since(*at) <= max_age {
                break;
            }
            self.recent_submits.remove(key);
            self.recent_order.pop_front();
        }
    }

    pub fn record_share(&mut self, accepted: bool) {
        self.shares_submitted += 1;
        if accepted {
            self.shares_accepted += 1;
        } else {
            self.shares_rejected += 1;
        }
    }

    /// Push `mining.set_difficulty` unconditionally. Pool switches must
    /// always re-advertise, even when both pools sit at the same value.
    fn push_difficulty(&mut self, difficulty: f64) {
        if difficulty <= 0.0 {
            return;
        }
        self.send(&json!({
            "id": Value::Null,
            "method": "mining.set_difficulty",
            "params": [difficulty],
        }));
        self.advertised_difficulty = difficulty;
    }

    /// Push `mining.set_difficulty` only if the advertised value differs.
    fn sync_difficulty(&mut self, difficulty: f64) {
        if (self.advertised_difficulty - difficulty).abs() > f64::EPSILON {
            self.push_difficulty(difficulty);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MinerStatus {
    pub session_id: String,
    pub peer: String,
    pub state: MinerState,
    pub username: Option<String>,
    pub active_pool: Option<PoolId>,
    pub difficulty: f64,
    pub shares_submitted: u64,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub uptime_secs: u64,
}

pub struct DownstreamServer {
    cfg: StratumConfig,
    connections: Arc<RwLock<HashMap<String, Arc<RwLock<MinerConn>>>>>,
    connection_count: AtomicUsize,
    per_ip: RwLock<HashMap<IpAddr, usize>>,
    scheduler: Arc<Scheduler>,
    router: Arc<ShareRouter>,
    upstreams: SharedUpstreams,
    session_counter: Arc<AtomicU64>,
    proxy_job_seq: Arc<AtomicU64>,
    bus: Arc<EventBus>,
    shutdown: watch::Receiver<bool>,
    bound_addr: watch::Sender<Option<SocketAddr>>,
}

impl DownstreamServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: StratumConfig,
        scheduler: Arc<Scheduler>,
        router: Arc<ShareRouter>,
        upstreams: SharedUpstreams,
        session_counter: Arc<AtomicU64>,
        proxy_job_seq: Arc<AtomicU64>,
        bus: Arc<EventBus>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (bound_addr, _) = watch::channel(None);
        Arc::new(Self {
            cfg,
            connections: Arc::new(RwLock::new(HashMap::new())),
            connection_count: AtomicUsize::new(0),
            per_ip: RwLock::new(HashMap::new()),
            scheduler,
            router,
            upstreams,
            session_counter,
            proxy_job_seq,
            bus,
            shutdown,
            bound_addr,
        })
    }

    /// The address actually bound, once listening. Lets tests use port 0.
    pub fn bound_addr(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.bound_addr.subscribe()
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let sock_addr: SocketAddr = self
            .cfg
            .bind
            .parse()
            .map_err(|e| anyhow!("invalid stratum bind '{}': {}", self.cfg.bind, e))?;

        let socket = socket2::Socket::new(
            match sock_addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket2::SockAddr::from(sock_addr))?;
        socket.listen(1024)?;
        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;

        let local = listener.local_addr()?;
        let _ = self.bound_addr.send(Some(local));
        info!("stratum listening on {}", local);

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => self.clone().accept(socket, peer_addr).await,
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    info!("stratum listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn accept(self: Arc<Self>, mut socket: TcpStream, peer_addr: SocketAddr) {
        if self.connection_count.load(Ordering::Relaxed) >= self.cfg.max_connections {
            warn!("max connections ({}) reached, rejecting {}", self.cfg.max_connections, peer_addr);
            let _ = socket.shutdown().await;
            return;
        }

        {
            let per_ip = self.per_ip.read().await;
            if per_ip.get(&peer_addr.ip()).copied().unwrap_or(0) >= self.cfg.max_connections_per_ip {
                warn!("per-IP limit reached for {}, rejecting", peer_addr.ip());
                let _ = socket.shutdown().await;
                return;
            }
        }
        *self.per_ip.write().await.entry(peer_addr.ip()).or_insert(0) += 1;

        let server = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(e) = server.clone().handle_connection(socket, peer_addr).await {
                debug!("miner connection {} ended: {}", peer_addr, e);
            }
            server.finish_connection(peer_addr).await;
        });
    }

    async fn finish_connection(&self, peer_addr: SocketAddr) {
        let mut per_ip = self.per_ip.write().await;
        if let Some(count) = per_ip.get_mut(&peer_addr.ip()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(&peer_addr.ip());
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let session_id = Uuid::new_v4().to_string();

        // Session counters are minted once per proxy lifetime; refusing new
        // miners past the 16-bit space beats recycling another session's
        // extranonce.
        let raw_counter = self.session_counter.fetch_add(1, Ordering::Relaxed);
        if raw_counter > u16::MAX as u64 {
            warn!("session counter space exhausted, rejecting {}", peer_addr);
            return Err(anyhow!("session counter space exhausted"));
        }
        let counter = raw_counter as u16;

        let connection = Arc::new(RwLock::new(MinerConn::new(
            session_id.clone(),
            peer_addr,
            counter,
        )));

        self.connections
            .write()
            .await
            .insert(session_id.clone(), Arc::clone(&connection));
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        metrics::inc_connections();
        info!("miner connected from {} (session {})", peer_addr, &session_id[..8]);

        let (reader_half, mut writer_half) = socket.into_split();
        let mut reader = BufReader::new(reader_half);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        connection.write().await.outbound = Some(tx);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if writer_half.write_all(message.as_bytes()).await.is_err() {
                    break;
                }
                let _ = writer_half.flush().await;
            }
        });

        let mut shutdown = self.shutdown.clone();
        let mut buf = Vec::new();
        let result = loop {
            tokio::select! {
                frame = read_frame(&mut reader, &mut buf) => {
                    match frame {
                        Ok(Some(line)) if line.is_empty() => continue,
                        Ok(Some(line)) => {
                            if let Err(e) = self.handle_message(&connection, &line).await {
                                // Protocol violation: answer with a short
                                // diagnostic and drop the session. The miner
                                // reconnects on its own.
                                metrics::inc_protocol_error();
                                let conn = connection.read().await;
                                conn.send(&json!({
                                    "id": Value::Null,
                                    "result": Value::Null,
                                    "error": StratumError::new(StratumError::UNKNOWN, e.to_string()).to_array(),
                                }));
                                break Err(e);
                            }
                        }
                        Ok(None) => break Ok(()),
                        Err(e @ FrameError::Oversize) | Err(e @ FrameError::Utf8) => {
                            metrics::inc_protocol_error();
                            break Err(anyhow!(e));
                        }
                        Err(FrameError::Io(e)) => break Err(anyhow!(e)),
                    }
                }
                _ = shutdown.changed() => {
                    let conn = connection.read().await;
                    conn.send(&json!({
                        "id": Value::Null,
                        "method": "client.reconnect",
                        "params": [],
                    }));
                    break Ok(());
                }
            }
        };

        // Teardown.
        {
            let mut conn = connection.write().await;
            conn.state = MinerState::Closing;
            conn.outbound = None;
        }
        self.connections.write().await.remove(&session_id);
        self.connection_count.fetch_sub(1, Ordering::Relaxed);
        self.scheduler.unregister_miner(&session_id);
        metrics::dec_connections();
        self.bus.emit(Event::MinerDisconnected { miner: session_id.clone() });
        info!("miner {} disconnected ({})", &session_id[..8], peer_addr);

        result
    }

    async fn handle_message(&self, connection: &Arc<RwLock<MinerConn>>, line: &str) -> Result<()> {
        let request: StratumRequest =
            serde_json::from_str(line).map_err(|e| anyhow!("invalid JSON: {}", e))?;

        debug!("miner request: {}", request.method);
        let response = match request.method.as_str() {
            "mining.subscribe" => Some(self.handle_subscribe(connection, &request).await),
            "mining.authorize" => {
                self.handle_authorize(connection, &request).await?;
                None
            }
            "mining.submit" => Some(self.handle_submit(connection, &request).await?),
            "mining.suggest_difficulty" => Some(self.handle_suggest(connection, &request).await),
            "mining.extranonce.subscribe" => {
                Some(StratumResponse::ok(request.id.clone(), json!(true)))
            }
            other => Some(StratumResponse::err(
                request.id.clone(),
                StratumError::invalid_method(other),
            )),
        };

        if let Some(response) = response {
            let conn = connection.read().await;
            conn.send(&serde_json::to_value(response)?);
        }
        Ok(())
    }

    async fn handle_subscribe(
        &self,
        connection: &Arc<RwLock<MinerConn>>,
        request: &StratumRequest,
    ) -> StratumResponse {
        let params = request.params_array();
        let user_agent = params.first().and_then(|v| v.as_str()).map(|s| s.to_string());

        let mut conn = connection.write().await;
        if conn.state == MinerState::Hello {
            conn.state = MinerState::Subscribed;
        }
        conn.user_agent = user_agent;

        let subscription_id = conn.session_id.clone();
        StratumResponse::ok(
            request.id.clone(),
            json!([
                [
                    ["mining.set_difficulty", subscription_id],
                    ["mining.notify", subscription_id],
                ],
                conn.extranonce1,
                conn.extranonce2_size,
            ]),
        )
    }

    async fn handle_authorize(
        &self,
        connection: &Arc<RwLock<MinerConn>>,
        request: &StratumRequest,
    ) -> Result<()> {
        let params = request.params_array();
        let username = params
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("authorize without username"))?
            .to_string();

        let worker = username.split('.').nth(1).unwrap_or("");
        if self.cfg.deny_workers.iter().any(|w| w == worker || w == &username) {
            warn!("refusing worker {}", username);
            let conn = connection.read().await;
            conn.send(&serde_json::to_value(StratumResponse::err(
                request.id.clone(),
                StratumError::unauthorized_worker(),
            ))?);
            return Ok(());
        }

        let session_id = {
            let mut conn = connection.write().await;
            conn.username = Some(username.clone());
            if conn.state == MinerState::Hello || conn.state == MinerState::Subscribed {
                conn.state = MinerState::Authorized;
            }
            conn.send(&serde_json::to_value(StratumResponse::ok(
                request.id.clone(),
                json!(true),
            ))?);
            conn.session_id.clone()
        };
        info!("miner {} authorized as {}", &session_id[..8], username);

        // Route the miner. If no pool is usable yet the session stays
        // Authorized and quiescent until a pool recovers.
        if let Some(pool) = self.scheduler.register_miner(&session_id, Instant::now()) {
            if let Some(snapshot) = self.upstream_snapshot(pool).await {
                self.activate(connection, pool, &snapshot, true).await;
            }
        } else {
            self.bus.emit(Event::PoolUnavailable { miners: self.scheduler.miner_count() });
        }
        Ok(())
    }

    async fn handle_suggest(
        &self,
        connection: &Arc<RwLock<MinerConn>>,
        request: &StratumRequest,
    ) -> StratumResponse {
        let suggested = request.params_array().first().and_then(|v| v.as_f64());
        if let Some(difficulty) = suggested {
            // Advisory only: recorded, surfaced in status, never allowed to
            // undercut the difficulty the active pool requires.
            connection.write().await.suggested_difficulty = Some(difficulty);
        }
        StratumResponse::ok(request.id.clone(), json!(true))
    }

    async fn handle_submit(
        &self,
        connection: &Arc<RwLock<MinerConn>>,
        request: &StratumRequest,
    ) -> Result<StratumResponse> {
        let params = request.params_array();
        if params.len() < 5 {
            return Ok(StratumResponse::err(
                request.id.clone(),
                StratumError::invalid_params("mining.submit expects 5 params"),
            ));
        }

        let field = |idx: usize| -> Result<String> {
            params
                .get(idx)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| anyhow!("mining.submit param[{}] is not a string", idx))
        };

        let _username = field(0)?;
        let proxy_job_id = field(1)?;
        let extranonce2 = field(2)?;
        let ntime = field(3)?;
        let nonce = field(4)?;

        let expected_len = {
            let conn = connection.read().await;
            if conn.state != MinerState::Active && conn.state != MinerState::Authorized {
                return Ok(StratumResponse::err(
                    request.id.clone(),
                    StratumError::unauthorized_worker(),
                ));
            }
            conn.extranonce2_size * 2
        };
        if extranonce2.len() != expected_len || !is_hex(&extranonce2) {
            return Ok(StratumResponse::err(
                request.id.clone(),
                StratumError::invalid_params(format!(
                    "extranonce2 must be {} hex chars",
                    expected_len
                )),
            ));
        }
        if !is_hex(&ntime) || !is_hex(&nonce) {
            return Ok(StratumResponse::err(
                request.id.clone(),
                StratumError::invalid_params("ntime and nonce must be hex"),
            ));
        }

        let outcome = self
            .router
            .route_submit(connection, &proxy_job_id, &extranonce2, &ntime, &nonce)
            .await;

        {
            let mut conn = connection.write().await;
            conn.record_share(outcome.accepted());
        }

        Ok(outcome.into_response(request.id.clone()))
    }

    async fn upstream_snapshot(&self, pool: PoolId) -> Option<Arc<UpstreamSnapshot>> {
        let upstreams = self.upstreams.read().await;
        upstreams.get(&pool).map(|u| u.snapshot())
    }

    /// Route (or re-route) one miner to a pool: difficulty first, then the
    /// pool's latest job. `clean` forces `clean_jobs=true` on the notify.
    /// The difficulty write is unconditional; on a switch the miner gets
    /// `set_difficulty` then `notify` even when both pools advertise the
    /// same value.
    async fn activate(
        &self,
        connection: &Arc<RwLock<MinerConn>>,
        pool: PoolId,
        snapshot: &UpstreamSnapshot,
        clean: bool,
    ) {
        let mut conn = connection.write().await;
        conn.active_pool = Some(pool);
        if conn.state == MinerState::Authorized {
            conn.state = MinerState::Active;
        }

        conn.push_difficulty(snapshot.difficulty);
        if let Some(job) = &snapshot.latest_job {
            let proxy_job_id = self.mint_job_id();
            conn.record_job(
                proxy_job_id.clone(),
                JobAttribution {
                    pool_id: pool,
                    pool_job_id: job.pool_job_id.clone(),
                },
            );
            conn.send(&json!({
                "id": Value::Null,
                "method": "mining.notify",
                "params": job.notify_params(&proxy_job_id, clean),
            }));
            metrics::inc_jobs_forwarded(1);
        }
    }

    fn mint_job_id(&self) -> String {
        format!("{:x}", self.proxy_job_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Fan a new upstream job out to every miner routed to that pool.
    pub async fn forward_job(&self, pool: PoolId, job: &Arc<Job>) {
        let connections: Vec<Arc<RwLock<MinerConn>>> = {
            let map = self.connections.read().await;
            map.values().cloned().collect()
        };

        let mut forwarded = 0usize;
        let mut sample_id = String::new();
        for connection in connections {
            let mut conn = connection.write().await;
            if conn.state != MinerState::Active || conn.active_pool != Some(pool) {
                continue;
            }
            let proxy_job_id = self.mint_job_id();
            conn.record_job(
                proxy_job_id.clone(),
                JobAttribution {
                    pool_id: pool,
                    pool_job_id: job.pool_job_id.clone(),
                },
            );
            conn.sync_difficulty(job.difficulty);
            conn.send(&json!({
                "id": Value::Null,
                "method": "mining.notify",
                "params": job.notify_params(&proxy_job_id, job.clean_jobs),
            }));
            sample_id = proxy_job_id;
            forwarded += 1;
        }

        if forwarded > 0 {
            metrics::inc_jobs_forwarded(forwarded as u64);
            self.bus.emit(Event::JobForwarded {
                pool,
                job_id: sample_id,
                miners: forwarded,
            });
        }
    }

    /// Fan a difficulty change out to every miner routed to that pool.
    pub async fn forward_difficulty(&self, pool: PoolId, difficulty: f64) {
        let connections: Vec<Arc<RwLock<MinerConn>>> = {
            let map = self.connections.read().await;
            map.values().cloned().collect()
        };
        for connection in connections {
            let mut conn = connection.write().await;
            if conn.state != MinerState::Active || conn.active_pool != Some(pool) {
                continue;
            }
            conn.sync_difficulty(difficulty);
        }
    }

    /// Apply one committed scheduler switch: `set_difficulty` then
    /// `notify(clean_jobs=true)`, in that order, on the target miner.
    pub async fn apply_switch(&self, sw: &MinerSwitch, snapshot: &UpstreamSnapshot) {
        let connection = {
            let map = self.connections.read().await;
            map.get(&sw.session_id).cloned()
        };
        let Some(connection) = connection else { return };
        self.activate(&connection, sw.to, snapshot, true).await;
    }

    /// An upstream's extranonce changed. The miner-facing advertisement is
    /// fixed-size, so the change is absorbed internally; only a shrink of
    /// the miner's effective search space warrants a downstream
    /// `mining.set_extranonce`.
    pub async fn handle_upstream_extranonce(&self, pool: PoolId, miner_bytes: usize) {
        if miner_bytes >= MINER_EXTRANONCE2_SIZE {
            debug!("[{}] extranonce change absorbed", pool);
            return;
        }
        let connections: Vec<Arc<RwLock<MinerConn>>> = {
            let map = self.connections.read().await;
            map.values().cloned().collect()
        };
        for connection in connections {
            let conn = connection.read().await;
            if conn.state != MinerState::Active || conn.active_pool != Some(pool) {
                continue;
            }
            conn.send(&json!({
                "id": Value::Null,
                "method": "mining.set_extranonce",
                "params": [conn.extranonce1, miner_bytes.max(1)],
            }));
        }
    }

    /// Periodic maintenance: expire duplicate-window entries.
    pub async fn prune(&self, submit_max_age: Duration) {
        let connections: Vec<Arc<RwLock<MinerConn>>> = {
            let map = self.connections.read().await;
            map.values().cloned().collect()
        };
        let now = Instant::now();
        for connection in connections {
            connection.write().await.prune_submits(submit_max_age, now);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub async fn status(&self) -> Vec<MinerStatus> {
        let connections: Vec<Arc<RwLock<MinerConn>>> = {
            let map = self.connections.read().await;
            map.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(connections.len());
        for connection in connections {
            let conn = connection.read().await;
            out.push(MinerStatus {
                session_id: conn.session_id.clone(),
                peer: conn.peer_addr.to_string(),
                state: conn.state,
                username: conn.username.clone(),
                active_pool: conn.active_pool,
                difficulty: conn.advertised_difficulty,
                shares_submitted: conn.shares_submitted,
                shares_accepted: conn.shares_accepted,
                shares_rejected: conn.shares_rejected,
                uptime_secs: conn.connected_at.elapsed().as_secs(),
            });
        }
        out
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn conn(counter: u16) -> MinerConn {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000);
        MinerConn::new(format!("session-{}", counter), addr, counter)
    }

    #[test]
    fn extranonce1_embeds_prefix_and_counter() {
        let c = conn(0x0a0b);
        assert_eq!(c.extranonce1, format!("{:04x}0a0b", PROXY_EXTRANONCE_PREFIX));
        assert_eq!(c.extranonce1.len(), 8); // 4 bytes hex

        // Distinct counters give distinct extranonces.
        assert_ne!(conn(1).extranonce1, conn(2).extranonce1);
    }

    #[test]
    fn job_map_is_bounded_and_immutable() {
        let mut c = conn(1);
        for i in 0..(JOB_MAP_CAPACITY + 10) {
            c.record_job(
                format!("{:x}", i),
                JobAttribution { pool_id: PoolId::A, pool_job_id: format!("pj{}", i) },
            );
        }
        assert!(c.attribution("0").is_none());
        let last = format!("{:x}", JOB_MAP_CAPACITY + 9);
        assert_eq!(c.attribution(&last).unwrap().pool_id, PoolId::A);
    }

    #[test]
    fn duplicate_window_rejects_repeats() {
        let mut c = conn(1);
        let key = SubmitKey {
            proxy_job_id: "7".into(),
            extranonce2: "00000001".into(),
            ntime: "6632f0aa".into(),
            nonce: "deadbeef".into(),
        };
        let now = Instant::now();
        assert!(c.check_and_record_submit(key.clone(), now));
        assert!(!c.check_and_record_submit(key.clone(), now));

        // A different nonce is a different share.
        let other = SubmitKey { nonce: "deadbef0".into(), ..key };
        assert!(c.check_and_record_submit(other, now));
    }

    #[test]
    fn duplicate_window_is_bounded() {
        let mut c = conn(1);
        let now = Instant::now();
        for i in 0..(DUPLICATE_WINDOW + 5) {
            let key = SubmitKey {
                proxy_job_id: "1".into(),
                extranonce2: format!("{:08x}", i),
                ntime: "6632f0aa".into(),
                nonce: "00000000".into(),
            };
            assert!(c.check_and_record_submit(key, now));
        }
        // The oldest entries rolled out of the window and may repeat.
        let oldest = SubmitKey {
            proxy_job_id: "1".into(),
            extranonce2: format!("{:08x}", 0),
            ntime: "6632f0aa".into(),
            nonce: "00000000".into(),
        };
        assert!(c.check_and_record_submit(oldest, now));
    }

    #[test]
    fn prune_expires_old_submits() {
        let mut c = conn(1);
        let t0 = Instant::now();
        let key = SubmitKey {
            proxy_job_id: "1".into(),
            extranonce2: "00000000".into(),
            ntime: "6632f0aa".into(),
            nonce: "00000000".into(),
        };
        assert!(c.check_and_record_submit(key.clone(), t0));
        c.prune_submits(Duration::from_secs(600), t0 + Duration::from_secs(601));
        assert!(c.check_and_record_submit(key, t0 + Duration::from_secs(602)));
    }

    #[test]
    fn hex_validation() {
        assert!(is_hex("00aaFF"));
        assert!(!is_hex(""));
        assert!(!is_hex("xyz"));
    }

    #[test]
    fn push_difficulty_writes_even_when_unchanged() {
        let mut c = conn(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        c.outbound = Some(tx);

        c.sync_difficulty(1024.0);
        c.sync_difficulty(1024.0); // same-pool repeat: suppressed
        c.push_difficulty(1024.0); // switch path: always written
        drop(c);

        let mut sent = 0;
        while rx.try_recv().is_ok() {
            sent += 1;
        }
        assert_eq!(sent, 2);
    }
}
