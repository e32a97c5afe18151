//! Component lifetimes and top-level wiring.
//!
//! The supervisor owns the upstream and downstream registries, mints the
//! session and proxy-job counters, fans upstream events out to routed
//! miners, runs the periodic pruning tick, restarts crashed components with
//! backoff, and assembles the read-only status snapshot for the dashboard
//! collaborator. No component fault terminates the process.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{info, warn};

use crate::config::{Config, Mode, PoolId};
use crate::downstream::{DownstreamServer, MinerStatus, SharedUpstreams, MINER_EXTRANONCE2_SIZE};
use crate::events::{Event, EventBus};
use crate::hashrate::AutoBalancer;
use crate::metrics::prometheus as metrics;
use crate::router::ShareRouter;
use crate::scheduler::{MinerSwitch, Scheduler, SchedulerStatus};
use crate::upstream::{UpstreamEvent, UpstreamSession, UpstreamState};

pub const PRUNE_PERIOD: Duration = Duration::from_secs(60);
pub const PENDING_SUBMIT_MAX_AGE: Duration = Duration::from_secs(60);
pub const RECENT_SUBMIT_MAX_AGE: Duration = Duration::from_secs(600);
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub pool: PoolId,
    pub state: UpstreamState,
    pub extranonce1: Option<String>,
    pub extranonce2_size: Option<usize>,
    pub difficulty: f64,
    pub last_job_age_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub version: &'static str,
    pub uptime_secs: i64,
    pub upstreams: Vec<UpstreamStatus>,
    pub downstream_count: usize,
    pub downstreams: Vec<MinerStatus>,
    pub scheduler: SchedulerStatus,
    pub counters: Value,
    pub recent_events: Vec<Value>,
}

pub struct Supervisor {
    config: RwLock<Config>,
    upstreams: SharedUpstreams,
    upstream_ctl: Arc<RwLock<HashMap<PoolId, watch::Sender<bool>>>>,
    upstream_events: broadcast::Sender<UpstreamEvent>,
    scheduler: Arc<Scheduler>,
    router: Arc<ShareRouter>,
    downstream: Arc<DownstreamServer>,
    bus: Arc<EventBus>,
    shutdown: watch::Sender<bool>,
    started_at: i64,
}

impl Supervisor {
    pub fn new(config: Config) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(&config.log.events));
        let (upstream_events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);

        let scheduler = Arc::new(Scheduler::new(
            config.mode,
            config.weights,
            config.slot_seconds,
            config.dwell_floor_seconds,
            Instant::now(),
        ));

        let upstreams: SharedUpstreams = Arc::new(RwLock::new(HashMap::new()));
        let router = ShareRouter::new(
            upstreams.clone(),
            Duration::from_secs(config.stale_grace_seconds),
            bus.clone(),
        );

        // Session counters are minted here and nowhere else; downstream
        // extranonce uniqueness rests on it.
        let session_counter = Arc::new(AtomicU64::new(0));
        let proxy_job_seq = Arc::new(AtomicU64::new(1));

        let downstream = DownstreamServer::new(
            config.stratum.clone(),
            scheduler.clone(),
            router.clone(),
            upstreams.clone(),
            session_counter,
            proxy_job_seq,
            bus.clone(),
            shutdown.subscribe(),
        );

        Arc::new(Self {
            config: RwLock::new(config),
            upstreams,
            upstream_ctl: Arc::new(RwLock::new(HashMap::new())),
            upstream_events,
            scheduler,
            router,
            downstream,
            bus,
            shutdown,
            started_at: Utc::now().timestamp(),
        })
    }

    pub fn downstream(&self) -> Arc<DownstreamServer> {
        self.downstream.clone()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let config = self.config.read().await.clone();

        // Upstream event pump. The receiver is created before the upstream
        // sessions spawn so no state transition is missed; a pump restarted
        // after a panic re-subscribes and the ticker reconcile covers the gap.
        {
            let sup = Arc::clone(self);
            let initial_rx = Arc::new(std::sync::Mutex::new(Some(self.upstream_events.subscribe())));
            self.spawn_component("event-pump", move || {
                let sup = sup.clone();
                let rx = initial_rx
                    .lock()
                    .expect("event pump receiver slot poisoned")
                    .take()
                    .unwrap_or_else(|| sup.upstream_events.subscribe());
                async move { sup.pump_events(rx).await }
            });
        }

        for pool in PoolId::both() {
            self.spawn_upstream(pool, &config).await;
        }

        // Downstream listener.
        {
            let downstream = self.downstream.clone();
            self.spawn_component("downstream", move || {
                let downstream = downstream.clone();
                async move {
                    if let Err(e) = downstream.start().await {
                        warn!("downstream listener failed: {}", e);
                    }
                }
            });
        }

        // Scheduler ticker.
        {
            let sup = Arc::clone(self);
            self.spawn_component("scheduler-tick", move || {
                let sup = sup.clone();
                async move { sup.ticker().await }
            });
        }

        // State pruner.
        {
            let sup = Arc::clone(self);
            self.spawn_component("pruner", move || {
                let sup = sup.clone();
                async move { sup.pruner().await }
            });
        }

        // Auto-balance poller.
        if config.mode == Mode::Autobalance {
            let balancer = AutoBalancer::new(config.autobalance.clone(), self.scheduler.clone());
            let shutdown = self.shutdown.subscribe();
            self.spawn_component("autobalance", move || {
                let balancer = balancer.clone();
                let shutdown = shutdown.clone();
                async move { balancer.run(shutdown).await }
            });
        }

        info!(
            "supervisor started: mode={:?} weights={}:{} slot={}s dwell={}s",
            config.mode,
            config.weights.a,
            config.weights.b,
            config.slot_seconds,
            config.dwell_floor_seconds,
        );
        Ok(())
    }

    async fn spawn_upstream(self: &Arc<Self>, pool: PoolId, config: &Config) {
        let (ctl_tx, ctl_rx) = watch::channel(false);
        let session = UpstreamSession::new(
            pool,
            config.pool(pool).clone(),
            MINER_EXTRANONCE2_SIZE,
            self.upstream_events.clone(),
            self.bus.clone(),
            ctl_rx,
        );

        self.upstreams.write().await.insert(pool, session.clone());
        self.upstream_ctl.write().await.insert(pool, ctl_tx);

        // Forward the global shutdown into the per-session control channel.
        {
            let mut global = self.shutdown.subscribe();
            let ctl = self.upstream_ctl.clone();
            tokio::spawn(async move {
                if global.changed().await.is_ok() {
                    if let Some(tx) = ctl.read().await.get(&pool) {
                        let _ = tx.send(true);
                    }
                }
            });
        }

        let name: &'static str = match pool {
            PoolId::A => "upstream-a",
            PoolId::B => "upstream-b",
        };
        self.spawn_component(name, move || {
            let session = session.clone();
            async move { session.run().await }
        });
    }

    /// Run a component forever, restarting it with backoff if it panics.
    fn spawn_component<F, Fut>(self: &Arc<Self>, name: &'static str, factory: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let bus = self.bus.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                let handle = tokio::spawn(factory());
                match handle.await {
                    Ok(()) => break, // clean exit
                    Err(e) if e.is_panic() => {
                        warn!("component {} crashed, restarting in {:?}", name, backoff);
                        bus.emit(Event::ComponentCrashed { component: name.to_string() });
                    }
                    Err(_) => break, // cancelled
                }
                if *shutdown.borrow() {
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        });
    }

    async fn pump_events(self: Arc<Self>, mut rx: broadcast::Receiver<UpstreamEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => self.handle_upstream_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("event pump lagged, {} events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn handle_upstream_event(&self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::NewJob { pool, job } => {
                self.downstream.forward_job(pool, &job).await;
            }
            UpstreamEvent::DifficultyChanged { pool, difficulty } => {
                self.downstream.forward_difficulty(pool, difficulty).await;
            }
            UpstreamEvent::StateChanged { pool, state } => {
                let ready = state == UpstreamState::Ready;
                let switches = self.scheduler.set_pool_ready(pool, ready, Instant::now());
                if !ready && switches.is_empty() && !self.scheduler.pool_ready(pool.other()) {
                    self.bus.emit(Event::PoolUnavailable {
                        miners: self.scheduler.miner_count(),
                    });
                }
                for sw in switches {
                    self.commit_switch(sw).await;
                }
                // Miners left waiting (quiescent, or connected while both
                // pools were down) get routed once a pool is usable.
                if ready {
                    self.route_unrouted().await;
                }
            }
            UpstreamEvent::ExtranonceChanged { pool, layout } => {
                self.downstream
                    .handle_upstream_extranonce(pool, layout.miner_bytes)
                    .await;
            }
        }
    }

    async fn route_unrouted(&self) {
        let statuses = self.downstream.status().await;
        for miner in statuses {
            if miner.active_pool.is_some() {
                continue;
            }
            if self.scheduler.active_pool(&miner.session_id).is_some() {
                continue;
            }
            if let Some(target) = self.scheduler.register_miner(&miner.session_id, Instant::now()) {
                let sw = MinerSwitch {
                    session_id: miner.session_id.clone(),
                    from: None,
                    to: target,
                    reason: "recovered",
                };
                self.commit_switch(sw).await;
            }
        }
    }

    async fn commit_switch(&self, sw: MinerSwitch) {
        let snapshot = {
            let upstreams = self.upstreams.read().await;
            upstreams.get(&sw.to).map(|u| u.snapshot())
        };
        let Some(snapshot) = snapshot else { return };

        self.downstream.apply_switch(&sw, &snapshot).await;
        metrics::inc_pool_switch();
        self.bus.emit(Event::PoolSwitched {
            miner: sw.session_id.clone(),
            from: sw.from,
            to: sw.to,
            reason: sw.reason.to_string(),
        });
        info!(
            "miner {} switched {} -> {} ({})",
            &sw.session_id[..8.min(sw.session_id.len())],
            sw.from.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            sw.to,
            sw.reason,
        );
    }

    async fn ticker(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SCHEDULER_TICK);
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.reconcile_readiness().await;
            for sw in self.scheduler.tick(Instant::now()) {
                self.commit_switch(sw).await;
            }
        }
    }

    /// The event pump is authoritative, but a pump restart (or a miner
    /// arriving between events) can leave the scheduler's readiness view or
    /// a session's routing behind the snapshots. Re-align once per tick.
    async fn reconcile_readiness(&self) {
        let mut any_ready = false;
        for pool in PoolId::both() {
            let snapshot = {
                let upstreams = self.upstreams.read().await;
                upstreams.get(&pool).map(|u| u.snapshot())
            };
            let Some(snapshot) = snapshot else { continue };
            let is_ready = snapshot.is_ready();
            any_ready |= is_ready;
            if self.scheduler.pool_ready(pool) != is_ready {
                for sw in self.scheduler.set_pool_ready(pool, is_ready, Instant::now()) {
                    self.commit_switch(sw).await;
                }
            }
        }
        if any_ready {
            self.route_unrouted().await;
        }
    }

    async fn pruner(self: Arc<Self>) {
        let mut interval = tokio::time::interval(PRUNE_PERIOD);
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let stale_grace = {
                let config = self.config.read().await;
                Duration::from_secs(config.stale_grace_seconds)
            };
            {
                let upstreams = self.upstreams.read().await;
                for session in upstreams.values() {
                    session
                        .prune(PENDING_SUBMIT_MAX_AGE, stale_grace + PRUNE_PERIOD)
                        .await;
                }
            }
            self.downstream.prune(RECENT_SUBMIT_MAX_AGE).await;
        }
    }

    /// Atomically apply a new config snapshot. Sessions to unchanged pools
    /// are left intact; a snapshot that fails validation leaves the running
    /// one in place.
    pub async fn apply_config(self: &Arc<Self>, new_config: Config) -> Result<()> {
        new_config.validate()?;

        let old_config = self.config.read().await.clone();

        for pool in PoolId::both() {
            if new_config.pool(pool) != old_config.pool(pool) {
                info!("[{}] pool config changed, recreating session", pool);
                if let Some(ctl) = self.upstream_ctl.write().await.remove(&pool) {
                    let _ = ctl.send(true);
                }
                self.upstreams.write().await.remove(&pool);
                self.spawn_upstream(pool, &new_config).await;
            }
        }

        self.scheduler.update_weights(
            new_config.mode,
            new_config.weights,
            new_config.slot_seconds,
            new_config.dwell_floor_seconds,
        );
        self.router
            .set_stale_grace(Duration::from_secs(new_config.stale_grace_seconds))
            .await;

        *self.config.write().await = new_config;
        info!("config snapshot applied");
        Ok(())
    }

    /// Cooperative shutdown: every component drains and exits.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        let _ = self.shutdown.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// The read-only snapshot served to the dashboard.
    pub async fn status(&self) -> StatusSnapshot {
        let mut upstream_statuses = Vec::new();
        {
            let upstreams = self.upstreams.read().await;
            for pool in PoolId::both() {
                if let Some(session) = upstreams.get(&pool) {
                    let snap = session.snapshot();
                    upstream_statuses.push(UpstreamStatus {
                        pool,
                        state: snap.state,
                        extranonce1: snap.extranonce.as_ref().map(|l| l.extranonce1.clone()),
                        extranonce2_size: snap.extranonce.as_ref().map(|l| l.extranonce2_size),
                        difficulty: snap.difficulty,
                        last_job_age_secs: snap.last_job_age().map(|d| d.as_secs()),
                    });
                }
            }
        }

        let downstreams = self.downstream.status().await;

        StatusSnapshot {
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: Utc::now().timestamp() - self.started_at,
            downstream_count: downstreams.len(),
            downstreams,
            upstreams: upstream_statuses,
            scheduler: self.scheduler.status(Instant::now()),
            counters: metrics::snapshot_json(),
            recent_events: self.bus.recent(),
        }
    }
}
