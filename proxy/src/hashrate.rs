//! Auto-balance weight derivation from measured network hashrates.
//!
//! Each chain's stats endpoint is polled on a period; samples feed a short
//! and a long EMA whose blend estimates the chain's realtime hashrate.
//! Weights follow profitability per unit of local hash:
//! `weight(X) = reward(X) / hashrate(X)`, normalized over both chains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::AutoBalanceConfig;
use crate::scheduler::Scheduler;

/// Exponential moving average with a configured half-life.
#[derive(Debug, Clone)]
pub struct Ema {
    half_life_secs: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(half_life_secs: u64) -> Self {
        Self {
            half_life_secs: (half_life_secs.max(1)) as f64,
            value: None,
        }
    }

    pub fn update(&mut self, sample: f64, dt_secs: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(prev) => {
                let alpha = 1.0 - 0.5f64.powf(dt_secs.max(0.0) / self.half_life_secs);
                prev + alpha * (sample - prev)
            }
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Blend of the short- and long-term estimates.
pub fn blend(short: f64, long: f64, blend_short: f64) -> f64 {
    let s = blend_short.clamp(0.0, 1.0);
    s * short + (1.0 - s) * long
}

/// Normalized weights from per-chain reward and blended hashrate.
pub fn derive_weights(
    reward_a: f64,
    hashrate_a: f64,
    reward_b: f64,
    hashrate_b: f64,
) -> Option<(f64, f64)> {
    if hashrate_a <= 0.0 || hashrate_b <= 0.0 {
        return None;
    }
    let profit_a = reward_a / hashrate_a;
    let profit_b = reward_b / hashrate_b;
    let total = profit_a + profit_b;
    if !total.is_finite() || total <= 0.0 {
        return None;
    }
    Some((profit_a / total, profit_b / total))
}

#[derive(Debug, Deserialize)]
struct ChainStatsDoc {
    #[serde(alias = "nethash", alias = "network_hashrate")]
    hashrate: f64,
}

struct ChainTracker {
    short: Ema,
    long: Ema,
    last_sample_at: Option<Instant>,
}

impl ChainTracker {
    fn new(cfg: &AutoBalanceConfig) -> Self {
        Self {
            short: Ema::new(cfg.short_halflife_seconds),
            long: Ema::new(cfg.long_halflife_seconds),
            last_sample_at: None,
        }
    }

    fn observe(&mut self, sample: f64, now: Instant, period: Duration) {
        let dt = self
            .last_sample_at
            .map(|t| now.saturating_duration_since(t).as_secs_f64())
            .unwrap_or_else(|| period.as_secs_f64());
        self.last_sample_at = Some(now);
        self.short.update(sample, dt);
        self.long.update(sample, dt);
    }
}

pub struct AutoBalancer {
    cfg: AutoBalanceConfig,
    scheduler: Arc<Scheduler>,
    chains: Mutex<(ChainTracker, ChainTracker)>,
    pub api_fetches: AtomicU64,
    pub api_errors: AtomicU64,
}

impl AutoBalancer {
    pub fn new(cfg: AutoBalanceConfig, scheduler: Arc<Scheduler>) -> Arc<Self> {
        let chains = Mutex::new((ChainTracker::new(&cfg), ChainTracker::new(&cfg)));
        Arc::new(Self {
            cfg,
            scheduler,
            chains,
            api_fetches: AtomicU64::new(0),
            api_errors: AtomicU64::new(0),
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.cfg.period_seconds.max(1));
        info!(
            "auto-balance started (period={}s, half-lives={}s/{}s, blend_short={})",
            self.cfg.period_seconds,
            self.cfg.short_halflife_seconds,
            self.cfg.long_halflife_seconds,
            self.cfg.blend_short,
        );

        let client = match reqwest::Client::builder().timeout(Duration::from_secs(15)).build() {
            Ok(c) => c,
            Err(e) => {
                warn!("auto-balance disabled: HTTP client failed to build: {}", e);
                return;
            }
        };

        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.sample_once(&client, period).await;
        }
    }

    async fn sample_once(&self, client: &reqwest::Client, period: Duration) {
        let (sample_a, sample_b) = tokio::join!(
            fetch_chain(client, &self.cfg.stats_url_a),
            fetch_chain(client, &self.cfg.stats_url_b),
        );

        let now = Instant::now();
        let mut chains = self.chains.lock().await;

        let blended_a = match sample_a {
            Ok(h) => {
                self.api_fetches.fetch_add(1, Ordering::Relaxed);
                chains.0.observe(h, now, period);
                Some(self.blended(&chains.0))
            }
            Err(e) => {
                self.api_errors.fetch_add(1, Ordering::Relaxed);
                warn!("chain A stats fetch failed: {}", e);
                self.blended_opt(&chains.0)
            }
        };
        let blended_b = match sample_b {
            Ok(h) => {
                self.api_fetches.fetch_add(1, Ordering::Relaxed);
                chains.1.observe(h, now, period);
                Some(self.blended(&chains.1))
            }
            Err(e) => {
                self.api_errors.fetch_add(1, Ordering::Relaxed);
                warn!("chain B stats fetch failed: {}", e);
                self.blended_opt(&chains.1)
            }
        };
        drop(chains);

        let (Some(ha), Some(hb)) = (blended_a, blended_b) else {
            debug!("auto-balance: waiting for first samples from both chains");
            return;
        };

        if let Some((wa, wb)) =
            derive_weights(self.cfg.reward_a, ha, self.cfg.reward_b, hb)
        {
            debug!("auto-balance weights: a={:.4} b={:.4}", wa, wb);
            self.scheduler.set_auto_weights(wa, wb);
        }
    }

    fn blended(&self, tracker: &ChainTracker) -> f64 {
        let short = tracker.short.value().unwrap_or(0.0);
        let long = tracker.long.value().unwrap_or(short);
        blend(short, long, self.cfg.blend_short)
    }

    fn blended_opt(&self, tracker: &ChainTracker) -> Option<f64> {
        tracker.short.value().map(|_| self.blended(tracker))
    }
}

async fn fetch_chain(client: &reqwest::Client, url: &str) -> Result<f64> {
    if url.is_empty() {
        return Err(anyhow!("no stats url configured"));
    }
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("request to {}", url))?;
    if !response.status().is_success() {
        return Err(anyhow!("{} returned HTTP {}", url, response.status()));
    }
    let doc: ChainStatsDoc = response
        .json()
        .await
        .with_context(|| format!("parsing stats from {}", url))?;
    if !doc.hashrate.is_finite() || doc.hashrate <= 0.0 {
        return Err(anyhow!("{} reported nonsense hashrate {}", url, doc.hashrate));
    }
    Ok(doc.hashrate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_first_sample_is_taken_verbatim() {
        let mut ema = Ema::new(1800);
        assert_eq!(ema.update(100.0, 300.0), 100.0);
    }

    #[test]
    fn ema_moves_halfway_per_half_life() {
        let mut ema = Ema::new(100);
        ema.update(0.0, 1.0);
        let v = ema.update(100.0, 100.0);
        assert!((v - 50.0).abs() < 1e-9, "got {}", v);
    }

    #[test]
    fn short_ema_tracks_faster_than_long() {
        let mut short = Ema::new(60);
        let mut long = Ema::new(3600);
        short.update(100.0, 1.0);
        long.update(100.0, 1.0);
        let s = short.update(200.0, 60.0);
        let l = long.update(200.0, 60.0);
        assert!(s > l);
    }

    #[test]
    fn blend_interpolates() {
        assert_eq!(blend(10.0, 20.0, 1.0), 10.0);
        assert_eq!(blend(10.0, 20.0, 0.0), 20.0);
        assert!((blend(10.0, 20.0, 0.6) - 14.0).abs() < 1e-9);
    }

    #[test]
    fn weights_favour_the_smaller_network() {
        // Equal rewards: the chain with half the hashrate earns twice the
        // weight per unit of local hash.
        let (wa, wb) = derive_weights(1.0, 50.0, 1.0, 100.0).unwrap();
        assert!((wa - 2.0 / 3.0).abs() < 1e-9);
        assert!((wb - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_hashrates_give_no_weights() {
        assert!(derive_weights(1.0, 0.0, 1.0, 100.0).is_none());
        assert!(derive_weights(1.0, -5.0, 1.0, 100.0).is_none());
    }
}
