use std::fmt;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::EventKind;

/// Identity of one of the two upstream pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolId {
    A,
    B,
}

impl PoolId {
    pub fn other(self) -> PoolId {
        match self {
            PoolId::A => PoolId::B,
            PoolId::B => PoolId::A,
        }
    }

    /// Lowercase label used for metric label values.
    pub fn label(self) -> &'static str {
        match self {
            PoolId::A => "a",
            PoolId::B => "b",
        }
    }

    pub fn both() -> [PoolId; 2] {
        [PoolId::A, PoolId::B]
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolId::A => write!(f, "A"),
            PoolId::B => write!(f, "B"),
        }
    }
}

/// Pool handshake flavour. `ck-type` pools want `mining.extranonce.subscribe`
/// before authorize and may push difficulty before the first job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolFlavour {
    #[default]
    Generic,
    CkType,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PoolConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    pub user: String,
    #[serde(default = "default_pool_pass")]
    pub pass: String,
    #[serde(default)]
    pub flavour: PoolFlavour,
    #[serde(default)]
    pub extranonce_subscribe: bool,
}

fn default_pool_pass() -> String {
    "x".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Weights {
    pub a: u32,
    pub b: u32,
}

impl Default for Weights {
    fn default() -> Self {
        Self { a: 1, b: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Fixed,
    Autobalance,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AutoBalanceConfig {
    #[serde(default = "default_short_halflife")]
    pub short_halflife_seconds: u64,
    #[serde(default = "default_long_halflife")]
    pub long_halflife_seconds: u64,
    /// Fraction of the short EMA in the blended hashrate estimate (0–1).
    #[serde(default = "default_blend_short")]
    pub blend_short: f64,
    #[serde(default = "default_autobalance_period")]
    pub period_seconds: u64,
    /// Per-chain network stats endpoints returning `{"hashrate": <f64>}`.
    #[serde(default)]
    pub stats_url_a: String,
    #[serde(default)]
    pub stats_url_b: String,
    /// Block reward per chain, in the unit the operator prefers. Only the
    /// ratio matters for weight derivation.
    #[serde(default = "default_reward")]
    pub reward_a: f64,
    #[serde(default = "default_reward")]
    pub reward_b: f64,
}

fn default_short_halflife() -> u64 {
    1800 // 30 min
}
fn default_long_halflife() -> u64 {
    86_400 // 24 h
}
fn default_blend_short() -> f64 {
    0.6
}
fn default_autobalance_period() -> u64 {
    300
}
fn default_reward() -> f64 {
    1.0
}

impl Default for AutoBalanceConfig {
    fn default() -> Self {
        Self {
            short_halflife_seconds: default_short_halflife(),
            long_halflife_seconds: default_long_halflife(),
            blend_short: default_blend_short(),
            period_seconds: default_autobalance_period(),
            stats_url_a: String::new(),
            stats_url_b: String::new(),
            reward_a: default_reward(),
            reward_b: default_reward(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct LogConfig {
    /// Event kinds to emit. Empty means all.
    #[serde(default)]
    pub events: Vec<EventKind>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

fn default_metrics_bind() -> String {
    "0.0.0.0:9210".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { bind: default_metrics_bind() }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StratumConfig {
    #[serde(default = "default_stratum_bind")]
    pub bind: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,
    /// Worker names that are refused at authorize time.
    #[serde(default)]
    pub deny_workers: Vec<String>,
}

fn default_stratum_bind() -> String {
    "0.0.0.0:3351".to_string()
}
fn default_max_connections() -> usize {
    1024
}
fn default_max_connections_per_ip() -> usize {
    32
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            bind: default_stratum_bind(),
            max_connections: default_max_connections(),
            max_connections_per_ip: default_max_connections_per_ip(),
            deny_workers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_bind() -> String {
    "0.0.0.0:8855".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { bind: default_status_bind() }
    }
}

/// Typed configuration snapshot. Applied atomically; a snapshot that fails
/// validation is rejected while the previous one keeps running.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub pool_a: PoolConfig,
    pub pool_b: PoolConfig,
    #[serde(default)]
    pub weights: Weights,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_slot_seconds")]
    pub slot_seconds: u64,
    #[serde(default = "default_dwell_floor")]
    pub dwell_floor_seconds: u64,
    #[serde(default = "default_stale_grace")]
    pub stale_grace_seconds: u64,
    #[serde(default)]
    pub autobalance: AutoBalanceConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub stratum: StratumConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

fn default_slot_seconds() -> u64 {
    60
}
fn default_dwell_floor() -> u64 {
    30
}
fn default_stale_grace() -> u64 {
    20
}

impl Config {
    pub fn pool(&self, id: PoolId) -> &PoolConfig {
        match id {
            PoolId::A => &self.pool_a,
            PoolId::B => &self.pool_b,
        }
    }

    /// Load from a JSON file, with bind-address env overrides layered on top.
    pub fn load(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path))?;
        let mut cfg: Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path))?;

        if let Ok(b) = std::env::var("DPMP_STRATUM_BIND") {
            cfg.stratum.bind = b;
        }
        if let Ok(b) = std::env::var("DPMP_METRICS_BIND") {
            cfg.metrics.bind = b;
        }
        if let Ok(b) = std::env::var("DPMP_STATUS_BIND") {
            cfg.status.bind = b;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.weights.a == 0 && self.weights.b == 0 {
            bail!("weights.a and weights.b must not both be zero");
        }
        if self.slot_seconds == 0 {
            bail!("slot_seconds must be positive");
        }
        if !(0.0..=1.0).contains(&self.autobalance.blend_short) {
            bail!("autobalance.blend_short must be within 0..=1");
        }
        if self.pool_a.host.is_empty() || self.pool_b.host.is_empty() {
            bail!("both pools need a host");
        }
        if self.mode == Mode::Autobalance
            && (self.autobalance.stats_url_a.is_empty() || self.autobalance.stats_url_b.is_empty())
        {
            bail!("autobalance mode needs stats_url_a and stats_url_b");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "pool_a": {"host": "pool-a.example.com", "port": 3333, "user": "wallet_a.rig"},
            "pool_b": {"host": "pool-b.example.com", "port": 4444, "user": "wallet_b.rig"},
        })
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = serde_json::from_value(minimal_json()).unwrap();
        assert_eq!(cfg.weights, Weights { a: 1, b: 1 });
        assert_eq!(cfg.mode, Mode::Fixed);
        assert_eq!(cfg.slot_seconds, 60);
        assert_eq!(cfg.dwell_floor_seconds, 30);
        assert_eq!(cfg.stale_grace_seconds, 20);
        assert_eq!(cfg.pool_a.pass, "x");
        assert_eq!(cfg.pool_a.flavour, PoolFlavour::Generic);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let mut v = minimal_json();
        v["wat"] = serde_json::json!(1);
        assert!(serde_json::from_value::<Config>(v).is_err());
    }

    #[test]
    fn mutually_zero_weights_are_rejected() {
        let mut v = minimal_json();
        v["weights"] = serde_json::json!({"a": 0, "b": 0});
        let cfg: Config = serde_json::from_value(v).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn flavour_parses_kebab_case() {
        let mut v = minimal_json();
        v["pool_a"]["flavour"] = serde_json::json!("ck-type");
        let cfg: Config = serde_json::from_value(v).unwrap();
        assert_eq!(cfg.pool_a.flavour, PoolFlavour::CkType);
    }

    #[test]
    fn autobalance_requires_stats_urls() {
        let mut v = minimal_json();
        v["mode"] = serde_json::json!("autobalance");
        let cfg: Config = serde_json::from_value(v).unwrap();
        assert!(cfg.validate().is_err());
    }
}
