use prometheus::core::Collector;
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, TextEncoder,
};
use std::sync::OnceLock;

static SHARES_ACCEPTED: OnceLock<IntCounterVec> = OnceLock::new();
static SHARES_REJECTED: OnceLock<IntCounterVec> = OnceLock::new();
static SHARES_REJECTED_STALE: OnceLock<IntCounter> = OnceLock::new();
static SHARES_REJECTED_DUPLICATE: OnceLock<IntCounter> = OnceLock::new();
static SHARES_FORWARDED: OnceLock<IntCounterVec> = OnceLock::new();
static SHARE_TIMEOUTS: OnceLock<IntCounterVec> = OnceLock::new();

static JOBS_RECEIVED: OnceLock<IntCounterVec> = OnceLock::new();
static JOBS_FORWARDED: OnceLock<IntCounter> = OnceLock::new();

static POOL_SWITCHES: OnceLock<IntCounter> = OnceLock::new();
static UPSTREAM_RECONNECTS: OnceLock<IntCounterVec> = OnceLock::new();
static PROTOCOL_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static UPSTREAM_READY: OnceLock<IntGaugeVec> = OnceLock::new();
static SCHEDULER_WEIGHT: OnceLock<GaugeVec> = OnceLock::new();
static UPSTREAM_DIFFICULTY: OnceLock<GaugeVec> = OnceLock::new();

fn shares_accepted() -> &'static IntCounterVec {
    SHARES_ACCEPTED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_accepted_total", "Shares accepted by an upstream pool"),
            &["pool"],
        )
        .unwrap()
    })
}

fn shares_rejected() -> &'static IntCounterVec {
    SHARES_REJECTED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_rejected_total", "Shares rejected by an upstream pool"),
            &["pool"],
        )
        .unwrap()
    })
}

fn shares_rejected_stale() -> &'static IntCounter {
    SHARES_REJECTED_STALE.get_or_init(|| {
        IntCounter::new(
            "shares_rejected_stale_total",
            "Shares rejected locally past the stale grace window",
        )
        .unwrap()
    })
}

fn shares_rejected_duplicate() -> &'static IntCounter {
    SHARES_REJECTED_DUPLICATE.get_or_init(|| {
        IntCounter::new(
            "shares_rejected_duplicate_total",
            "Shares rejected locally as duplicates",
        )
        .unwrap()
    })
}

fn shares_forwarded() -> &'static IntCounterVec {
    SHARES_FORWARDED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_forwarded_total", "Submits forwarded to an upstream pool"),
            &["pool"],
        )
        .unwrap()
    })
}

fn share_timeouts() -> &'static IntCounterVec {
    SHARE_TIMEOUTS.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("share_timeouts_total", "Submits with no upstream response in time"),
            &["pool"],
        )
        .unwrap()
    })
}

fn jobs_received() -> &'static IntCounterVec {
    JOBS_RECEIVED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("jobs_received_total", "mining.notify received from upstream"),
            &["pool"],
        )
        .unwrap()
    })
}

fn jobs_forwarded() -> &'static IntCounter {
    JOBS_FORWARDED.get_or_init(|| {
        IntCounter::new("jobs_forwarded_total", "mining.notify written downstream").unwrap()
    })
}

fn pool_switches() -> &'static IntCounter {
    POOL_SWITCHES
        .get_or_init(|| IntCounter::new("pool_switches_total", "Per-miner pool switch commits").unwrap())
}

fn upstream_reconnects() -> &'static IntCounterVec {
    UPSTREAM_RECONNECTS.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("upstream_reconnects_total", "Upstream session reconnect attempts"),
            &["pool"],
        )
        .unwrap()
    })
}

fn protocol_errors() -> &'static IntCounter {
    PROTOCOL_ERRORS.get_or_init(|| {
        IntCounter::new("protocol_errors_total", "Protocol violations that closed a connection")
            .unwrap()
    })
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS.get_or_init(|| {
        IntGauge::new("stratum_active_connections", "Connected downstream miners").unwrap()
    })
}

fn upstream_ready() -> &'static IntGaugeVec {
    UPSTREAM_READY.get_or_init(|| {
        IntGaugeVec::new(
            Opts::new("upstream_ready", "Upstream session readiness (1/0)"),
            &["pool"],
        )
        .unwrap()
    })
}

fn scheduler_weight() -> &'static GaugeVec {
    SCHEDULER_WEIGHT.get_or_init(|| {
        GaugeVec::new(
            Opts::new("scheduler_weight", "Effective scheduler weight per pool"),
            &["pool"],
        )
        .unwrap()
    })
}

fn upstream_difficulty() -> &'static GaugeVec {
    UPSTREAM_DIFFICULTY.get_or_init(|| {
        GaugeVec::new(
            Opts::new("upstream_difficulty", "Current share difficulty per upstream"),
            &["pool"],
        )
        .unwrap()
    })
}

pub fn inc_accepted(pool: &str) {
    shares_accepted().with_label_values(&[pool]).inc();
}

pub fn inc_rejected(pool: &str) {
    shares_rejected().with_label_values(&[pool]).inc();
}

pub fn inc_rejected_stale() {
    shares_rejected_stale().inc();
}

pub fn inc_rejected_duplicate() {
    shares_rejected_duplicate().inc();
}

pub fn inc_forwarded(pool: &str) {
    shares_forwarded().with_label_values(&[pool]).inc();
}

pub fn inc_share_timeout(pool: &str) {
    share_timeouts().with_label_values(&[pool]).inc();
}

pub fn inc_job_received(pool: &str) {
    jobs_received().with_label_values(&[pool]).inc();
}

pub fn inc_jobs_forwarded(count: u64) {
    jobs_forwarded().inc_by(count);
}

pub fn inc_pool_switch() {
    pool_switches().inc();
}

pub fn inc_reconnect(pool: &str) {
    upstream_reconnects().with_label_values(&[pool]).inc();
}

pub fn inc_protocol_error() {
    protocol_errors().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn set_upstream_ready(pool: &str, ready: bool) {
    upstream_ready()
        .with_label_values(&[pool])
        .set(if ready { 1 } else { 0 });
}

pub fn set_weight(pool: &str, weight: f64) {
    scheduler_weight().with_label_values(&[pool]).set(weight);
}

pub fn set_upstream_difficulty(pool: &str, difficulty: f64) {
    upstream_difficulty().with_label_values(&[pool]).set(difficulty);
}

/// Key counters for the status snapshot.
pub fn snapshot_json() -> serde_json::Value {
    let per_pool = |vec: &IntCounterVec| {
        serde_json::json!({
            "a": vec.with_label_values(&["a"]).get(),
            "b": vec.with_label_values(&["b"]).get(),
        })
    };
    serde_json::json!({
        "shares_accepted": per_pool(shares_accepted()),
        "shares_rejected": per_pool(shares_rejected()),
        "shares_rejected_stale": shares_rejected_stale().get(),
        "shares_rejected_duplicate": shares_rejected_duplicate().get(),
        "shares_forwarded": per_pool(shares_forwarded()),
        "share_timeouts": per_pool(share_timeouts()),
        "jobs_received": per_pool(jobs_received()),
        "jobs_forwarded": jobs_forwarded().get(),
        "pool_switches": pool_switches().get(),
        "upstream_reconnects": per_pool(upstream_reconnects()),
        "protocol_errors": protocol_errors().get(),
        "active_connections": active_connections().get(),
    })
}

/// Render the full metric table in Prometheus text format.
pub fn render() -> String {
    let mut families = Vec::new();
    families.extend(shares_accepted().collect());
    families.extend(shares_rejected().collect());
    families.extend(shares_rejected_stale().collect());
    families.extend(shares_rejected_duplicate().collect());
    families.extend(shares_forwarded().collect());
    families.extend(share_timeouts().collect());
    families.extend(jobs_received().collect());
    families.extend(jobs_forwarded().collect());
    families.extend(pool_switches().collect());
    families.extend(upstream_reconnects().collect());
    families.extend(protocol_errors().collect());
    families.extend(active_connections().collect());
    families.extend(upstream_ready().collect());
    families.extend(scheduler_weight().collect());
    families.extend(upstream_difficulty().collect());

    let encoder = TextEncoder::new();
    let mut out = Vec::new();
    if encoder.encode(&families, &mut out).is_err() {
        return String::new();
    }
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_and_count() {
        inc_rejected_duplicate();
        inc_accepted("a");
        set_upstream_ready("b", true);

        let text = render();
        assert!(text.contains("shares_rejected_duplicate_total"));
        assert!(text.contains("shares_accepted_total"));
        assert!(text.contains("upstream_ready"));

        let snap = snapshot_json();
        assert!(snap["shares_rejected_duplicate"].as_u64().unwrap() >= 1);
    }
}
