//! Active-pool selection.
//!
//! Wall-clock time is partitioned into slots; each slot is assigned to one
//! pool by largest-remainder apportionment over a sliding window, so the
//! observed time share of each pool converges to its weight within one slot.
//! A miner follows the slot target, but never switches more than once per
//! dwell floor; an upstream leaving `Ready` fails its miners over
//! immediately, bypassing dwell. All miner re-routing happens inside a
//! single critical section per tick.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;

use crate::config::{Mode, PoolId, Weights};
use crate::metrics::prometheus as metrics;

/// Slots remembered for apportionment.
pub const SLOT_WINDOW: usize = 100;

/// Switch events remembered for the status API.
const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    Fixed,
    AutoBalance,
    SinglePool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchEvent {
    pub miner: String,
    pub from: Option<PoolId>,
    pub to: PoolId,
    pub reason: String,
    pub timestamp: i64,
}

/// A committed re-routing, to be applied to the downstream session.
#[derive(Debug, Clone)]
pub struct MinerSwitch {
    pub session_id: String,
    pub from: Option<PoolId>,
    pub to: PoolId,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub mode: SchedulerMode,
    pub weights: (f64, f64),
    pub active: HashMap<String, PoolId>,
    pub seconds_to_next_slot: u64,
    pub recent_switches: Vec<SwitchEvent>,
}

struct Inner {
    configured_mode: Mode,
    /// Effective weights: the fixed ratio, or the latest auto-balance result.
    weights: (f64, f64),
    slot_seconds: u64,
    dwell_floor: Duration,
    window: VecDeque<PoolId>,
    current_slot: Option<u64>,
    slot_target: PoolId,
    active: HashMap<String, PoolId>,
    last_switch: HashMap<String, Instant>,
    ready: HashMap<PoolId, bool>,
    history: VecDeque<SwitchEvent>,
    started_at: Instant,
}

pub struct Scheduler {
    inner: Mutex<Inner>,
}

/// Largest-remainder pick for the next slot: the pool with the bigger
/// deficit against its target share over the window gets it.
fn next_assignment(window: &VecDeque<PoolId>, weights: (f64, f64)) -> PoolId {
    let total = weights.0 + weights.1;
    if total <= 0.0 {
        return PoolId::A;
    }
    let target_a = weights.0 / total;
    let n = window.len() as f64 + 1.0;
    let count_a = window.iter().filter(|p| **p == PoolId::A).count() as f64;
    let count_b = window.len() as f64 - count_a;

    let deficit_a = target_a * n - count_a;
    let deficit_b = (1.0 - target_a) * n - count_b;
    if deficit_a >= deficit_b {
        PoolId::A
    } else {
        PoolId::B
    }
}

impl Scheduler {
    pub fn new(
        mode: Mode,
        weights: Weights,
        slot_seconds: u64,
        dwell_floor_seconds: u64,
        now: Instant,
    ) -> Self {
        let weights = (weights.a as f64, weights.b as f64);
        metrics::set_weight("a", weights.0);
        metrics::set_weight("b", weights.1);

        let slot_target = if weights.0 >= weights.1 { PoolId::A } else { PoolId::B };
        let mut ready = HashMap::new();
        ready.insert(PoolId::A, false);
        ready.insert(PoolId::B, false);

        Self {
            inner: Mutex::new(Inner {
                configured_mode: mode,
                weights,
                slot_seconds: slot_seconds.max(1),
                dwell_floor: Duration::from_secs(dwell_floor_seconds),
                window: VecDeque::with_capacity(SLOT_WINDOW),
                current_slot: None,
                slot_target,
                active: HashMap::new(),
                last_switch: HashMap::new(),
                ready,
                history: VecDeque::new(),
                started_at: now,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("scheduler mutex poisoned")
    }

    /// Effective mode: single-pool at a 0-weight boundary or while one
    /// upstream is down, else the configured mode.
    pub fn effective_mode(&self) -> SchedulerMode {
        let inner = self.lock();
        effective_mode(&inner)
    }

    pub fn update_weights(&self, mode: Mode, weights: Weights, slot_seconds: u64, dwell: u64) {
        let mut inner = self.lock();
        inner.configured_mode = mode;
        inner.weights = (weights.a as f64, weights.b as f64);
        inner.slot_seconds = slot_seconds.max(1);
        inner.dwell_floor = Duration::from_secs(dwell);
        metrics::set_weight("a", inner.weights.0);
        metrics::set_weight("b", inner.weights.1);
    }

    /// Auto-balance feed: replaces the effective weights.
    pub fn set_auto_weights(&self, weight_a: f64, weight_b: f64) {
        let mut inner = self.lock();
        if inner.configured_mode != Mode::Autobalance {
            return;
        }
        if weight_a + weight_b <= 0.0 {
            return;
        }
        inner.weights = (weight_a, weight_b);
        metrics::set_weight("a", weight_a);
        metrics::set_weight("b", weight_b);
    }

    /// Assign a newly authorized miner. `None` while no pool is usable.
    pub fn register_miner(&self, session_id: &str, now: Instant) -> Option<PoolId> {
        let mut inner = self.lock();
        let target = pick_target(&inner, inner.slot_target)?;
        inner.active.insert(session_id.to_string(), target);
        inner.last_switch.insert(session_id.to_string(), now);
        Some(target)
    }

    pub fn unregister_miner(&self, session_id: &str) {
        let mut inner = self.lock();
        inner.active.remove(session_id);
        inner.last_switch.remove(session_id);
    }

    pub fn active_pool(&self, session_id: &str) -> Option<PoolId> {
        self.lock().active.get(session_id).copied()
    }

    pub fn pool_ready(&self, pool: PoolId) -> bool {
        *self.lock().ready.get(&pool).unwrap_or(&false)
    }

    /// Slot tick. Commits dwell-respecting switches toward the current slot
    /// target and returns them for application.
    pub fn tick(&self, now: Instant) -> Vec<MinerSwitch> {
        let mut inner = self.lock();

        let slot = now.duration_since(inner.started_at).as_secs() / inner.slot_seconds;
        if inner.current_slot == Some(slot) {
            return Vec::new();
        }
        inner.current_slot = Some(slot);

        let target = match effective_mode(&inner) {
            SchedulerMode::SinglePool => match single_pool_target(&inner) {
                Some(p) => p,
                None => return Vec::new(),
            },
            _ => {
                let next = next_assignment(&inner.window, inner.weights);
                inner.window.push_back(next);
                while inner.window.len() > SLOT_WINDOW {
                    inner.window.pop_front();
                }
                next
            }
        };
        inner.slot_target = target;

        if !*inner.ready.get(&target).unwrap_or(&false) {
            // Target pool is not usable this slot; stay put.
            return Vec::new();
        }

        let mut switches = Vec::new();
        let miners: Vec<String> = inner.active.keys().cloned().collect();
        for miner in miners {
            let current = inner.active[&miner];
            if current == target {
                continue;
            }
            let since = inner
                .last_switch
                .get(&miner)
                .map(|t| now.saturating_duration_since(*t))
                .unwrap_or(Duration::MAX);
            if since < inner.dwell_floor {
                continue;
            }
            commit(&mut inner, &miner, Some(current), target, "slot", now);
            switches.push(MinerSwitch {
                session_id: miner,
                from: Some(current),
                to: target,
                reason: "slot",
            });
        }
        switches
    }

    /// Upstream readiness change. A pool leaving `Ready` fails its miners
    /// over immediately; a pool coming back also rescues miners stranded on
    /// a down pool. Returns the committed switches.
    pub fn set_pool_ready(&self, pool: PoolId, ready: bool, now: Instant) -> Vec<MinerSwitch> {
        let mut inner = self.lock();
        inner.ready.insert(pool, ready);

        let mut switches = Vec::new();

        if !ready {
            let other = pool.other();
            let other_ready = *inner.ready.get(&other).unwrap_or(&false);
            let miners: Vec<String> = inner
                .active
                .iter()
                .filter(|(_, p)| **p == pool)
                .map(|(m, _)| m.clone())
                .collect();
            if !other_ready {
                return Vec::new(); // quiescent: nothing usable to fail over to
            }
            for miner in miners {
                commit(&mut inner, &miner, Some(pool), other, "failover", now);
                switches.push(MinerSwitch {
                    session_id: miner,
                    from: Some(pool),
                    to: other,
                    reason: "failover",
                });
            }
        } else {
            // Rescue miners stranded on the other pool if it is down. Weights
            // are honoured again at the next slot boundary, after dwell.
            let other = pool.other();
            let other_ready = *inner.ready.get(&other).unwrap_or(&false);
            if !other_ready {
                let miners: Vec<String> = inner
                    .active
                    .iter()
                    .filter(|(_, p)| **p == other)
                    .map(|(m, _)| m.clone())
                    .collect();
                for miner in miners {
                    commit(&mut inner, &miner, Some(other), pool, "failover", now);
                    switches.push(MinerSwitch {
                        session_id: miner,
                        from: Some(other),
                        to: pool,
                        reason: "failover",
                    });
                }
            }
        }
        switches
    }

    pub fn miners_on(&self, pool: PoolId) -> Vec<String> {
        self.lock()
            .active
            .iter()
            .filter(|(_, p)| **p == pool)
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn miner_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn status(&self, now: Instant) -> SchedulerStatus {
        let inner = self.lock();
        let elapsed = now.duration_since(inner.started_at).as_secs();
        let seconds_to_next_slot = inner.slot_seconds - (elapsed % inner.slot_seconds);
        SchedulerStatus {
            mode: effective_mode(&inner),
            weights: inner.weights,
            active: inner.active.clone(),
            seconds_to_next_slot,
            recent_switches: inner.history.iter().cloned().collect(),
        }
    }
}

fn effective_mode(inner: &Inner) -> SchedulerMode {
    if inner.weights.0 <= 0.0 || inner.weights.1 <= 0.0 {
        return SchedulerMode::SinglePool;
    }
    let a_ready = *inner.ready.get(&PoolId::A).unwrap_or(&false);
    let b_ready = *inner.ready.get(&PoolId::B).unwrap_or(&false);
    if a_ready != b_ready {
        return SchedulerMode::SinglePool;
    }
    match inner.configured_mode {
        Mode::Fixed => SchedulerMode::Fixed,
        Mode::Autobalance => SchedulerMode::AutoBalance,
    }
}

fn single_pool_target(inner: &Inner) -> Option<PoolId> {
    if inner.weights.1 <= 0.0 && inner.weights.0 > 0.0 {
        return Some(PoolId::A);
    }
    if inner.weights.0 <= 0.0 && inner.weights.1 > 0.0 {
        return Some(PoolId::B);
    }
    // Both weights positive: single-pool because of readiness.
    for pool in PoolId::both() {
        if *inner.ready.get(&pool).unwrap_or(&false) {
            return Some(pool);
        }
    }
    None
}

fn pick_target(inner: &Inner, slot_target: PoolId) -> Option<PoolId> {
    match effective_mode(inner) {
        SchedulerMode::SinglePool => {
            let target = single_pool_target(inner)?;
            if *inner.ready.get(&target).unwrap_or(&false) {
                Some(target)
            } else {
                None
            }
        }
        _ => {
            if *inner.ready.get(&slot_target).unwrap_or(&false) {
                Some(slot_target)
            } else if *inner.ready.get(&slot_target.other()).unwrap_or(&false) {
                Some(slot_target.other())
            } else {
                None
            }
        }
    }
}

fn commit(
    inner: &mut Inner,
    miner: &str,
    from: Option<PoolId>,
    to: PoolId,
    reason: &str,
    now: Instant,
) {
    inner.active.insert(miner.to_string(), to);
    inner.last_switch.insert(miner.to_string(), now);
    if inner.history.len() >= HISTORY_CAPACITY {
        inner.history.pop_front();
    }
    inner.history.push_back(SwitchEvent {
        miner: miner.to_string(),
        from,
        to,
        reason: reason.to_string(),
        timestamp: Utc::now().timestamp(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(weights: (u32, u32), slot: u64, dwell: u64, now: Instant) -> Scheduler {
        Scheduler::new(
            Mode::Fixed,
            Weights { a: weights.0, b: weights.1 },
            slot,
            dwell,
            now,
        )
    }

    fn both_ready(s: &Scheduler, now: Instant) {
        s.set_pool_ready(PoolId::A, true, now);
        s.set_pool_ready(PoolId::B, true, now);
    }

    #[test]
    fn apportionment_converges_to_ratio() {
        // 3:1 over 600 slots: pool A share within ±5% of 75% (P4 bound).
        let mut window = VecDeque::new();
        let mut count_a = 0usize;
        for _ in 0..600 {
            let next = next_assignment(&window, (3.0, 1.0));
            if next == PoolId::A {
                count_a += 1;
            }
            window.push_back(next);
            while window.len() > SLOT_WINDOW {
                window.pop_front();
            }
        }
        let share = count_a as f64 / 600.0;
        assert!((share - 0.75).abs() < 0.05, "share {} out of bounds", share);
    }

    #[test]
    fn apportionment_never_strays_past_one_slot() {
        let mut window = VecDeque::new();
        for n in 1..=SLOT_WINDOW {
            let next = next_assignment(&window, (1.0, 1.0));
            window.push_back(next);
            let count_a = window.iter().filter(|p| **p == PoolId::A).count() as f64;
            assert!((count_a - n as f64 / 2.0).abs() <= 1.0);
        }
    }

    #[test]
    fn dwell_floor_limits_switch_rate() {
        let start = Instant::now();
        let s = scheduler((1, 1), 1, 30, start);
        both_ready(&s, start);
        assert!(s.register_miner("m1", start).is_some());

        let mut switch_times: Vec<u64> = Vec::new();
        for sec in 1..120u64 {
            let now = start + Duration::from_secs(sec);
            for sw in s.tick(now) {
                assert_eq!(sw.reason, "slot");
                switch_times.push(sec);
            }
        }
        assert!(!switch_times.is_empty(), "expected at least one switch");
        for pair in switch_times.windows(2) {
            assert!(pair[1] - pair[0] >= 30, "switches {}s apart", pair[1] - pair[0]);
        }
    }

    #[test]
    fn zero_weight_never_switches() {
        let start = Instant::now();
        let s = scheduler((0, 100), 1, 0, start);
        both_ready(&s, start);
        assert_eq!(s.effective_mode(), SchedulerMode::SinglePool);
        assert_eq!(s.register_miner("m1", start), Some(PoolId::B));

        for sec in 1..300u64 {
            let switches = s.tick(start + Duration::from_secs(sec));
            assert!(switches.is_empty(), "unexpected switch in single-pool mode");
        }
        assert_eq!(s.active_pool("m1"), Some(PoolId::B));
    }

    #[test]
    fn failover_bypasses_dwell() {
        let start = Instant::now();
        let s = scheduler((1, 1), 60, 30, start);
        both_ready(&s, start);
        assert!(s.register_miner("m1", start).is_some());
        let pool = s.active_pool("m1").unwrap();

        // Immediately after assignment, well within dwell.
        let t = start + Duration::from_secs(1);
        let switches = s.set_pool_ready(pool, false, t);
        assert_eq!(switches.len(), 1);
        assert_eq!(switches[0].to, pool.other());
        assert_eq!(switches[0].reason, "failover");
        assert_eq!(s.active_pool("m1"), Some(pool.other()));
    }

    #[test]
    fn both_pools_down_is_quiescent() {
        let start = Instant::now();
        let s = scheduler((1, 1), 60, 30, start);
        both_ready(&s, start);
        assert!(s.register_miner("m1", start).is_some());
        let pool = s.active_pool("m1").unwrap();

        s.set_pool_ready(pool.other(), false, start);
        let switches = s.set_pool_ready(pool, false, start);
        assert!(switches.is_empty());

        // Recovery of either pool rescues the stranded miner.
        let switches = s.set_pool_ready(pool.other(), true, start + Duration::from_secs(1));
        assert_eq!(switches.len(), 1);
        assert_eq!(switches[0].to, pool.other());
    }

    #[test]
    fn register_without_ready_pool_is_none() {
        let start = Instant::now();
        let s = scheduler((1, 1), 60, 30, start);
        assert!(s.register_miner("m1", start).is_none());
    }
}
