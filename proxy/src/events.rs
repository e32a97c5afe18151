//! Structured event emitter.
//!
//! The engine publishes lifecycle events to the log collaborator as
//! structured `tracing` records. The configured `log.events` subset filters
//! which kinds are emitted; a bounded ring of recent events backs the
//! status API.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PoolId;

const RECENT_EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PoolSwitched,
    ShareResult,
    JobForwarded,
    PoolDisconnected,
    ExtranonceChange,
    StaleShare,
    MinerDisconnected,
    ProtocolError,
    PoolUnavailable,
    ComponentCrashed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    PoolSwitched {
        miner: String,
        from: Option<PoolId>,
        to: PoolId,
        reason: String,
    },
    ShareResult {
        pool: PoolId,
        miner: String,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    JobForwarded {
        pool: PoolId,
        job_id: String,
        miners: usize,
    },
    PoolDisconnected {
        pool: PoolId,
        reason: String,
    },
    ExtranonceChange {
        pool: PoolId,
        extranonce2_size: usize,
    },
    StaleShare {
        pool: PoolId,
        miner: String,
        job_id: String,
    },
    MinerDisconnected {
        miner: String,
    },
    ProtocolError {
        #[serde(skip_serializing_if = "Option::is_none")]
        pool: Option<PoolId>,
        detail: String,
    },
    PoolUnavailable {
        miners: usize,
    },
    ComponentCrashed {
        component: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PoolSwitched { .. } => EventKind::PoolSwitched,
            Event::ShareResult { .. } => EventKind::ShareResult,
            Event::JobForwarded { .. } => EventKind::JobForwarded,
            Event::PoolDisconnected { .. } => EventKind::PoolDisconnected,
            Event::ExtranonceChange { .. } => EventKind::ExtranonceChange,
            Event::StaleShare { .. } => EventKind::StaleShare,
            Event::MinerDisconnected { .. } => EventKind::MinerDisconnected,
            Event::ProtocolError { .. } => EventKind::ProtocolError,
            Event::PoolUnavailable { .. } => EventKind::PoolUnavailable,
            Event::ComponentCrashed { .. } => EventKind::ComponentCrashed,
        }
    }
}

pub struct EventBus {
    /// Empty set means every kind is enabled.
    enabled: HashSet<EventKind>,
    recent: Mutex<VecDeque<(i64, Event)>>,
}

impl EventBus {
    pub fn new(enabled: &[EventKind]) -> Self {
        Self {
            enabled: enabled.iter().copied().collect(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENT_CAPACITY)),
        }
    }

    pub fn emit(&self, event: Event) {
        if !self.enabled.is_empty() && !self.enabled.contains(&event.kind()) {
            return;
        }

        match serde_json::to_string(&event) {
            Ok(payload) => info!(target: "dpmp::events", "{}", payload),
            Err(e) => info!(target: "dpmp::events", "unserializable event: {}", e),
        }

        let mut recent = self.recent.lock().expect("event ring poisoned");
        if recent.len() >= RECENT_EVENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back((Utc::now().timestamp(), event));
    }

    /// Most recent events, newest last, for the status snapshot.
    pub fn recent(&self) -> Vec<serde_json::Value> {
        let recent = self.recent.lock().expect("event ring poisoned");
        recent
            .iter()
            .map(|(ts, ev)| {
                let mut v = serde_json::to_value(ev).unwrap_or_default();
                if let Some(map) = v.as_object_mut() {
                    map.insert("timestamp".to_string(), serde_json::json!(ts));
                }
                v
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_suppresses_disabled_kinds() {
        let bus = EventBus::new(&[EventKind::PoolSwitched]);
        bus.emit(Event::MinerDisconnected { miner: "m1".into() });
        assert!(bus.recent().is_empty());

        bus.emit(Event::PoolSwitched {
            miner: "m1".into(),
            from: Some(PoolId::A),
            to: PoolId::B,
            reason: "slot".into(),
        });
        assert_eq!(bus.recent().len(), 1);
    }

    #[test]
    fn empty_filter_means_everything() {
        let bus = EventBus::new(&[]);
        bus.emit(Event::PoolUnavailable { miners: 3 });
        assert_eq!(bus.recent().len(), 1);
        assert_eq!(bus.recent()[0]["kind"], "pool_unavailable");
    }

    #[test]
    fn ring_is_bounded() {
        let bus = EventBus::new(&[]);
        for i in 0..(RECENT_EVENT_CAPACITY + 10) {
            bus.emit(Event::MinerDisconnected { miner: format!("m{}", i) });
        }
        assert_eq!(bus.recent().len(), RECENT_EVENT_CAPACITY);
    }
}
