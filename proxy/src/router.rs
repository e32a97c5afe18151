//! Share attribution and submission routing.
//!
//! A submit is resolved through the session's own job map to the pool that
//! issued the job — never the pool that happens to be active at submit
//! time — then graded against the stale-grace window and the duplicate
//! window before it is forwarded. The pool's verdict is echoed back to the
//! miner verbatim.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::PoolId;
use crate::downstream::{JobAttribution, MinerConn, SubmitKey};
use crate::events::{Event, EventBus};
use crate::jobs::JobPresence;
use crate::metrics::prometheus as metrics;
use crate::stratum::protocol::{StratumError, StratumResponse};
use crate::upstream::{SubmitVerdict, UpstreamSession};

/// What became of one miner submit.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Forwarded; the pool accepted.
    Accepted { result: Value },
    /// Forwarded; the pool rejected.
    Rejected { result: Value, error: Option<Value> },
    /// Rejected locally: the proxy job id resolves to nothing.
    JobUnknown,
    /// Rejected locally: the job left the ring longer than the grace window ago.
    StaleLocal,
    /// Rejected locally: the submit tuple was already seen.
    DuplicateLocal,
    /// Forwarded, but the pool never answered in time.
    Timeout,
    /// The owning upstream is not connected.
    PoolDown,
}

impl SubmitOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }

    /// The reply written to the miner. Upstream verdicts pass through
    /// verbatim; local rejects use the standard Stratum error array.
    pub fn into_response(self, id: Value) -> StratumResponse {
        match self {
            SubmitOutcome::Accepted { result } => StratumResponse {
                id,
                result: Some(result),
                error: None,
            },
            SubmitOutcome::Rejected { result, error } => StratumResponse {
                id,
                result: Some(result),
                error,
            },
            SubmitOutcome::JobUnknown => {
                StratumResponse::err(id, StratumError::job_not_found())
            }
            SubmitOutcome::StaleLocal => StratumResponse::err(id, StratumError::stale_share()),
            SubmitOutcome::DuplicateLocal => {
                StratumResponse::err(id, StratumError::duplicate_share())
            }
            SubmitOutcome::Timeout => StratumResponse::err(
                id,
                StratumError::new(StratumError::UNKNOWN, "Share response timeout"),
            ),
            SubmitOutcome::PoolDown => StratumResponse::err(
                id,
                StratumError::new(StratumError::UNKNOWN, "Pool unavailable"),
            ),
        }
    }

    fn reject_reason(&self) -> Option<&'static str> {
        match self {
            SubmitOutcome::Accepted { .. } => None,
            SubmitOutcome::Rejected { .. } => Some("upstream"),
            SubmitOutcome::JobUnknown => Some("job_unknown"),
            SubmitOutcome::StaleLocal => Some("stale"),
            SubmitOutcome::DuplicateLocal => Some("duplicate"),
            SubmitOutcome::Timeout => Some("timeout"),
            SubmitOutcome::PoolDown => Some("pool_down"),
        }
    }
}

pub struct ShareRouter {
    upstreams: Arc<RwLock<HashMap<PoolId, Arc<UpstreamSession>>>>,
    stale_grace: RwLock<Duration>,
    bus: Arc<EventBus>,
}

impl ShareRouter {
    pub fn new(
        upstreams: Arc<RwLock<HashMap<PoolId, Arc<UpstreamSession>>>>,
        stale_grace: Duration,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            upstreams,
            stale_grace: RwLock::new(stale_grace),
            bus,
        })
    }

    pub async fn set_stale_grace(&self, grace: Duration) {
        *self.stale_grace.write().await = grace;
    }

    pub async fn route_submit(
        &self,
        connection: &Arc<RwLock<MinerConn>>,
        proxy_job_id: &str,
        extranonce2: &str,
        ntime: &str,
        nonce: &str,
    ) -> SubmitOutcome {
        // Attribution and duplicate screening under one session lock.
        let (attribution, session_counter, miner_label) = {
            let mut conn = connection.write().await;
            let miner_label = conn.session_id.clone();

            let Some(attribution) = conn.attribution(proxy_job_id) else {
                debug!(
                    "miner {}: submit for unknown job {}",
                    &miner_label[..8.min(miner_label.len())],
                    proxy_job_id
                );
                return SubmitOutcome::JobUnknown;
            };

            let key = SubmitKey {
                proxy_job_id: proxy_job_id.to_string(),
                extranonce2: extranonce2.to_string(),
                ntime: ntime.to_string(),
                nonce: nonce.to_string(),
            };
            if !conn.check_and_record_submit(key, Instant::now()) {
                metrics::inc_rejected_duplicate();
                self.bus.emit(Event::ShareResult {
                    pool: attribution.pool_id,
                    miner: miner_label,
                    accepted: false,
                    reason: Some("duplicate".into()),
                });
                return SubmitOutcome::DuplicateLocal;
            }

            (attribution, conn.session_counter, miner_label)
        };

        let outcome = self
            .forward(&attribution, session_counter, &miner_label, extranonce2, ntime, nonce)
            .await;

        match &outcome {
            SubmitOutcome::Accepted { .. } => {
                metrics::inc_accepted(attribution.pool_id.label());
                self.bus.emit(Event::ShareResult {
                    pool: attribution.pool_id,
                    miner: miner_label,
                    accepted: true,
                    reason: None,
                });
            }
            SubmitOutcome::DuplicateLocal => {}
            other => {
                match other {
                    SubmitOutcome::StaleLocal => metrics::inc_rejected_stale(),
                    _ => metrics::inc_rejected(attribution.pool_id.label()),
                }
                self.bus.emit(Event::ShareResult {
                    pool: attribution.pool_id,
                    miner: miner_label,
                    accepted: false,
                    reason: other.reject_reason().map(|r| r.to_string()),
                });
            }
        }
        outcome
    }

    async fn forward(
        &self,
        attribution: &JobAttribution,
        session_counter: u16,
        miner_label: &str,
        extranonce2: &str,
        ntime: &str,
        nonce: &str,
    ) -> SubmitOutcome {
        let upstream = {
            let upstreams = self.upstreams.read().await;
            upstreams.get(&attribution.pool_id).cloned()
        };
        let Some(upstream) = upstream else {
            return SubmitOutcome::PoolDown;
        };

        let grace = *self.stale_grace.read().await;
        match upstream.job_presence(&attribution.pool_job_id, grace).await {
            JobPresence::Current => {}
            JobPresence::WithinGrace => {
                debug!(
                    "miner {}: job {} evicted but within grace, forwarding",
                    &miner_label[..8.min(miner_label.len())],
                    attribution.pool_job_id
                );
            }
            JobPresence::Expired => {
                self.bus.emit(Event::StaleShare {
                    pool: attribution.pool_id,
                    miner: miner_label.to_string(),
                    job_id: attribution.pool_job_id.clone(),
                });
                return SubmitOutcome::StaleLocal;
            }
        }

        let snapshot = upstream.snapshot();
        let Some(layout) = snapshot.extranonce.as_ref() else {
            warn!("[{}] no extranonce layout, dropping submit", attribution.pool_id);
            return SubmitOutcome::PoolDown;
        };
        let pool_extranonce2 = layout.rebuild_extranonce2(session_counter, extranonce2);

        match upstream
            .submit_share(&attribution.pool_job_id, &pool_extranonce2, ntime, nonce)
            .await
        {
            SubmitVerdict::Accepted { result } => SubmitOutcome::Accepted { result },
            SubmitVerdict::Rejected { result, error } => SubmitOutcome::Rejected { result, error },
            SubmitVerdict::Timeout => SubmitOutcome::Timeout,
            SubmitVerdict::Disconnected => SubmitOutcome::PoolDown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn responses_carry_standard_error_arrays() {
        let r = SubmitOutcome::DuplicateLocal.into_response(json!(9));
        assert_eq!(r.error, Some(json!([22, "Duplicate share", null])));

        let r = SubmitOutcome::StaleLocal.into_response(json!(9));
        assert_eq!(r.error, Some(json!([21, "Stale share", null])));

        let r = SubmitOutcome::JobUnknown.into_response(json!(9));
        assert_eq!(r.error, Some(json!([21, "Job not found", null])));
    }

    #[test]
    fn upstream_verdicts_pass_through_verbatim() {
        let r = SubmitOutcome::Accepted { result: json!(true) }.into_response(json!(3));
        assert_eq!(r.result, Some(json!(true)));
        assert!(r.error.is_none());

        let error = json!([23, "Low difficulty share", null]);
        let r = SubmitOutcome::Rejected {
            result: json!(false),
            error: Some(error.clone()),
        }
        .into_response(json!(3));
        assert_eq!(r.result, Some(json!(false)));
        assert_eq!(r.error, Some(error));
    }

    #[test]
    fn only_accepted_counts_as_accepted() {
        assert!(SubmitOutcome::Accepted { result: json!(true) }.accepted());
        assert!(!SubmitOutcome::Timeout.accepted());
        assert!(!SubmitOutcome::DuplicateLocal.accepted());
    }
}
