//! Job records and the per-pool job ring.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::config::PoolId;

/// Most recent jobs retained per upstream.
pub const JOB_RING_CAPACITY: usize = 16;

/// Eviction records kept for the stale-grace window check.
const EVICTED_CAPACITY: usize = 64;

/// One `mining.notify` from an upstream pool, as received, stamped with the
/// difficulty that was active when the job was issued.
#[derive(Debug, Clone)]
pub struct Job {
    pub pool_id: PoolId,
    pub pool_job_id: String,
    pub prevhash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branch: Vec<String>,
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    pub clean_jobs: bool,
    pub received_at: Instant,
    pub difficulty: f64,
}

fn param_str(params: &[Value], idx: usize) -> Result<String> {
    params
        .get(idx)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("mining.notify param[{}] missing or not a string", idx))
}

impl Job {
    /// Parse the standard nine-element `mining.notify` params.
    pub fn from_notify(pool_id: PoolId, params: &[Value], difficulty: f64) -> Result<Self> {
        if params.len() < 9 {
            return Err(anyhow!("mining.notify expects 9 params, got {}", params.len()));
        }

        let merkle_branch = params[4]
            .as_array()
            .ok_or_else(|| anyhow!("mining.notify param[4] is not an array"))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| anyhow!("merkle branch entry is not a string"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            pool_id,
            pool_job_id: param_str(params, 0)?,
            prevhash: param_str(params, 1)?,
            coinbase1: param_str(params, 2)?,
            coinbase2: param_str(params, 3)?,
            merkle_branch,
            version: param_str(params, 5)?,
            nbits: param_str(params, 6)?,
            ntime: param_str(params, 7)?,
            clean_jobs: params[8].as_bool().unwrap_or(false),
            received_at: Instant::now(),
            difficulty,
        })
    }

    /// `mining.notify` params for downstream, with the job id rewritten to
    /// the proxy-minted one.
    pub fn notify_params(&self, proxy_job_id: &str, clean_jobs: bool) -> Value {
        serde_json::json!([
            proxy_job_id,
            self.prevhash,
            self.coinbase1,
            self.coinbase2,
            self.merkle_branch,
            self.version,
            self.nbits,
            self.ntime,
            clean_jobs,
        ])
    }
}

/// Where a pool job id stands relative to the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPresence {
    Current,
    WithinGrace,
    Expired,
}

/// Bounded FIFO of the most recent jobs for one upstream. Evicted ids keep
/// their eviction timestamp so late submits can be graded against the
/// stale-grace window.
#[derive(Debug)]
pub struct JobRing {
    capacity: usize,
    jobs: VecDeque<Arc<Job>>,
    evicted: VecDeque<(String, Instant)>,
}

impl JobRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            jobs: VecDeque::with_capacity(capacity),
            evicted: VecDeque::new(),
        }
    }

    pub fn push(&mut self, job: Arc<Job>) {
        self.jobs.push_back(job);
        while self.jobs.len() > self.capacity {
            if let Some(old) = self.jobs.pop_front() {
                self.evicted.push_back((old.pool_job_id.clone(), Instant::now()));
            }
        }
        while self.evicted.len() > EVICTED_CAPACITY {
            self.evicted.pop_front();
        }
    }

    pub fn get(&self, pool_job_id: &str) -> Option<Arc<Job>> {
        self.jobs.iter().find(|j| j.pool_job_id == pool_job_id).cloned()
    }

    pub fn latest(&self) -> Option<Arc<Job>> {
        self.jobs.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn presence(&self, pool_job_id: &str, grace: Duration, now: Instant) -> JobPresence {
        if self.jobs.iter().any(|j| j.pool_job_id == pool_job_id) {
            return JobPresence::Current;
        }
        match self.evicted.iter().rev().find(|(id, _)| id == pool_job_id) {
            Some((_, at)) if now.saturating_duration_since(*at) <= grace => JobPresence::WithinGrace,
            _ => JobPresence::Expired,
        }
    }

    /// Drop eviction records older than `max_age`.
    pub fn prune_evicted(&mut self, max_age: Duration, now: Instant) {
        self.evicted
            .retain(|(_, at)| now.saturating_duration_since(*at) <= max_age);
    }

    pub fn clear(&mut self) {
        // Reconnect invalidates the id space; evicted records go with it.
        self.jobs.clear();
        self.evicted.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_job(id: &str) -> Arc<Job> {
        let params = vec![
            json!(id),
            json!("00".repeat(32)),
            json!("01000000"),
            json!("ffffffff"),
            json!(["aa".repeat(32)]),
            json!("20000000"),
            json!("1a01a234"),
            json!("6632f0aa"),
            json!(false),
        ];
        Arc::new(Job::from_notify(PoolId::A, &params, 1024.0).unwrap())
    }

    #[test]
    fn notify_parse_roundtrip() {
        let job = test_job("j1");
        assert_eq!(job.pool_job_id, "j1");
        assert_eq!(job.merkle_branch.len(), 1);
        assert_eq!(job.difficulty, 1024.0);
        assert!(!job.clean_jobs);

        let params = job.notify_params("p7", true);
        let arr = params.as_array().unwrap();
        assert_eq!(arr[0], json!("p7"));
        assert_eq!(arr[8], json!(true));
    }

    #[test]
    fn short_notify_is_rejected() {
        let params = vec![json!("j1"), json!("x")];
        assert!(Job::from_notify(PoolId::A, &params, 1.0).is_err());
    }

    #[test]
    fn ring_prunes_fifo() {
        let mut ring = JobRing::new(3);
        for i in 0..5 {
            ring.push(test_job(&format!("j{}", i)));
        }
        assert_eq!(ring.len(), 3);
        assert!(ring.get("j0").is_none());
        assert!(ring.get("j1").is_none());
        assert!(ring.get("j2").is_some());
        assert_eq!(ring.latest().unwrap().pool_job_id, "j4");
    }

    #[test]
    fn presence_tracks_grace_window() {
        let mut ring = JobRing::new(1);
        ring.push(test_job("j0"));
        ring.push(test_job("j1")); // evicts j0

        let now = Instant::now();
        assert_eq!(ring.presence("j1", Duration::from_secs(20), now), JobPresence::Current);
        assert_eq!(
            ring.presence("j0", Duration::from_secs(20), now),
            JobPresence::WithinGrace
        );
        // Past the grace window the eviction no longer counts.
        let later = now + Duration::from_secs(21);
        assert_eq!(
            ring.presence("j0", Duration::from_secs(20), later),
            JobPresence::Expired
        );
        assert_eq!(
            ring.presence("never-seen", Duration::from_secs(20), now),
            JobPresence::Expired
        );
    }
}
