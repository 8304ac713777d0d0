//! Background job registry.
//!
//! Jobs move `Pending -> Success | Failed | Cancelled` exactly once. The
//! registry is the only shared mutable state; readers get copies. Work runs
//! on spawned tokio tasks, at most `max_concurrent_jobs` at a time.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::types::{
    ErrorKind, JobId, JobKind, JobSnapshot, JobStatus, JobSummary, LendError,
};

/// Unit of background work: resolves to the job's result data.
pub type JobFuture = BoxFuture<'static, Result<Value, LendError>>;

#[derive(Debug, Clone)]
struct JobRecord {
    kind: JobKind,
    status: JobStatus,
    error: Option<String>,
    error_kind: Option<ErrorKind>,
    data: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRecord {
    fn snapshot(&self, job_id: JobId) -> JobSnapshot {
        JobSnapshot {
            job_id,
            kind: self.kind.clone(),
            status: self.status,
            error: self.error.clone(),
            error_kind: self.error_kind,
            data: self.data.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn summary(&self, job_id: JobId) -> JobSummary {
        JobSummary {
            job_id,
            kind: self.kind.clone(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Owned, cloneable handle to the job table. Clones share state.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<JobId, JobRecord>>>,
    permits: Arc<Semaphore>,
    retention: chrono::Duration,
    max_jobs: usize,
}

impl JobRegistry {
    pub fn new(config: &JobsConfig) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            retention: config.retention(),
            max_jobs: config.max_jobs.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending job and start `work` in the background.
    ///
    /// Returns as soon as the record exists; the caller never waits for the
    /// work. Fails with [`LendError::Validation`] when the registry is still
    /// full after dropping expired jobs. Must be called within a tokio
    /// runtime.
    pub fn submit(&self, kind: JobKind, work: JobFuture) -> Result<JobId, LendError> {
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        {
            let mut jobs = self.lock();
            if jobs.len() >= self.max_jobs {
                if let Some(cutoff) = now.checked_sub_signed(self.retention) {
                    let removed = remove_older_than(&mut jobs, cutoff);
                    debug!(removed, "Registry full, ran eager cleanup");
                }
            }
            if jobs.len() >= self.max_jobs {
                warn!(max_jobs = self.max_jobs, "Job registry full, rejecting submission");
                return Err(LendError::Validation(format!(
                    "job registry is full ({} jobs)",
                    self.max_jobs
                )));
            }
            jobs.insert(
                job_id,
                JobRecord {
                    kind: kind.clone(),
                    status: JobStatus::Pending,
                    error: None,
                    error_kind: None,
                    data: None,
                    created_at: now,
                    updated_at: now,
                },
            );
        }

        info!(job_id = %job_id, kind = ?kind, "Job submitted");
        tokio::spawn(self.clone().run(job_id, work));
        Ok(job_id)
    }

    async fn run(self, job_id: JobId, work: JobFuture) {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.complete(
                    job_id,
                    Err(LendError::Configuration("job worker pool is closed".into())),
                );
                return;
            }
        };

        if self.status(job_id) != Some(JobStatus::Pending) {
            debug!(job_id = %job_id, "Job no longer pending, skipping work");
            return;
        }

        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(LendError::Configuration("job worker panicked".into())),
        };
        self.complete(job_id, outcome);
    }

    /// Record a terminal outcome. Ignored unless the job is still pending.
    fn complete(&self, job_id: JobId, outcome: Result<Value, LendError>) {
        let mut jobs = self.lock();
        let Some(record) = jobs.get_mut(&job_id) else {
            debug!(job_id = %job_id, "Finished job was already cleaned up");
            return;
        };
        if record.status.is_terminal() {
            debug!(job_id = %job_id, status = %record.status, "Job already terminal, dropping outcome");
            return;
        }

        record.updated_at = Utc::now();
        match outcome {
            Ok(data) => {
                record.status = JobStatus::Success;
                record.data = Some(data);
                info!(job_id = %job_id, "Job succeeded");
            }
            Err(e) => {
                record.status = JobStatus::Failed;
                record.error_kind = Some(e.kind());
                record.error = Some(e.to_string());
                warn!(job_id = %job_id, error = %e, kind = ?e.kind(), "Job failed");
            }
        }
    }

    fn status(&self, job_id: JobId) -> Option<JobStatus> {
        self.lock().get(&job_id).map(|r| r.status)
    }

    /// Copy of one job.
    pub fn get(&self, job_id: JobId) -> Result<JobSnapshot, LendError> {
        self.lock()
            .get(&job_id)
            .map(|r| r.snapshot(job_id))
            .ok_or_else(|| LendError::NotFound(format!("job {job_id}")))
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<JobSummary> {
        let mut summaries: Vec<JobSummary> = self
            .lock()
            .iter()
            .map(|(id, record)| record.summary(*id))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Flag a pending job as cancelled. Work already running is not
    /// interrupted, but its outcome will be discarded.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let mut jobs = self.lock();
        match jobs.get_mut(&job_id) {
            Some(record) if record.status == JobStatus::Pending => {
                record.status = JobStatus::Cancelled;
                record.updated_at = Utc::now();
                info!(job_id = %job_id, "Job cancelled");
                true
            }
            _ => false,
        }
    }

    /// Drop every job created before `cutoff`, whatever its state.
    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let removed = remove_older_than(&mut self.lock(), cutoff);
        if removed > 0 {
            info!(removed, "Expired jobs removed");
        }
        removed
    }

    /// Drop jobs older than the retention window. A window reaching past
    /// the earliest representable time removes nothing.
    pub fn cleanup_expired(&self) -> usize {
        match Utc::now().checked_sub_signed(self.retention) {
            Some(cutoff) => self.cleanup_older_than(cutoff),
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poll until the job is terminal or `timeout` elapses.
    pub async fn wait_for(&self, job_id: JobId, timeout: Duration) -> Result<JobSnapshot, LendError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.get(job_id)?;
            if snapshot.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(snapshot);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Run [`Self::cleanup_expired`] every `every` until `cancel` fires.
    pub fn spawn_cleanup(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.cleanup_expired();
                    }
                    _ = cancel.cancelled() => {
                        info!("Job cleanup loop shutting down");
                        break;
                    }
                }
            }
        })
    }
}

fn remove_older_than(jobs: &mut HashMap<JobId, JobRecord>, cutoff: DateTime<Utc>) -> usize {
    let before = jobs.len();
    jobs.retain(|_, record| record.created_at >= cutoff);
    before - jobs.len()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
