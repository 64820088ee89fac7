//! In-memory [`JobQueue`] with lease-based claims.
//!
//! Records stay in the queue after they finish so operators can inspect
//! completed and failed jobs. A claim is only honoured while the caller still
//! holds the lease token it was given; once a lease expires the job is
//! claimable again, which is how jobs abandoned by a crashed worker recover.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use provisioning::{
    ClaimedJob, Job, JobFailure, JobId, JobQueue, JobRecord, JobState, Lease, QueueError,
    Timestamp, WorkerName,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct QueueState {
    records: HashMap<JobId, JobRecord>,
    /// Enqueue order; claims scan it front to back.
    order: Vec<JobId>,
}

#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_claimable(record: &JobRecord, now: Timestamp) -> bool {
    match record.state {
        JobState::Queued => record.next_eligible_at <= now,
        JobState::Processing => record
            .lease
            .as_ref()
            .map_or(true, |lease| lease.expires_at <= now),
        JobState::Completed | JobState::Failed => false,
    }
}

/// Returns the record `claim` refers to if the claim's lease is still current.
fn held<'a>(
    state: &'a mut QueueState,
    claim: &ClaimedJob,
) -> Result<&'a mut JobRecord, QueueError> {
    let record = state
        .records
        .get_mut(&claim.id)
        .ok_or(QueueError::UnknownJob(claim.id))?;
    let current = record.state == JobState::Processing
        && record
            .lease
            .as_ref()
            .is_some_and(|lease| lease.token == claim.lease.token);
    if current {
        Ok(record)
    } else {
        Err(QueueError::LeaseMismatch(claim.id))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        let mut state = self.lock();
        let duplicate = state.order.iter().find(|id| {
            state.records.get(*id).is_some_and(|r| {
                matches!(r.state, JobState::Queued | JobState::Processing)
                    && r.job.repo_id() == job.repo_id()
                    && r.job.ext_svc_id() == job.ext_svc_id()
            })
        });
        if let Some(id) = duplicate {
            debug!(job_id = %id, repo = %job.repo_name(), "job already outstanding");
            return Ok(*id);
        }

        let now = Timestamp::now();
        let id = JobId::new_random();
        state.records.insert(
            id,
            JobRecord {
                id,
                job,
                state: JobState::Queued,
                attempts: 0,
                next_eligible_at: now,
                last_error: None,
                lease: None,
                enqueued_at: now,
                updated_at: now,
            },
        );
        state.order.push(id);
        Ok(id)
    }

    async fn claim(
        &self,
        worker: &WorkerName,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        let now = Timestamp::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(id) = state
            .order
            .iter()
            .copied()
            .find(|id| state.records.get(id).is_some_and(|r| is_claimable(r, now)))
        else {
            return Ok(None);
        };
        let record = state
            .records
            .get_mut(&id)
            .ok_or(QueueError::UnknownJob(id))?;

        if record.state == JobState::Processing {
            debug!(job_id = %id, "reclaiming job with expired lease");
        }
        let granted = Lease {
            token: Uuid::new_v4(),
            worker: worker.clone(),
            expires_at: now.plus(lease),
        };
        record.state = JobState::Processing;
        record.attempts += 1;
        record.lease = Some(granted.clone());
        record.updated_at = now;

        Ok(Some(ClaimedJob {
            id,
            job: record.job.clone(),
            attempt: record.attempts,
            lease: granted,
        }))
    }

    async fn complete(&self, claim: &ClaimedJob) -> Result<(), QueueError> {
        let mut state = self.lock();
        let record = held(&mut state, claim)?;
        record.state = JobState::Completed;
        record.lease = None;
        record.updated_at = Timestamp::now();
        Ok(())
    }

    async fn release(
        &self,
        claim: &ClaimedJob,
        not_before: Timestamp,
        failure: JobFailure,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        let record = held(&mut state, claim)?;
        record.state = JobState::Queued;
        record.lease = None;
        record.next_eligible_at = not_before;
        record.last_error = Some(failure);
        record.updated_at = Timestamp::now();
        Ok(())
    }

    async fn fail_permanently(
        &self,
        claim: &ClaimedJob,
        failure: JobFailure,
    ) -> Result<(), QueueError> {
        let mut state = self.lock();
        let record = held(&mut state, claim)?;
        record.state = JobState::Failed;
        record.lease = None;
        record.last_error = Some(failure);
        record.updated_at = Timestamp::now();
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<JobRecord, QueueError> {
        self.lock()
            .records
            .get(&id)
            .cloned()
            .ok_or(QueueError::UnknownJob(id))
    }

    async fn outstanding(&self) -> Result<usize, QueueError> {
        Ok(self
            .lock()
            .records
            .values()
            .filter(|r| matches!(r.state, JobState::Queued | JobState::Processing))
            .count())
    }

    async fn failed(&self) -> Result<Vec<JobRecord>, QueueError> {
        let state = self.lock();
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|r| r.state == JobState::Failed)
            .cloned()
            .collect())
    }
}
