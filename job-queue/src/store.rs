// Copyright 2023 Xayn AG
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    error::QueueError,
    job::{DlqEntry, Job, JobStatus},
};

/// Contract implemented by queue backends.
///
/// The in-memory implementation backs tests and the redis
/// implementation backs production; the worker and the public
/// [`crate::JobQueue`] API only talk through this seam.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persists a new waiting job and makes it poppable once due.
    async fn push_job(&self, job: &Job) -> Result<(), QueueError>;

    /// Re-reads a job by id.
    async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<Job>, QueueError>;

    /// Overwrites the stored job record.
    async fn update_job(&self, job: &Job) -> Result<(), QueueError>;

    /// Promotes due delayed jobs and pops the next ready job, highest
    /// priority level first, FIFO within a level. The popped job is
    /// marked active.
    async fn pop_ready(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError>;

    /// Moves a failed job back into the delayed set.
    async fn push_delayed(&self, job: &Job) -> Result<(), QueueError>;

    /// Appends to the paired DLQ, trimming to `retention` entries.
    async fn push_dlq(
        &self,
        dlq: &str,
        entry: &DlqEntry,
        retention: usize,
    ) -> Result<(), QueueError>;

    async fn list_dlq(&self, dlq: &str, limit: usize) -> Result<Vec<DlqEntry>, QueueError>;

    /// Removes the entry for `original_job_id`; true when it existed.
    async fn remove_dlq_entry(&self, dlq: &str, original_job_id: &str)
        -> Result<bool, QueueError>;

    async fn dlq_len(&self, dlq: &str) -> Result<usize, QueueError>;

    /// Waiting + delayed jobs on the queue.
    async fn queue_len(&self, queue: &str) -> Result<usize, QueueError>;

    /// Age in milliseconds of the oldest job which is due but not yet
    /// picked up; `None` when the queue is drained.
    async fn oldest_ready_age_ms(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, QueueError>;

    /// Registers `key -> job_id` unless present; returns the already
    /// registered job id on a duplicate.
    async fn idempotency_put_if_absent(
        &self,
        key: &str,
        job_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, QueueError>;

    /// Cheap backend liveness probe.
    async fn ping(&self) -> Result<(), QueueError>;
}

pub type SharedQueueStore = Arc<dyn QueueStore>;

#[derive(Default)]
struct QueueState {
    // one FIFO per priority level, index = priority
    ready: Vec<VecDeque<String>>,
    delayed: Vec<(DateTime<Utc>, String)>,
    jobs: HashMap<String, Job>,
}

#[derive(Default)]
struct MemoryState {
    queues: HashMap<String, QueueState>,
    dlqs: HashMap<String, VecDeque<DlqEntry>>,
    idempotency: HashMap<String, (String, DateTime<Utc>)>,
}

/// Simple in-memory store used in tests or when redis is not configured.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ready_slot(state: &mut QueueState, priority: u8) -> &mut VecDeque<String> {
    let index = usize::from(priority);
    if state.ready.len() <= index {
        state.ready.resize_with(index + 1, VecDeque::new);
    }
    &mut state.ready[index]
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn push_job(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        let queue = state.queues.entry(job.queue.clone()).or_default();
        queue.jobs.insert(job.id.clone(), job.clone());
        if job.next_run_at <= Utc::now() {
            ready_slot(queue, job.priority).push_back(job.id.clone());
        } else {
            queue.delayed.push((job.next_run_at, job.id.clone()));
        }
        Ok(())
    }

    async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<Job>, QueueError> {
        let state = self.inner.lock();
        Ok(state
            .queues
            .get(queue)
            .and_then(|queue| queue.jobs.get(job_id))
            .cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        let queue = state.queues.entry(job.queue.clone()).or_default();
        queue.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn pop_ready(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let mut state = self.inner.lock();
        let Some(queue) = state.queues.get_mut(queue) else {
            return Ok(None);
        };

        // promote due delayed jobs into their priority slot
        let mut due = Vec::new();
        queue.delayed.retain(|(run_at, id)| {
            if *run_at <= now {
                due.push(id.clone());
                false
            } else {
                true
            }
        });
        for id in due {
            let priority = queue.jobs.get(&id).map(|job| job.priority).unwrap_or(0);
            ready_slot(queue, priority).push_back(id);
        }

        // highest priority level first, FIFO within the level
        for slot in queue.ready.iter_mut().rev() {
            if let Some(id) = slot.pop_front() {
                if let Some(job) = queue.jobs.get_mut(&id) {
                    job.status = JobStatus::Active;
                    return Ok(Some(job.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn push_delayed(&self, job: &Job) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        let queue = state.queues.entry(job.queue.clone()).or_default();
        queue.jobs.insert(job.id.clone(), job.clone());
        queue.delayed.push((job.next_run_at, job.id.clone()));
        Ok(())
    }

    async fn push_dlq(
        &self,
        dlq: &str,
        entry: &DlqEntry,
        retention: usize,
    ) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        let dlq = state.dlqs.entry(dlq.to_owned()).or_default();
        dlq.push_front(entry.clone());
        dlq.truncate(retention);
        Ok(())
    }

    async fn list_dlq(&self, dlq: &str, limit: usize) -> Result<Vec<DlqEntry>, QueueError> {
        let state = self.inner.lock();
        Ok(state
            .dlqs
            .get(dlq)
            .map(|entries| entries.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_dlq_entry(
        &self,
        dlq: &str,
        original_job_id: &str,
    ) -> Result<bool, QueueError> {
        let mut state = self.inner.lock();
        let Some(entries) = state.dlqs.get_mut(dlq) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|entry| entry.original_job_id != original_job_id);
        Ok(entries.len() < before)
    }

    async fn dlq_len(&self, dlq: &str) -> Result<usize, QueueError> {
        let state = self.inner.lock();
        Ok(state.dlqs.get(dlq).map(VecDeque::len).unwrap_or(0))
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, QueueError> {
        let state = self.inner.lock();
        Ok(state
            .queues
            .get(queue)
            .map(|queue| {
                queue.ready.iter().map(VecDeque::len).sum::<usize>() + queue.delayed.len()
            })
            .unwrap_or(0))
    }

    async fn oldest_ready_age_ms(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, QueueError> {
        let state = self.inner.lock();
        let Some(queue) = state.queues.get(queue) else {
            return Ok(None);
        };
        let oldest = queue
            .ready
            .iter()
            .flatten()
            .filter_map(|id| queue.jobs.get(id))
            .map(|job| job.next_run_at)
            .chain(
                queue
                    .delayed
                    .iter()
                    .filter(|(run_at, _)| *run_at <= now)
                    .map(|(run_at, _)| *run_at),
            )
            .min();
        Ok(oldest.map(|run_at| {
            (now - run_at).num_milliseconds().max(0) as u64
        }))
    }

    async fn idempotency_put_if_absent(
        &self,
        key: &str,
        job_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, QueueError> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        state
            .idempotency
            .retain(|_, (_, expires_at)| *expires_at > now);
        match state.idempotency.get(key) {
            Some((existing, _)) => Ok(Some(existing.clone())),
            None => {
                let expires_at = now
                    + chrono::Duration::from_std(ttl)
                        .unwrap_or_else(|_| chrono::Duration::hours(24));
                state
                    .idempotency
                    .insert(key.to_owned(), (job_id.to_owned(), expires_at));
                Ok(None)
            }
        }
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_pop_ready_respects_priority_then_fifo() {
        let store = InMemoryStore::new();
        let mut low_1 = Job::new("default", "a", json!({}));
        low_1.priority = 0;
        let mut low_2 = Job::new("default", "b", json!({}));
        low_2.priority = 0;
        let mut high = Job::new("default", "c", json!({}));
        high.priority = 2;

        store.push_job(&low_1).await.unwrap();
        store.push_job(&low_2).await.unwrap();
        store.push_job(&high).await.unwrap();

        let now = Utc::now();
        let first = store.pop_ready("default", now).await.unwrap().unwrap();
        let second = store.pop_ready("default", now).await.unwrap().unwrap();
        let third = store.pop_ready("default", now).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(second.id, low_1.id);
        assert_eq!(third.id, low_2.id);
        assert!(store.pop_ready("default", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_jobs_surface_only_when_due() {
        let store = InMemoryStore::new();
        let mut job = Job::new("reports", "later", json!({}));
        job.next_run_at = Utc::now() + chrono::Duration::seconds(60);
        store.push_job(&job).await.unwrap();

        assert!(store.pop_ready("reports", Utc::now()).await.unwrap().is_none());
        let after = Utc::now() + chrono::Duration::seconds(61);
        let popped = store.pop_ready("reports", after).await.unwrap().unwrap();
        assert_eq!(popped.id, job.id);
        assert_eq!(popped.status, JobStatus::Active);
    }

    #[tokio::test]
    async fn test_dlq_retention_keeps_latest() {
        let store = InMemoryStore::new();
        for index in 0..5 {
            let job = Job::new("fees", format!("j{index}"), json!({}));
            let entry = DlqEntry::from_job(&job, "boom");
            store.push_dlq("dlq:fees", &entry, 3).await.unwrap();
        }
        let entries = store.list_dlq("dlq:fees", 10).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].original_name, "j4");
    }

    #[tokio::test]
    async fn test_idempotency_put_if_absent() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(
            store.idempotency_put_if_absent("k", "job-1", ttl).await.unwrap(),
            None
        );
        assert_eq!(
            store.idempotency_put_if_absent("k", "job-2", ttl).await.unwrap(),
            Some("job-1".into())
        );
    }
}
