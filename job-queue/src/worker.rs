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

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{
    sync::{watch, Semaphore},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::QueueConfig,
    dlq_name,
    error::QueueError,
    job::{DlqEntry, Job, JobStatus},
    store::SharedQueueStore,
};

/// Processes jobs popped off one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), anyhow::Error>;
}

/// How often an idle worker polls its queue.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Attempts to get a DLQ entry persisted before giving up.
const DLQ_MOVE_ATTEMPTS: u32 = 3;

pub struct Worker {
    queue: String,
    config: QueueConfig,
    store: SharedQueueStore,
    handler: Arc<dyn JobHandler>,
    dlq_retention: usize,
}

impl Worker {
    pub fn new(
        queue: impl Into<String>,
        config: QueueConfig,
        store: SharedQueueStore,
        handler: Arc<dyn JobHandler>,
        dlq_retention: usize,
    ) -> Self {
        Self {
            queue: queue.into(),
            config,
            store,
            handler,
            dlq_retention,
        }
    }

    /// Runs until `shutdown` flips to true.
    ///
    /// At most `config.concurrency` jobs are in flight at any time;
    /// each job runs under the queue's hard deadline.
    #[instrument(skip_all, fields(queue = %self.queue))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        info!(concurrency = self.config.concurrency, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    permit.expect("semaphore never closed")
                }
                _ = shutdown.changed() => continue,
            };

            match self.store.pop_ready(&self.queue, Utc::now()).await {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        () = sleep(IDLE_POLL_INTERVAL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(pop_error) => {
                    drop(permit);
                    warn!(%pop_error, "popping job failed");
                    tokio::select! {
                        () = sleep(IDLE_POLL_INTERVAL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        // wait for in-flight jobs
        let _ = semaphore
            .acquire_many(self.config.concurrency as u32)
            .await;
        info!("worker stopped");
    }

    /// Pops and processes at most one job; true when one was processed.
    ///
    /// Drives tests and drain-style maintenance tasks without the
    /// background loop.
    pub async fn tick(&self) -> Result<bool, QueueError> {
        match self.store.pop_ready(&self.queue, Utc::now()).await? {
            Some(job) => {
                self.process(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[instrument(skip_all, fields(queue = %self.queue, job_id = %job.id, job_name = %job.name))]
    async fn process(&self, mut job: Job) {
        let deadline = Duration::from_millis(self.config.job_timeout_ms);
        let outcome = timeout(deadline, self.handler.handle(&job)).await;

        match outcome {
            Ok(Ok(())) => {
                job.status = JobStatus::Completed;
                job.attempts_made += 1;
                if let Err(update_error) = self.store.update_job(&job).await {
                    warn!(%update_error, "marking job completed failed");
                }
                debug!("job completed");
            }
            Ok(Err(handler_error)) => {
                self.handle_failure(job, handler_error.to_string()).await;
            }
            Err(_elapsed) => {
                self.handle_failure(
                    job,
                    format!("timed out after {}ms", self.config.job_timeout_ms),
                )
                .await;
            }
        }
    }

    async fn handle_failure(&self, mut job: Job, reason: String) {
        job.attempts_made += 1;
        job.last_error = Some(reason.clone());
        job.last_failed_at = Some(Utc::now());

        if !job.attempts_exhausted() {
            let delay = self.config.backoff.delay_ms(job.attempts_made);
            job.status = JobStatus::Waiting;
            job.next_run_at = Utc::now() + chrono::Duration::milliseconds(delay as i64);
            warn!(
                attempts_made = job.attempts_made,
                retry_in_ms = delay,
                %reason,
                "job failed, retrying"
            );
            if let Err(requeue_error) = self.store.push_delayed(&job).await {
                error!(%requeue_error, "re-queueing failed job failed");
            }
            return;
        }

        // the DLQ move must happen before the source job is marked dead
        let entry = DlqEntry::from_job(&job, &reason);
        let moved = self.move_to_dlq(&entry).await;
        if !moved {
            error!(
                job_id = %job.id,
                queue = %self.queue,
                "CRITICAL: DLQ move failed permanently, job may be LOST"
            );
        }

        job.status = JobStatus::Dead;
        if let Err(update_error) = self.store.update_job(&job).await {
            error!(%update_error, "marking job dead failed");
        }
        warn!(attempts_made = job.attempts_made, %reason, "job moved to DLQ");
    }

    async fn move_to_dlq(&self, entry: &DlqEntry) -> bool {
        let dlq = dlq_name(&self.queue);
        for attempt in 1..=DLQ_MOVE_ATTEMPTS {
            match self
                .store
                .push_dlq(&dlq, entry, self.dlq_retention)
                .await
            {
                Ok(()) => return true,
                Err(push_error) if push_error.is_transient() && attempt < DLQ_MOVE_ATTEMPTS => {
                    warn!(%push_error, attempt, "DLQ move failed, retrying");
                    sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(push_error) => {
                    error!(%push_error, attempt, "DLQ move failed");
                    return false;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::{job::Backoff, store::InMemoryStore, store::QueueStore};

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn handle(&self, _job: &Job) -> Result<(), anyhow::Error> {
            anyhow::bail!("always broken")
        }
    }

    struct CountingHandler(AtomicU32);

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> Result<(), anyhow::Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct HangingHandler;

    #[async_trait]
    impl JobHandler for HangingHandler {
        async fn handle(&self, _job: &Job) -> Result<(), anyhow::Error> {
            sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            concurrency: 1,
            max_attempts: 3,
            backoff: Backoff::Fixed { base_delay_ms: 0 },
            job_timeout_ms: 50,
            priority_levels: 3,
        }
    }

    fn worker_with(handler: Arc<dyn JobHandler>) -> (Worker, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let worker = Worker::new(
            "notifications",
            fast_config(),
            store.clone(),
            handler,
            100,
        );
        (worker, store)
    }

    #[tokio::test]
    async fn test_exhausted_job_lands_in_dlq_and_is_marked_dead() {
        let (worker, store) = worker_with(Arc::new(FailingHandler));
        let job = Job::new("notifications", "send_email", json!({"to": "x"}));
        store.push_job(&job).await.unwrap();

        // 3 attempts, backoff 0 so the job is immediately due again
        for _ in 0..3 {
            assert!(worker.tick().await.unwrap());
        }
        assert!(!worker.tick().await.unwrap());

        let entries = store.list_dlq("dlq:notifications", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].original_job_id, job.id);
        assert_eq!(entries[0].attempts_made, 3);

        let stored = store
            .get_job("notifications", &job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, JobStatus::Dead);
        assert!(stored.last_failed_at.is_some());
        assert!(entries[0].failed_at >= stored.last_failed_at.unwrap());
    }

    #[tokio::test]
    async fn test_successful_job_completes_with_payload_intact() {
        let handler = Arc::new(CountingHandler(AtomicU32::new(0)));
        let (worker, store) = worker_with(handler.clone());
        let payload = json!({"student": "ADM001", "date": "2024-04-01"});
        let job = Job::new("notifications", "absence_alert", payload.clone());
        store.push_job(&job).await.unwrap();

        assert!(worker.tick().await.unwrap());
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);

        let stored = store
            .get_job("notifications", &job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.payload, payload);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let (worker, store) = worker_with(Arc::new(HangingHandler));
        let job = Job::new("notifications", "slow", json!({}));
        store.push_job(&job).await.unwrap();

        assert!(worker.tick().await.unwrap());

        let stored = store
            .get_job("notifications", &job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, JobStatus::Waiting);
        assert_eq!(stored.attempts_made, 1);
        assert!(stored.last_error.unwrap().contains("timed out"));
    }
}
