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

//! Retrying, idempotent work queue with paired dead-letter queues.
//!
//! One fixed set of queues serves the whole server; every queue has a
//! paired `dlq:<name>` holding jobs which exhausted their attempts.
//! When the backend is down at startup the subsystem degrades: enqueues
//! fail fast with [`QueueError::Unavailable`] while the rest of the
//! server keeps running.

pub mod config;
mod error;
pub mod job;
mod redis;
pub mod store;
pub mod worker;

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

pub use crate::{
    config::{Config, QueueConfig},
    error::QueueError,
    job::{Backoff, DlqEntry, Job, JobStatus},
    redis::RedisStore,
    store::{InMemoryStore, QueueStore, SharedQueueStore},
    worker::{JobHandler, Worker},
};

/// The fixed queue set.
pub const QUEUE_NAMES: &[&str] = &[
    "attendance",
    "notifications",
    "reports",
    "academic",
    "examinations",
    "fees",
    "default",
];

/// Name of the paired DLQ.
pub fn dlq_name(queue: &str) -> String {
    format!("dlq:{queue}")
}

#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    pub idempotency_key: Option<String>,
    pub priority: Option<u8>,
    pub delay_ms: Option<u64>,
    pub tenant_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EnqueueOutcome {
    pub job_id: String,
    pub duplicate: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueCounts {
    pub queue: String,
    pub waiting: usize,
    pub dlq: usize,
}

/// Derives a deterministic idempotency key from the job identity.
pub fn derive_idempotency_key(queue: &str, name: &str, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(queue.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(payload.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
        out
    })
}

/// Shared front door to the queue backend.
///
/// Cheap to clone; handed to the HTTP layer via app state.
#[derive(Clone)]
pub struct JobQueue {
    store: Option<SharedQueueStore>,
    config: Config,
}

impl JobQueue {
    pub fn new(store: SharedQueueStore, config: Config) -> Self {
        Self {
            store: Some(store),
            config,
        }
    }

    /// Connects to redis; on failure returns a degraded instance which
    /// fails fast on every enqueue.
    pub async fn connect(config: Config) -> Self {
        if config.url.is_empty() {
            warn!("queue backend disabled by configuration");
            return Self {
                store: None,
                config,
            };
        }
        match RedisStore::connect(&config.url).await {
            Ok(store) => {
                info!("queue backend connected");
                Self {
                    store: Some(Arc::new(store)),
                    config,
                }
            }
            Err(connect_error) => {
                warn!(%connect_error, "queue backend unavailable, degrading");
                Self {
                    store: None,
                    config,
                }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Result<&SharedQueueStore, QueueError> {
        self.store.as_ref().ok_or(QueueError::Unavailable)
    }

    /// Enqueues a job; duplicates collapse onto the first submission.
    pub async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let store = self.store()?;
        if !QUEUE_NAMES.contains(&queue) {
            return Err(QueueError::UnknownQueue(queue.to_owned()));
        }
        let queue_config = self.config.queue_config(queue);

        let mut job = Job::new(queue, name, payload);
        job.max_attempts = queue_config.max_attempts;
        job.tenant_id = options.tenant_id;
        if let Some(priority) = options.priority {
            job.priority = priority.min(queue_config.priority_levels.saturating_sub(1));
        }
        if let Some(delay_ms) = options.delay_ms {
            job.next_run_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
        }

        if let Some(key) = &options.idempotency_key {
            let full_key = format!("{queue}:{name}:{key}");
            job.idempotency_key = Some(key.clone());
            let ttl = Duration::from_secs(self.config.idempotency_ttl_hours * 3600);
            if let Some(existing) = store
                .idempotency_put_if_absent(&full_key, &job.id, ttl)
                .await?
            {
                return Ok(EnqueueOutcome {
                    job_id: existing,
                    duplicate: true,
                });
            }
        }

        store.push_job(&job).await?;
        Ok(EnqueueOutcome {
            job_id: job.id,
            duplicate: false,
        })
    }

    /// Re-enqueues all DLQ entries onto `target_queue`.
    ///
    /// Entries are removed only after the replacement job is stored, so
    /// a crash can duplicate but never lose them.
    pub async fn retry_dlq(&self, queue: &str, target_queue: &str) -> Result<usize, QueueError> {
        let store = self.store()?;
        if !QUEUE_NAMES.contains(&target_queue) {
            return Err(QueueError::UnknownQueue(target_queue.to_owned()));
        }
        let dlq = dlq_name(queue);
        let target_config = self.config.queue_config(target_queue);

        let entries = store.list_dlq(&dlq, self.config.dlq_retention).await?;
        let mut retried = 0;
        for entry in entries {
            let mut job = Job::new(target_queue, &entry.original_name, entry.original_payload);
            job.max_attempts = target_config.max_attempts;
            job.idempotency_key = entry.idempotency_key;
            job.tenant_id = entry.tenant_id;
            job.retried_from_dlq = Some(entry.original_job_id.clone());
            store.push_job(&job).await?;
            store.remove_dlq_entry(&dlq, &entry.original_job_id).await?;
            retried += 1;
        }
        info!(dlq = %dlq, target = target_queue, retried, "DLQ retried");
        Ok(retried)
    }

    pub async fn dlq_entries(&self, queue: &str, limit: usize) -> Result<Vec<DlqEntry>, QueueError> {
        self.store()?.list_dlq(&dlq_name(queue), limit).await
    }

    /// Waiting/DLQ counts per queue, for the health surface.
    pub async fn counts(&self) -> Result<Vec<QueueCounts>, QueueError> {
        let store = self.store()?;
        let mut counts = Vec::with_capacity(QUEUE_NAMES.len());
        for queue in QUEUE_NAMES {
            counts.push(QueueCounts {
                queue: (*queue).to_owned(),
                waiting: store.queue_len(queue).await?,
                dlq: store.dlq_len(&dlq_name(queue)).await?,
            });
        }
        Ok(counts)
    }

    /// Age of the oldest due-but-unpicked job across all queues.
    pub async fn max_lag_ms(&self) -> Result<u64, QueueError> {
        let store = self.store()?;
        let now = Utc::now();
        let mut max_lag = 0;
        for queue in QUEUE_NAMES {
            if let Some(age) = store.oldest_ready_age_ms(queue, now).await? {
                max_lag = max_lag.max(age);
            }
        }
        Ok(max_lag)
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        self.store()?.ping().await
    }

    /// Spawns one worker per queue with the given handlers.
    pub fn spawn_workers(
        &self,
        handlers: HashMap<String, Arc<dyn JobHandler>>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        let store = self.store()?.clone();
        for (queue, handler) in handlers {
            let worker = Arc::new(Worker::new(
                queue.clone(),
                self.config.queue_config(&queue),
                store.clone(),
                handler,
                self.config.dlq_retention,
            ));
            tokio::spawn(worker.run(shutdown.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    fn queue_with_memory_store() -> JobQueue {
        JobQueue::new(Arc::new(InMemoryStore::new()), Config::default())
    }

    #[tokio::test]
    async fn test_enqueue_assigns_queue_defaults() {
        let queue = queue_with_memory_store();
        let outcome = queue
            .enqueue("fees", "receipt_email", json!({"payment": "p1"}), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(!outcome.duplicate);

        let job = queue
            .store()
            .unwrap()
            .get_job("fees", &outcome.job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn test_unknown_queue_is_rejected() {
        let queue = queue_with_memory_store();
        let result = queue
            .enqueue("nope", "x", json!({}), EnqueueOptions::default())
            .await;
        assert!(matches!(result, Err(QueueError::UnknownQueue(_))));
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_collapses() {
        let queue = queue_with_memory_store();
        let options = EnqueueOptions {
            idempotency_key: Some("k-1".into()),
            ..Default::default()
        };
        let first = queue
            .enqueue("notifications", "welcome", json!({"user": "u1"}), options.clone())
            .await
            .unwrap();
        let second = queue
            .enqueue("notifications", "welcome", json!({"user": "u1"}), options)
            .await
            .unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(
            queue.store().unwrap().queue_len("notifications").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_degraded_queue_fails_fast() {
        let queue = JobQueue {
            store: None,
            config: Config::default(),
        };
        assert!(!queue.is_available());
        let result = queue
            .enqueue("default", "x", json!({}), EnqueueOptions::default())
            .await;
        assert!(matches!(result, Err(QueueError::Unavailable)));
    }

    #[tokio::test]
    async fn test_retry_dlq_re_enqueues_and_clears() {
        struct FlakyThenFine;

        #[async_trait]
        impl JobHandler for FlakyThenFine {
            async fn handle(&self, _job: &Job) -> Result<(), anyhow::Error> {
                Ok(())
            }
        }

        let queue = queue_with_memory_store();
        let store = queue.store().unwrap().clone();

        // a job which already died
        let job = Job::new("notifications", "send_sms", json!({"to": "+10000000000"}));
        let entry = DlqEntry::from_job(&job, "provider down");
        store
            .push_dlq("dlq:notifications", &entry, 100)
            .await
            .unwrap();

        let retried = queue.retry_dlq("notifications", "notifications").await.unwrap();
        assert_eq!(retried, 1);
        assert_eq!(store.dlq_len("dlq:notifications").await.unwrap(), 0);

        // the replacement job processes cleanly
        let worker = Worker::new(
            "notifications",
            QueueConfig::default(),
            store.clone(),
            Arc::new(FlakyThenFine),
            100,
        );
        assert!(worker.tick().await.unwrap());

        // exactly one job, flagged with the original id
        let counts = queue.counts().await.unwrap();
        let notifications = counts
            .iter()
            .find(|count| count.queue == "notifications")
            .unwrap();
        assert_eq!(notifications.waiting, 0);
        assert_eq!(notifications.dlq, 0);
    }

    #[test]
    fn test_derived_key_is_deterministic_and_payload_sensitive() {
        let a = derive_idempotency_key("fees", "collect", &json!({"amount": "100.00"}));
        let b = derive_idempotency_key("fees", "collect", &json!({"amount": "100.00"}));
        let c = derive_idempotency_key("fees", "collect", &json!({"amount": "100.01"}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
