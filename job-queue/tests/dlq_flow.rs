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

//! End-to-end flow over the in-memory backend: a job exhausts its
//! attempts, lands in the DLQ, gets retried and finally completes.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use serde_json::json;

use campus_job_queue::{
    Backoff,
    Config,
    EnqueueOptions,
    InMemoryStore,
    Job,
    JobHandler,
    JobQueue,
    JobStatus,
    QueueConfig,
    QueueStore,
    Worker,
};

/// Fails until `healthy` flips, then succeeds.
struct FlakyProvider {
    healthy: AtomicBool,
}

#[async_trait]
impl JobHandler for FlakyProvider {
    async fn handle(&self, _job: &Job) -> Result<(), anyhow::Error> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            anyhow::bail!("smtp relay unreachable")
        }
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.queues.insert(
        "notifications".into(),
        QueueConfig {
            concurrency: 1,
            max_attempts: 3,
            backoff: Backoff::Fixed { base_delay_ms: 0 },
            job_timeout_ms: 1000,
            priority_levels: 3,
        },
    );
    config
}

#[tokio::test]
async fn job_exhausts_into_dlq_and_retries_to_completion() {
    let store = Arc::new(InMemoryStore::new());
    let config = test_config();
    let queue = JobQueue::new(store.clone(), config.clone());

    let handler = Arc::new(FlakyProvider {
        healthy: AtomicBool::new(false),
    });
    let worker = Worker::new(
        "notifications",
        config.queue_config("notifications"),
        store.clone(),
        handler.clone(),
        config.dlq_retention,
    );

    let outcome = queue
        .enqueue(
            "notifications",
            "absence_alert",
            json!({"student": "ADM001", "date": "2024-04-01"}),
            EnqueueOptions {
                idempotency_key: Some("absence:ADM001:2024-04-01".into()),
                tenant_id: Some("green-valley".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!outcome.duplicate);

    // exhaust all three attempts against the broken provider
    for _ in 0..3 {
        assert!(worker.tick().await.unwrap());
    }
    assert!(!worker.tick().await.unwrap());

    let entries = queue.dlq_entries("notifications", 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].original_job_id, outcome.job_id);
    assert_eq!(entries[0].attempts_made, 3);
    assert_eq!(
        entries[0].idempotency_key.as_deref(),
        Some("absence:ADM001:2024-04-01")
    );

    let dead = store
        .get_job("notifications", &outcome.job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dead.status, JobStatus::Dead);

    let counts = queue.counts().await.unwrap();
    let notifications = counts
        .iter()
        .find(|count| count.queue == "notifications")
        .unwrap();
    assert_eq!(notifications.dlq, 1);

    // provider recovers, DLQ is replayed
    handler.healthy.store(true, Ordering::SeqCst);
    let retried = queue
        .retry_dlq("notifications", "notifications")
        .await
        .unwrap();
    assert_eq!(retried, 1);
    assert!(queue.dlq_entries("notifications", 10).await.unwrap().is_empty());

    assert!(worker.tick().await.unwrap());
    assert!(!worker.tick().await.unwrap());

    let counts = queue.counts().await.unwrap();
    let notifications = counts
        .iter()
        .find(|count| count.queue == "notifications")
        .unwrap();
    assert_eq!(notifications.waiting, 0);
    assert_eq!(notifications.dlq, 0);
}

#[tokio::test]
async fn retried_job_keeps_payload_and_original_id() {
    let store = Arc::new(InMemoryStore::new());
    let config = test_config();
    let queue = JobQueue::new(store.clone(), config.clone());

    let payload = json!({"fee": "RCP-2024-00042"});
    let outcome = queue
        .enqueue("notifications", "receipt", payload.clone(), EnqueueOptions::default())
        .await
        .unwrap();

    // force it straight into the DLQ
    let broken = Worker::new(
        "notifications",
        config.queue_config("notifications"),
        store.clone(),
        Arc::new(FlakyProvider {
            healthy: AtomicBool::new(false),
        }),
        config.dlq_retention,
    );
    for _ in 0..3 {
        broken.tick().await.unwrap();
    }

    queue
        .retry_dlq("notifications", "notifications")
        .await
        .unwrap();

    let replacement = store
        .pop_ready("notifications", chrono::Utc::now())
        .await
        .unwrap()
        .expect("replacement job enqueued");
    assert_eq!(replacement.payload, payload);
    assert_eq!(replacement.retried_from_dlq.as_deref(), Some(outcome.job_id.as_str()));
    assert_eq!(replacement.attempts_made, 0);
}
