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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-job lifecycle state.
///
/// ```text
/// waiting ──start──▶ active ──ok──▶ completed
///             │        └─fail, attempts < max──▶ waiting (delayed)
///             │        └─fail, attempts = max──▶ dead ──move──▶ DLQ
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Dead,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub payload: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub priority: u8,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_failed_at: Option<DateTime<Utc>>,
    /// Set when the job was re-enqueued out of a DLQ; holds the
    /// original job id.
    #[serde(default, rename = "_retried_from_dlq")]
    pub retried_from_dlq: Option<String>,
}

impl Job {
    pub fn new(queue: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.into(),
            name: name.into(),
            payload,
            idempotency_key: None,
            tenant_id: None,
            attempts_made: 0,
            max_attempts: 3,
            priority: 0,
            next_run_at: now,
            created_at: now,
            status: JobStatus::Waiting,
            last_error: None,
            last_failed_at: None,
            retried_from_dlq: None,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

/// Entry stored on a paired dead-letter queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DlqEntry {
    pub original_queue: String,
    pub original_job_id: String,
    pub original_name: String,
    pub original_payload: Value,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
    pub attempts_made: u32,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl DlqEntry {
    pub fn from_job(job: &Job, failure_reason: impl Into<String>) -> Self {
        Self {
            original_queue: job.queue.clone(),
            original_job_id: job.id.clone(),
            original_name: job.name.clone(),
            original_payload: job.payload.clone(),
            failure_reason: failure_reason.into(),
            failed_at: Utc::now(),
            attempts_made: job.attempts_made,
            idempotency_key: job.idempotency_key.clone(),
            tenant_id: job.tenant_id.clone(),
        }
    }
}

/// Retry delay strategy.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { base_delay_ms: u64 },
    Exponential { base_delay_ms: u64 },
}

impl Backoff {
    /// Delay before the next attempt, given the attempts already made.
    ///
    /// `attempts_made` is at least 1 when this is called (a failure
    /// happened).
    pub fn delay_ms(&self, attempts_made: u32) -> u64 {
        match *self {
            Backoff::Fixed { base_delay_ms } => {
                base_delay_ms.saturating_mul(u64::from(attempts_made))
            }
            Backoff::Exponential { base_delay_ms } => base_delay_ms
                .saturating_mul(1_u64.checked_shl(attempts_made.saturating_sub(1)).unwrap_or(u64::MAX)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_fixed_backoff_grows_linearly() {
        let backoff = Backoff::Fixed { base_delay_ms: 500 };
        assert_eq!(backoff.delay_ms(1), 500);
        assert_eq!(backoff.delay_ms(2), 1000);
        assert_eq!(backoff.delay_ms(3), 1500);
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let backoff = Backoff::Exponential { base_delay_ms: 250 };
        assert_eq!(backoff.delay_ms(1), 250);
        assert_eq!(backoff.delay_ms(2), 500);
        assert_eq!(backoff.delay_ms(3), 1000);
        assert_eq!(backoff.delay_ms(4), 2000);
    }

    #[test]
    fn test_exponential_backoff_saturates() {
        let backoff = Backoff::Exponential {
            base_delay_ms: u64::MAX / 2,
        };
        // must not overflow or panic
        let _ = backoff.delay_ms(64);
        let _ = backoff.delay_ms(200);
    }

    #[test]
    fn test_dlq_entry_carries_job_identity() {
        let mut job = Job::new("notifications", "send_email", json!({"to": "u@school.com"}));
        job.attempts_made = 3;
        job.idempotency_key = Some("k1".into());
        let entry = DlqEntry::from_job(&job, "smtp down");
        assert_eq!(entry.original_job_id, job.id);
        assert_eq!(entry.original_queue, "notifications");
        assert_eq!(entry.attempts_made, 3);
        assert_eq!(entry.idempotency_key.as_deref(), Some("k1"));
        assert_eq!(entry.original_payload, job.payload);
    }

    #[test]
    fn test_job_serde_roundtrip_preserves_payload() {
        let job = Job::new("reports", "monthly", json!({"month": 4, "sections": ["a", "b"]}));
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.payload, job.payload);
        assert_eq!(decoded.status, JobStatus::Waiting);
    }
}
