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

//! Redis backed [`QueueStore`].
//!
//! Layout (all keys under the `campus:` prefix):
//!
//! - `campus:job:<queue>:<id>` — job record as JSON
//! - `campus:q:<queue>:ready:<priority>` — FIFO list of due job ids
//! - `campus:q:<queue>:delayed` — zset of job ids scored by due time (ms)
//! - `campus:dlq:<name>` — list of DLQ entries as JSON, newest first
//! - `campus:idem:<key>` — idempotency key -> job id, 24h expiry

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
// `::` disambiguates the crate from this module
use ::redis::{aio::ConnectionManager, AsyncCommands};

use crate::{
    error::QueueError,
    job::{DlqEntry, Job, JobStatus},
    store::QueueStore,
};

/// Upper bound on priority levels the pop loop scans.
const MAX_PRIORITY_LEVELS: u8 = 8;

/// Completed/dead job records are kept around this long for inspection.
const FINISHED_JOB_TTL_SECS: u64 = 24 * 60 * 60;

/// How many due jobs one promotion sweep moves at most.
const PROMOTION_BATCH: isize = 128;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects eagerly; failure here is what flips the queue subsystem
    /// into the degraded mode.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = ::redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn job_key(queue: &str, job_id: &str) -> String {
        format!("campus:job:{queue}:{job_id}")
    }

    fn ready_key(queue: &str, priority: u8) -> String {
        format!("campus:q:{queue}:ready:{priority}")
    }

    fn delayed_key(queue: &str) -> String {
        format!("campus:q:{queue}:delayed")
    }

    fn dlq_key(dlq: &str) -> String {
        format!("campus:{dlq}")
    }

    fn idem_key(key: &str) -> String {
        format!("campus:idem:{key}")
    }

    async fn store_job(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let key = Self::job_key(&job.queue, &job.id);
        let encoded = serde_json::to_string(job)?;
        if matches!(job.status, JobStatus::Completed | JobStatus::Dead) {
            conn.set_ex::<_, _, ()>(key, encoded, FINISHED_JOB_TTL_SECS).await?;
        } else {
            conn.set::<_, _, ()>(key, encoded).await?;
        }
        Ok(())
    }

    async fn load_job(&self, queue: &str, job_id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let encoded: Option<String> = conn.get(Self::job_key(queue, job_id)).await?;
        encoded
            .map(|encoded| serde_json::from_str(&encoded).map_err(QueueError::from))
            .transpose()
    }

    /// Moves due members of the delayed zset into their ready list.
    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore_limit(
                Self::delayed_key(queue),
                f64::MIN,
                now.timestamp_millis() as f64,
                0,
                PROMOTION_BATCH,
            )
            .await?;
        for job_id in due {
            // only the sweep which removes the member owns the job
            let removed: i64 = conn.zrem(Self::delayed_key(queue), &job_id).await?;
            if removed == 0 {
                continue;
            }
            let priority = self
                .load_job(queue, &job_id)
                .await?
                .map(|job| job.priority)
                .unwrap_or(0);
            conn.rpush::<_, _, ()>(Self::ready_key(queue, priority), &job_id)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push_job(&self, job: &Job) -> Result<(), QueueError> {
        self.store_job(job).await?;
        let mut conn = self.conn.clone();
        if job.next_run_at <= Utc::now() {
            conn.rpush::<_, _, ()>(Self::ready_key(&job.queue, job.priority), &job.id)
                .await?;
        } else {
            conn.zadd::<_, _, _, ()>(
                Self::delayed_key(&job.queue),
                &job.id,
                job.next_run_at.timestamp_millis(),
            )
            .await?;
        }
        Ok(())
    }

    async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<Job>, QueueError> {
        self.load_job(queue, job_id).await
    }

    async fn update_job(&self, job: &Job) -> Result<(), QueueError> {
        self.store_job(job).await
    }

    async fn pop_ready(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        self.promote_due(queue, now).await?;

        let mut conn = self.conn.clone();
        for priority in (0..MAX_PRIORITY_LEVELS).rev() {
            let popped: Option<String> =
                conn.lpop(Self::ready_key(queue, priority), None).await?;
            let Some(job_id) = popped else {
                continue;
            };
            let Some(mut job) = self.load_job(queue, &job_id).await? else {
                // record expired under the id, drop the dangling entry
                continue;
            };
            job.status = JobStatus::Active;
            self.store_job(&job).await?;
            return Ok(Some(job));
        }
        Ok(None)
    }

    async fn push_delayed(&self, job: &Job) -> Result<(), QueueError> {
        self.store_job(job).await?;
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(
            Self::delayed_key(&job.queue),
            &job.id,
            job.next_run_at.timestamp_millis(),
        )
        .await?;
        Ok(())
    }

    async fn push_dlq(
        &self,
        dlq: &str,
        entry: &DlqEntry,
        retention: usize,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let encoded = serde_json::to_string(entry)?;
        conn.lpush::<_, _, ()>(Self::dlq_key(dlq), encoded).await?;
        conn.ltrim::<_, ()>(Self::dlq_key(dlq), 0, retention as isize - 1)
            .await?;
        Ok(())
    }

    async fn list_dlq(&self, dlq: &str, limit: usize) -> Result<Vec<DlqEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let encoded: Vec<String> = conn
            .lrange(Self::dlq_key(dlq), 0, limit as isize - 1)
            .await?;
        encoded
            .iter()
            .map(|entry| serde_json::from_str(entry).map_err(QueueError::from))
            .collect()
    }

    async fn remove_dlq_entry(
        &self,
        dlq: &str,
        original_job_id: &str,
    ) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let encoded: Vec<String> = conn.lrange(Self::dlq_key(dlq), 0, -1).await?;
        let mut removed = false;
        for entry in encoded {
            let matches = serde_json::from_str::<DlqEntry>(&entry)
                .map(|parsed| parsed.original_job_id == original_job_id)
                .unwrap_or(false);
            if matches {
                let count: i64 = conn.lrem(Self::dlq_key(dlq), 0, &entry).await?;
                removed |= count > 0;
            }
        }
        Ok(removed)
    }

    async fn dlq_len(&self, dlq: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.llen(Self::dlq_key(dlq)).await?;
        Ok(len.max(0) as usize)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut total: i64 = conn.zcard(Self::delayed_key(queue)).await?;
        for priority in 0..MAX_PRIORITY_LEVELS {
            let len: i64 = conn.llen(Self::ready_key(queue, priority)).await?;
            total += len;
        }
        Ok(total.max(0) as usize)
    }

    async fn oldest_ready_age_ms(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, QueueError> {
        let mut conn = self.conn.clone();
        let mut oldest: Option<DateTime<Utc>> = None;

        for priority in 0..MAX_PRIORITY_LEVELS {
            let head: Option<String> =
                conn.lindex(Self::ready_key(queue, priority), 0).await?;
            if let Some(job_id) = head {
                if let Some(job) = self.load_job(queue, &job_id).await? {
                    oldest = Some(oldest.map_or(job.next_run_at, |current| {
                        current.min(job.next_run_at)
                    }));
                }
            }
        }

        let due_head: Vec<(String, f64)> = conn
            .zrangebyscore_limit_withscores(
                Self::delayed_key(queue),
                f64::MIN,
                now.timestamp_millis() as f64,
                0,
                1,
            )
            .await?;
        if let Some((_, score)) = due_head.first() {
            let run_at = Utc
                .timestamp_millis_opt(*score as i64)
                .single()
                .unwrap_or(now);
            oldest = Some(oldest.map_or(run_at, |current| current.min(run_at)));
        }

        Ok(oldest.map(|run_at| (now - run_at).num_milliseconds().max(0) as u64))
    }

    async fn idempotency_put_if_absent(
        &self,
        key: &str,
        job_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let stored: Option<String> = ::redis::cmd("SET")
            .arg(Self::idem_key(key))
            .arg(job_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        if stored.is_some() {
            // SET NX returned OK, the key is ours
            Ok(None)
        } else {
            let existing: Option<String> = conn.get(Self::idem_key(key)).await?;
            Ok(existing)
        }
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
