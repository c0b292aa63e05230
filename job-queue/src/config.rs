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

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::job::Backoff;

/// Per-queue execution knobs.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Jobs processed in parallel per worker.
    pub concurrency: usize,
    /// Attempts before a job moves to the DLQ.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Hard per-job deadline.
    pub job_timeout_ms: u64,
    /// Number of priority levels (0..levels, higher drains first).
    pub priority_levels: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base_delay_ms: 1000,
            },
            job_timeout_ms: 30_000,
            priority_levels: 3,
        }
    }
}

/// Configuration of the whole queue subsystem.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Redis connection url; empty disables the backend (degraded mode).
    pub url: String,
    /// Entries kept per DLQ for operator inspection.
    pub dlq_retention: usize,
    /// Idempotency key lifetime in hours.
    pub idempotency_ttl_hours: u64,
    /// Overrides per queue; unlisted queues use the defaults.
    pub queues: HashMap<String, QueueConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".into(),
            dlq_retention: 10_000,
            idempotency_ttl_hours: 24,
            queues: HashMap::new(),
        }
    }
}

impl Config {
    pub fn queue_config(&self, queue: &str) -> QueueConfig {
        self.queues.get(queue).copied().unwrap_or_default()
    }
}
