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

//! Operator-facing red flags.
//!
//! Flags are deduplicated by `kind:tenant_or_global` within a 5 minute
//! TTL; the expiry sweep runs opportunistically on every read.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{error, warn};
use campus_web_api_shared::request::TenantId;

use crate::observability::metrics::{counters, histograms, MetricsRegistry};

pub(crate) mod kinds {
    pub(crate) const LOGIN_FAILURE_SPIKE: &str = "LOGIN_FAILURE_SPIKE";
    pub(crate) const RBAC_DENY_SPIKE: &str = "RBAC_DENY_SPIKE";
    pub(crate) const DB_LATENCY_HIGH: &str = "DB_LATENCY_HIGH";
    pub(crate) const REDIS_LATENCY_HIGH: &str = "REDIS_LATENCY_HIGH";
    pub(crate) const QUEUE_LAG_HIGH: &str = "QUEUE_LAG_HIGH";
    pub(crate) const DLQ_BACKLOG: &str = "DLQ_BACKLOG";
    pub(crate) const TENANT_ISOLATION_MISMATCH: &str = "TENANT_ISOLATION_MISMATCH";
}

pub(crate) mod thresholds {
    pub(crate) const LOGIN_FAILURES_PER_MINUTE: u64 = 20;
    pub(crate) const RBAC_DENIES_PER_MINUTE: u64 = 50;
    pub(crate) const DB_P95_MS: f64 = 1000.0;
    pub(crate) const REDIS_P95_MS: f64 = 200.0;
    pub(crate) const QUEUE_LAG_MS: f64 = 30_000.0;
    pub(crate) const DLQ_SIZE: u64 = 10;
}

const FLAG_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub(crate) enum Severity {
    P2,
    P1,
    P0,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct RedFlag {
    pub(crate) id: String,
    pub(crate) kind: String,
    pub(crate) severity: Severity,
    pub(crate) message: String,
    pub(crate) value: Option<f64>,
    pub(crate) threshold: Option<f64>,
    pub(crate) detected_at: DateTime<Utc>,
    pub(crate) tenant_id: Option<String>,
}

#[derive(Clone)]
pub(crate) struct RedFlagRegistry {
    flags: Arc<DashMap<String, RedFlag>>,
}

impl RedFlagRegistry {
    pub(crate) fn new() -> Self {
        Self {
            flags: Arc::new(DashMap::new()),
        }
    }

    /// Raises a flag; re-raising within the TTL is suppressed.
    ///
    /// Returns true when the flag was newly raised.
    pub(crate) fn raise(
        &self,
        kind: &str,
        severity: Severity,
        message: impl Into<String>,
        tenant_id: Option<&TenantId>,
        value: Option<f64>,
        threshold: Option<f64>,
    ) -> bool {
        self.sweep();
        let scope = tenant_id.map_or_else(|| "global".to_owned(), ToString::to_string);
        let id = format!("{kind}:{scope}");
        if self.flags.contains_key(&id) {
            return false;
        }
        let flag = RedFlag {
            id: id.clone(),
            kind: kind.to_owned(),
            severity,
            message: message.into(),
            value,
            threshold,
            detected_at: Utc::now(),
            tenant_id: tenant_id.map(ToString::to_string),
        };
        match severity {
            Severity::P0 => error!(flag.kind = kind, flag.message = %flag.message, "P0 red flag raised"),
            _ => warn!(flag.kind = kind, flag.message = %flag.message, ?severity, "red flag raised"),
        }
        self.flags.insert(id, flag);
        true
    }

    pub(crate) fn active(&self) -> Vec<RedFlag> {
        self.sweep();
        let mut flags = self
            .flags
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();
        flags.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.id.cmp(&b.id)));
        flags
    }

    pub(crate) fn has_p0(&self) -> bool {
        self.sweep();
        self.flags
            .iter()
            .any(|entry| entry.value().severity == Severity::P0)
    }

    fn sweep(&self) {
        let now = Utc::now();
        self.flags.retain(|_, flag| {
            (now - flag.detected_at).to_std().unwrap_or_default() < FLAG_TTL
        });
    }
}

/// Evaluates the metric-derived thresholds.
///
/// Queue-derived signals (lag, DLQ sizes) are recorded by the health
/// surface before it calls this.
pub(crate) fn evaluate_thresholds(metrics: &MetricsRegistry, flags: &RedFlagRegistry) {
    let login_failures = metrics.counter_last_minute(counters::AUTH_LOGIN_FAILURES);
    if login_failures >= thresholds::LOGIN_FAILURES_PER_MINUTE {
        flags.raise(
            kinds::LOGIN_FAILURE_SPIKE,
            Severity::P0,
            format!("{login_failures} login failures within the last minute"),
            None,
            Some(login_failures as f64),
            Some(thresholds::LOGIN_FAILURES_PER_MINUTE as f64),
        );
    }

    let denies = metrics.counter_last_minute(counters::RBAC_DENY_COUNT);
    if denies >= thresholds::RBAC_DENIES_PER_MINUTE {
        flags.raise(
            kinds::RBAC_DENY_SPIKE,
            Severity::P1,
            format!("{denies} RBAC denials within the last minute"),
            None,
            Some(denies as f64),
            Some(thresholds::RBAC_DENIES_PER_MINUTE as f64),
        );
    }

    if let Some(db) = metrics.histogram_snapshot(histograms::DB_QUERY_LATENCY) {
        if db.p95 > thresholds::DB_P95_MS {
            flags.raise(
                kinds::DB_LATENCY_HIGH,
                Severity::P0,
                format!("db query p95 at {:.0}ms", db.p95),
                None,
                Some(db.p95),
                Some(thresholds::DB_P95_MS),
            );
        }
    }

    if let Some(redis) = metrics.histogram_snapshot(histograms::REDIS_LATENCY) {
        if redis.p95 > thresholds::REDIS_P95_MS {
            flags.raise(
                kinds::REDIS_LATENCY_HIGH,
                Severity::P1,
                format!("redis p95 at {:.0}ms", redis.p95),
                None,
                Some(redis.p95),
                Some(thresholds::REDIS_P95_MS),
            );
        }
    }

    if let Some(lag) = metrics.histogram_snapshot(histograms::QUEUE_LAG) {
        if lag.p95 > thresholds::QUEUE_LAG_MS {
            flags.raise(
                kinds::QUEUE_LAG_HIGH,
                Severity::P1,
                format!("queue lag p95 at {:.0}ms", lag.p95),
                None,
                Some(lag.p95),
                Some(thresholds::QUEUE_LAG_MS),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raising_twice_within_ttl_is_suppressed() {
        let registry = RedFlagRegistry::new();
        assert!(registry.raise(
            kinds::LOGIN_FAILURE_SPIKE,
            Severity::P0,
            "spike",
            None,
            Some(25.0),
            Some(20.0),
        ));
        assert!(!registry.raise(
            kinds::LOGIN_FAILURE_SPIKE,
            Severity::P0,
            "spike again",
            None,
            Some(30.0),
            Some(20.0),
        ));
        assert_eq!(registry.active().len(), 1);
        assert!(registry.has_p0());
    }

    #[test]
    fn test_tenant_scoped_flags_do_not_collide() {
        let registry = RedFlagRegistry::new();
        let tenant_a = "tenant-a".parse::<TenantId>().unwrap();
        let tenant_b = "tenant-b".parse::<TenantId>().unwrap();
        assert!(registry.raise(
            kinds::TENANT_ISOLATION_MISMATCH,
            Severity::P0,
            "mismatch",
            Some(&tenant_a),
            None,
            None,
        ));
        assert!(registry.raise(
            kinds::TENANT_ISOLATION_MISMATCH,
            Severity::P0,
            "mismatch",
            Some(&tenant_b),
            None,
            None,
        ));
        assert_eq!(registry.active().len(), 2);
    }

    #[test]
    fn test_threshold_evaluation_raises_login_spike() {
        let metrics = MetricsRegistry::new();
        let flags = RedFlagRegistry::new();
        for _ in 0..25 {
            metrics.increment(counters::AUTH_LOGIN_FAILURES);
        }
        evaluate_thresholds(&metrics, &flags);
        let active = flags.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, kinds::LOGIN_FAILURE_SPIKE);
        assert_eq!(active[0].severity, Severity::P0);
    }

    #[test]
    fn test_severity_ordering_puts_p0_first() {
        let registry = RedFlagRegistry::new();
        registry.raise(kinds::DLQ_BACKLOG, Severity::P1, "dlq", None, None, None);
        registry.raise(
            kinds::DB_LATENCY_HIGH,
            Severity::P0,
            "db",
            None,
            None,
            None,
        );
        let active = registry.active();
        assert_eq!(active[0].severity, Severity::P0);
    }
}
