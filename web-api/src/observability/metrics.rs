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

//! In-process metrics.
//!
//! Histograms keep a rolling window of the last 1000 samples and
//! expose min/avg/p50/p95/p99; counters additionally track per-minute
//! buckets for the last 60 minutes. The registry is constructed once
//! at startup and handed around via app state, never a global.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

pub(crate) mod histograms {
    pub(crate) const AUTH_LATENCY: &str = "auth.latency";
    pub(crate) const DB_QUERY_LATENCY: &str = "db.query_latency";
    pub(crate) const RBAC_RESOLUTION_LATENCY: &str = "rbac.resolution_latency";
    pub(crate) const REDIS_LATENCY: &str = "redis.latency";
    pub(crate) const QUEUE_LAG: &str = "queue.lag";
    pub(crate) const HTTP_REQUEST_LATENCY: &str = "http.request_latency";
}

pub(crate) mod counters {
    pub(crate) const AUTH_LOGIN_FAILURES: &str = "auth.login_failures";
    pub(crate) const DB_SLOW_QUERIES: &str = "db.slow_queries";
    pub(crate) const RBAC_DENY_COUNT: &str = "rbac.deny_count";
    pub(crate) const REDIS_DISCONNECTS: &str = "redis.disconnects";
    pub(crate) const QUEUE_DLQ_COUNT: &str = "queue.dlq_count";
    pub(crate) const HTTP_ERROR_COUNT: &str = "http.error_count";
}

const HISTOGRAM_WINDOW: usize = 1000;
const COUNTER_MINUTES: usize = 60;

#[derive(Clone, Copy, Debug, Serialize)]
pub(crate) struct HistogramSnapshot {
    pub(crate) count: usize,
    pub(crate) min: f64,
    pub(crate) avg: f64,
    pub(crate) p50: f64,
    pub(crate) p95: f64,
    pub(crate) p99: f64,
}

#[derive(Default)]
struct Histogram {
    samples: Mutex<VecDeque<f64>>,
}

impl Histogram {
    fn record(&self, value: f64) {
        let mut samples = self.samples.lock();
        if samples.len() == HISTOGRAM_WINDOW {
            samples.pop_front();
        }
        samples.push_back(value);
    }

    fn snapshot(&self) -> Option<HistogramSnapshot> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.iter().copied().collect::<Vec<_>>();
        sorted.sort_unstable_by(|a, b| a.total_cmp(b));
        let count = sorted.len();
        let sum = sorted.iter().sum::<f64>();
        Some(HistogramSnapshot {
            count,
            min: sorted[0],
            avg: sum / count as f64,
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
        })
    }
}

fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    let index = ((sorted.len() as f64 - 1.0) * quantile).round() as usize;
    sorted[index.min(sorted.len() - 1)]
}

#[derive(Default)]
struct Counter {
    total: AtomicU64,
    // (minute-of-epoch, count) pairs, newest last
    buckets: Mutex<VecDeque<(u64, u64)>>,
}

impl Counter {
    fn increment_by(&self, amount: u64) {
        self.total.fetch_add(amount, Ordering::Relaxed);
        let minute = epoch_minute();
        let mut buckets = self.buckets.lock();
        match buckets.back_mut() {
            Some((bucket_minute, count)) if *bucket_minute == minute => *count += amount,
            _ => {
                buckets.push_back((minute, amount));
                while buckets.len() > COUNTER_MINUTES {
                    buckets.pop_front();
                }
            }
        }
    }

    fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Count recorded within the most recent full minute window.
    fn last_minute(&self) -> u64 {
        let minute = epoch_minute();
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .rev()
            .take_while(|(bucket_minute, _)| minute.saturating_sub(*bucket_minute) <= 1)
            .map(|(_, count)| count)
            .sum()
    }

    fn per_minute(&self) -> Vec<(u64, u64)> {
        self.buckets.lock().iter().copied().collect()
    }
}

fn epoch_minute() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() / 60)
        .unwrap_or(0)
}

#[derive(Clone)]
pub(crate) struct MetricsRegistry {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    histograms: DashMap<&'static str, Histogram>,
    counters: DashMap<&'static str, Counter>,
}

impl MetricsRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
        }
    }

    pub(crate) fn record(&self, name: &'static str, value: f64) {
        self.inner
            .histograms
            .entry(name)
            .or_default()
            .record(value);
    }

    pub(crate) fn increment(&self, name: &'static str) {
        self.increment_by(name, 1);
    }

    pub(crate) fn increment_by(&self, name: &'static str, amount: u64) {
        self.inner
            .counters
            .entry(name)
            .or_default()
            .increment_by(amount);
    }

    pub(crate) fn histogram_snapshot(&self, name: &str) -> Option<HistogramSnapshot> {
        self.inner
            .histograms
            .get(name)
            .and_then(|histogram| histogram.snapshot())
    }

    pub(crate) fn counter_total(&self, name: &str) -> u64 {
        self.inner
            .counters
            .get(name)
            .map(|counter| counter.total())
            .unwrap_or(0)
    }

    pub(crate) fn counter_last_minute(&self, name: &str) -> u64 {
        self.inner
            .counters
            .get(name)
            .map(|counter| counter.last_minute())
            .unwrap_or(0)
    }

    pub(crate) fn snapshot_json(&self) -> serde_json::Value {
        let histograms = self
            .inner
            .histograms
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .snapshot()
                    .map(|snapshot| (entry.key().to_string(), json!(snapshot)))
            })
            .collect::<serde_json::Map<_, _>>();
        let counters = self
            .inner
            .counters
            .iter()
            .map(|entry| {
                (
                    entry.key().to_string(),
                    json!({
                        "total": entry.value().total(),
                        "last_minute": entry.value().last_minute(),
                        "per_minute": entry.value().per_minute(),
                    }),
                )
            })
            .collect::<serde_json::Map<_, _>>();
        json!({ "histograms": histograms, "counters": counters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_window_is_bounded() {
        let registry = MetricsRegistry::new();
        for index in 0..2000 {
            registry.record(histograms::HTTP_REQUEST_LATENCY, index as f64);
        }
        let snapshot = registry
            .histogram_snapshot(histograms::HTTP_REQUEST_LATENCY)
            .unwrap();
        assert_eq!(snapshot.count, 1000);
        // only the most recent window survives
        assert_eq!(snapshot.min, 1000.0);
    }

    #[test]
    fn test_histogram_percentiles_are_ordered() {
        let registry = MetricsRegistry::new();
        for value in [1.0, 2.0, 5.0, 8.0, 100.0, 12.0, 7.0, 3.0] {
            registry.record(histograms::DB_QUERY_LATENCY, value);
        }
        let snapshot = registry
            .histogram_snapshot(histograms::DB_QUERY_LATENCY)
            .unwrap();
        assert!(snapshot.min <= snapshot.p50);
        assert!(snapshot.p50 <= snapshot.p95);
        assert!(snapshot.p95 <= snapshot.p99);
        assert_eq!(snapshot.min, 1.0);
        assert_eq!(snapshot.p99, 100.0);
    }

    #[test]
    fn test_counter_tracks_total_and_recent() {
        let registry = MetricsRegistry::new();
        for _ in 0..25 {
            registry.increment(counters::AUTH_LOGIN_FAILURES);
        }
        assert_eq!(registry.counter_total(counters::AUTH_LOGIN_FAILURES), 25);
        assert!(registry.counter_last_minute(counters::AUTH_LOGIN_FAILURES) >= 25);
        assert_eq!(registry.counter_total("unknown"), 0);
    }
}
