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

//! Liveness, readiness and the queue/metrics surfaces.

use std::time::Instant;

use actix_web::{
    web::{self, Data, ServiceConfig},
    HttpResponse,
};
use serde_json::json;
use sysinfo::System;
use tracing::warn;

use crate::{
    app::AppState,
    observability::{
        metrics::{counters, histograms},
        redflags::{self, kinds, thresholds, Severity},
    },
};

pub(crate) fn configure_service(config: &mut ServiceConfig) {
    config
        .route("/health", web::get().to(liveness))
        .route("/health/ready", web::get().to(readiness))
        .route("/health/metrics", web::get().to(metrics))
        .route("/health/queues", web::get().to(queues));
}

/// Liveness: the process is up, no dependency checks.
async fn liveness() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub(crate) struct ReadinessProbe {
    pub(crate) database: bool,
    pub(crate) redis: bool,
    pub(crate) queues: bool,
    pub(crate) memory_used_percent: Option<f64>,
}

impl ReadinessProbe {
    /// `down` only when the database is gone; queue/redis outages
    /// degrade.
    pub(crate) fn status(&self) -> &'static str {
        if !self.database {
            "down"
        } else if !self.redis
            || !self.queues
            || self.memory_used_percent.map_or(false, |used| used > 90.0)
        {
            "degraded"
        } else {
            "ok"
        }
    }
}

pub(crate) async fn probe_readiness(state: &AppState) -> ReadinessProbe {
    let started = Instant::now();
    let database = sqlx::query("SELECT 1;")
        .execute(state.db.pool())
        .await
        .is_ok();
    state.metrics.record(
        histograms::DB_QUERY_LATENCY,
        started.elapsed().as_secs_f64() * 1000.0,
    );

    let started = Instant::now();
    let redis = match state.queue.ping().await {
        Ok(()) => {
            state.metrics.record(
                histograms::REDIS_LATENCY,
                started.elapsed().as_secs_f64() * 1000.0,
            );
            true
        }
        Err(ping_error) => {
            state.metrics.increment(counters::REDIS_DISCONNECTS);
            warn!(%ping_error, "redis ping failed");
            false
        }
    };

    let mut system = System::new();
    system.refresh_memory();
    let memory_used_percent = (system.total_memory() > 0)
        .then(|| system.used_memory() as f64 / system.total_memory() as f64 * 100.0);

    ReadinessProbe {
        database,
        redis,
        queues: state.queue.is_available() && redis,
        memory_used_percent,
    }
}

async fn readiness(state: Data<AppState>) -> HttpResponse {
    let probe = probe_readiness(&state).await;
    let status = probe.status();
    let body = json!({
        "status": status,
        "checks": {
            "database": if probe.database { "ok" } else { "down" },
            "redis": if probe.redis { "ok" } else { "down" },
            "queues": { "status": if probe.queues { "ok" } else { "unavailable" } },
            "memory_used_percent": probe.memory_used_percent,
        },
    });
    if status == "down" {
        HttpResponse::ServiceUnavailable().json(body)
    } else {
        HttpResponse::Ok().json(body)
    }
}

async fn metrics(state: Data<AppState>) -> HttpResponse {
    redflags::evaluate_thresholds(&state.metrics, &state.red_flags);
    HttpResponse::Ok().json(state.metrics.snapshot_json())
}

async fn queues(state: Data<AppState>) -> HttpResponse {
    match state.queue.counts().await {
        Ok(counts) => {
            let dlq_total: usize = counts.iter().map(|count| count.dlq).sum();
            let lag_ms = state.queue.max_lag_ms().await.unwrap_or(0);
            state.metrics.record(histograms::QUEUE_LAG, lag_ms as f64);

            if dlq_total as u64 > thresholds::DLQ_SIZE {
                state.red_flags.raise(
                    kinds::DLQ_BACKLOG,
                    Severity::P1,
                    format!("{dlq_total} jobs across the DLQs"),
                    None,
                    Some(dlq_total as f64),
                    Some(thresholds::DLQ_SIZE as f64),
                );
            }
            if lag_ms as f64 > thresholds::QUEUE_LAG_MS {
                state.red_flags.raise(
                    kinds::QUEUE_LAG_HIGH,
                    Severity::P1,
                    format!("oldest ready job is {lag_ms}ms behind"),
                    None,
                    Some(lag_ms as f64),
                    Some(thresholds::QUEUE_LAG_MS),
                );
            }

            HttpResponse::Ok().json(json!({
                "status": "ok",
                "queues": counts,
                "dlqCount": dlq_total,
                "lagMs": lag_ms,
            }))
        }
        Err(_) => HttpResponse::Ok().json(json!({
            "status": "unavailable",
            "queues": [],
            "dlqCount": 0,
        })),
    }
}
