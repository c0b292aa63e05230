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

//! The go-live gate: automated onboarding checklist and the pilot
//! guardrails.

use std::time::Instant;

use actix_web::{
    web::{self, Data, Path, ServiceConfig},
    HttpResponse,
};
use serde::Serialize;
use serde_json::json;
use campus_web_api_db_ctrl::provision;
use campus_web_api_shared::postgres::SchemaName;

use crate::{
    app::AppState,
    auth::store as auth_store,
    observability::{
        health::probe_readiness,
        redflags::{evaluate_thresholds, Severity},
    },
    response,
    Error,
};

pub(crate) fn configure_service(config: &mut ServiceConfig) {
    config.service(
        web::scope("/health/golive")
            .route("", web::get().to(dashboard))
            .route("/alerts", web::get().to(alerts))
            .route("/pilot", web::get().to(pilot))
            .route("/tenant/{schema}", web::get().to(tenant_readiness)),
    );
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
enum Light {
    Green,
    Yellow,
    Red,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
enum Verdict {
    Approved,
    Conditional,
    Blocked,
}

#[derive(Debug, Serialize)]
struct Check {
    name: &'static str,
    ok: bool,
    critical: bool,
    detail: String,
}

#[derive(Debug, Serialize)]
struct GoLiveReport {
    status: Light,
    verdict: Verdict,
    checks: Vec<Check>,
}

async fn build_report(state: &AppState) -> GoLiveReport {
    let mut checks = Vec::new();

    checks.push(Check {
        name: "server_up",
        ok: true,
        critical: true,
        detail: format!("uptime {}s", state.started_at.elapsed().as_secs()),
    });

    let probe = probe_readiness(state).await;
    let detail = |ok: bool, yes: &str, no: &str| {
        if ok { yes.to_owned() } else { no.to_owned() }
    };
    checks.push(Check {
        name: "database_connected",
        ok: probe.database,
        critical: true,
        detail: detail(probe.database, "connected", "unreachable"),
    });
    checks.push(Check {
        name: "redis_connected",
        ok: probe.redis,
        critical: false,
        detail: detail(probe.redis, "connected", "unreachable"),
    });
    checks.push(Check {
        name: "queues_available",
        ok: probe.queues,
        critical: false,
        detail: detail(probe.queues, "available", "degraded"),
    });

    evaluate_thresholds(&state.metrics, &state.red_flags);
    let p0_count = state
        .red_flags
        .active()
        .iter()
        .filter(|flag| flag.severity == Severity::P0)
        .count();
    checks.push(Check {
        name: "no_p0_alerts",
        ok: p0_count == 0,
        critical: true,
        detail: format!("{p0_count} active P0 alerts"),
    });

    let pilot = &state.config.pilot;
    if pilot.enabled {
        let tenant_count = sqlx::query_as::<_, (i64,)>(
            "SELECT count(*) FROM management.tenant WHERE status <> 'suspended';",
        )
        .fetch_one(state.db.pool())
        .await
        .map(|(count,)| count)
        .unwrap_or(-1);
        let within_cap = tenant_count >= 0 && tenant_count <= i64::from(pilot.max_schools);
        checks.push(Check {
            name: "pilot_school_cap",
            ok: within_cap,
            critical: true,
            detail: format!("{tenant_count} of {} allowed schools", pilot.max_schools),
        });
        checks.push(Check {
            name: "pilot_rbac_shadow",
            ok: state.config.rbac.strict_log,
            critical: false,
            detail: "pilot forces RBAC strict-log mode".into(),
        });
    }

    // quick burst probe: 10 round trips, p95 under 500ms passes
    let mut latencies = Vec::with_capacity(10);
    for _ in 0..10 {
        let started = Instant::now();
        let ok = sqlx::query("SELECT 1;")
            .execute(state.db.pool())
            .await
            .is_ok();
        if ok {
            latencies.push(started.elapsed().as_secs_f64() * 1000.0);
        }
    }
    latencies.sort_unstable_by(|a, b| a.total_cmp(b));
    let p95 = latencies
        .get(((latencies.len() as f64 * 0.95) as usize).min(latencies.len().saturating_sub(1)))
        .copied();
    let burst_ok = latencies.len() == 10 && p95.map_or(false, |p95| p95 < 500.0);
    checks.push(Check {
        name: "burst_latency",
        ok: burst_ok,
        critical: false,
        detail: p95.map_or("probe failed".into(), |p95| format!("p95 {p95:.1}ms")),
    });

    let critical_failure = checks.iter().any(|check| check.critical && !check.ok);
    let warnings = checks.iter().any(|check| !check.critical && !check.ok);
    let (status, verdict) = if critical_failure {
        (Light::Red, Verdict::Blocked)
    } else if warnings {
        (Light::Yellow, Verdict::Conditional)
    } else {
        (Light::Green, Verdict::Approved)
    };

    GoLiveReport {
        status,
        verdict,
        checks,
    }
}

async fn dashboard(state: Data<AppState>) -> HttpResponse {
    let report = build_report(&state).await;
    if report.status == Light::Red {
        HttpResponse::ServiceUnavailable().json(report)
    } else {
        HttpResponse::Ok().json(report)
    }
}

async fn alerts(state: Data<AppState>) -> HttpResponse {
    evaluate_thresholds(&state.metrics, &state.red_flags);
    let flags = state.red_flags.active();
    let by_severity = |severity: Severity| {
        flags
            .iter()
            .filter(|flag| flag.severity == severity)
            .collect::<Vec<_>>()
    };
    HttpResponse::Ok().json(json!({
        "p0": by_severity(Severity::P0),
        "p1": by_severity(Severity::P1),
        "p2": by_severity(Severity::P2),
    }))
}

async fn pilot(state: Data<AppState>) -> HttpResponse {
    let pilot = &state.config.pilot;
    HttpResponse::Ok().json(json!({
        "enabled": pilot.enabled,
        "maxSchools": pilot.max_schools,
        "maxImportRows": pilot.max_import_rows,
        "rbacStrictLog": state.config.rbac.strict_log,
    }))
}

/// Per-tenant preflight: provisioned schema and at least one active
/// admin.
async fn tenant_readiness(
    state: Data<AppState>,
    path: Path<String>,
) -> Result<HttpResponse, Error> {
    let schema = path
        .into_inner()
        .parse::<SchemaName>()
        .map_err(|error| crate::error::common::BadRequest::from(error.to_string()))?;

    let mut conn = state.db.pool().acquire().await?;
    let verify = provision::verify(&mut conn, &schema).await?;
    drop(conn);

    let admin_count = if verify.critical_set_complete {
        let db = state.db.build_for(&schema);
        auth_store::count_active_admins(&db).await.unwrap_or(0)
    } else {
        0
    };

    Ok(response::ok(json!({
        "schema": verify.schema,
        "tableCount": verify.table_count,
        "missingCritical": verify.missing_critical,
        "adminCount": admin_count,
        "provisioned": verify.critical_set_complete,
        "readyForLive": verify.ready_for_live && admin_count >= 1,
    })))
}
