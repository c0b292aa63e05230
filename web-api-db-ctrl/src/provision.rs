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

//! The idempotent provisioning pipeline.
//!
//! Ordering is load-bearing: schema, tables (dependency order),
//! structural migrations, seeds, verification. Per-table failures do
//! not abort the remaining tables; a later `provision()` call resumes
//! from whatever state the schema is in.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use sqlx::{Connection, Executor, PgConnection, Pool, Postgres};
use tracing::{error, info, instrument, warn};

use campus_web_api_shared::postgres::SchemaName;

use crate::{
    blueprint::{CRITICAL_TABLES, MIN_READY_TABLE_COUNT, TENANT_TABLES},
    migrations::{self, MigrationOutcome},
    seed,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub success: bool,
    pub schema: String,
    pub table_count: usize,
    pub tables_created: usize,
    pub seed_rows_inserted: u64,
    pub critical_set_complete: bool,
    pub ready_for_live: bool,
    pub duration_ms: u128,
    pub logs: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyReport {
    pub schema: String,
    pub table_count: usize,
    pub missing_critical: Vec<String>,
    pub critical_set_complete: bool,
    pub ready_for_live: bool,
}

/// Builds the complete per-tenant schema and verifies it.
#[instrument(skip(pool), err)]
pub async fn provision(
    pool: &Pool<Postgres>,
    schema: &SchemaName,
) -> Result<ProvisionReport, sqlx::Error> {
    let started = Instant::now();
    let mut logs = Vec::new();
    let mut warnings = Vec::new();
    let mut error = None;

    let mut conn = pool.acquire().await?;

    // 1. namespace; DDL auto-commits, everything after is resumable
    let query = format!("CREATE SCHEMA IF NOT EXISTS {schema};");
    conn.execute(query.as_str()).await?;
    logs.push(format!("schema {schema} present"));

    // 2. tables in dependency order
    let mut tables_created = 0;
    for table in TENANT_TABLES {
        match materialize_table(&mut conn, schema, table.name, table.ddl).await {
            Ok(true) => {
                tables_created += 1;
                logs.push(format!("created {}", table.name));
            }
            Ok(false) => {}
            Err(table_error) => {
                // keep going, the re-run resumes this table
                error!(table = table.name, %table_error, "table materialization failed");
                warnings.push(format!("table {} failed: {table_error}", table.name));
                error.get_or_insert_with(|| table_error.to_string());
            }
        }
    }
    logs.push(format!(
        "{tables_created} of {} tables newly created",
        TENANT_TABLES.len()
    ));

    // 3. structural migrations
    match migrations::run_tenant_migrations(&mut conn, schema).await {
        Ok(outcomes) => {
            let applied = outcomes
                .iter()
                .filter(|(_, outcome)| *outcome == MigrationOutcome::Applied)
                .count();
            logs.push(format!(
                "{applied} migrations applied, {} already present",
                outcomes.len() - applied
            ));
        }
        Err(migration_error) => {
            error!(%migration_error, "tenant migrations failed");
            warnings.push(format!("migrations failed: {migration_error}"));
            error.get_or_insert_with(|| migration_error.to_string());
        }
    }

    // 4. baseline seed
    let mut seed_rows_inserted = 0;
    match run_seed(&mut conn, schema).await {
        Ok(inserted) => {
            seed_rows_inserted = inserted;
            logs.push(format!("{inserted} seed rows inserted"));
        }
        Err(seed_error) => {
            error!(%seed_error, "seeding failed");
            warnings.push(format!("seeding failed: {seed_error}"));
            error.get_or_insert_with(|| seed_error.to_string());
        }
    }

    // 5. verification
    let verify = verify(&mut conn, schema).await?;
    if !verify.critical_set_complete {
        warnings.push(format!(
            "critical tables missing: {}",
            verify.missing_critical.join(", ")
        ));
    }
    if verify.table_count < MIN_READY_TABLE_COUNT {
        warnings.push(format!(
            "only {} tables present, {MIN_READY_TABLE_COUNT} required",
            verify.table_count
        ));
    }

    let report = ProvisionReport {
        success: error.is_none(),
        schema: schema.as_unquoted_str().to_owned(),
        table_count: verify.table_count,
        tables_created,
        seed_rows_inserted,
        critical_set_complete: verify.critical_set_complete,
        ready_for_live: verify.ready_for_live,
        duration_ms: started.elapsed().as_millis(),
        logs,
        warnings,
        error,
    };
    info!(
        schema = %report.schema,
        tables_created = report.tables_created,
        table_count = report.table_count,
        ready = report.ready_for_live,
        "provisioning finished"
    );
    Ok(report)
}

async fn materialize_table(
    conn: &mut PgConnection,
    schema: &SchemaName,
    name: &str,
    ddl: &str,
) -> Result<bool, sqlx::Error> {
    if table_exists(conn, schema, name).await? {
        return Ok(false);
    }

    let mut tx = conn.begin().await?;
    let query = format!("SET LOCAL search_path TO {schema}, public;");
    tx.execute(query.as_str()).await?;
    tx.execute(ddl).await?;
    tx.commit().await?;
    Ok(true)
}

async fn table_exists(
    conn: &mut PgConnection,
    schema: &SchemaName,
    name: &str,
) -> Result<bool, sqlx::Error> {
    let (exists,) = sqlx::query_as::<_, (bool,)>(
        "SELECT EXISTS (
            SELECT FROM information_schema.tables
            WHERE table_schema = $1 AND table_name = $2
        );",
    )
    .bind(schema.as_unquoted_str())
    .bind(name)
    .fetch_one(conn)
    .await?;
    Ok(exists)
}

async fn run_seed(conn: &mut PgConnection, schema: &SchemaName) -> Result<u64, sqlx::Error> {
    let mut tx = conn.begin().await?;
    let report = seed::seed_tenant_defaults(&mut tx, schema).await?;
    tx.commit().await?;
    Ok(report.total_inserted())
}

/// Counts tables and checks the critical set.
#[instrument(skip(conn), err)]
pub async fn verify(
    conn: &mut PgConnection,
    schema: &SchemaName,
) -> Result<VerifyReport, sqlx::Error> {
    let present = sqlx::query_as::<_, (String,)>(
        "SELECT table_name FROM information_schema.tables
            WHERE table_schema = $1 AND table_type = 'BASE TABLE';",
    )
    .bind(schema.as_unquoted_str())
    .fetch_all(conn)
    .await?
    .into_iter()
    .map(|(name,)| name)
    .collect::<Vec<_>>();

    let missing_critical = CRITICAL_TABLES
        .iter()
        .filter(|critical| !present.iter().any(|name| name == **critical))
        .map(|critical| (*critical).to_owned())
        .collect::<Vec<_>>();

    let critical_set_complete = missing_critical.is_empty();
    let table_count = present.len();
    if !critical_set_complete {
        warn!(schema = %schema, ?missing_critical, "critical tables missing");
    }

    Ok(VerifyReport {
        schema: schema.as_unquoted_str().to_owned(),
        table_count,
        critical_set_complete,
        ready_for_live: critical_set_complete && table_count >= MIN_READY_TABLE_COUNT,
        missing_critical,
    })
}
