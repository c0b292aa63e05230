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

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use futures_util::future::join_all;
use itertools::Itertools;
use sqlx::{Connection, Executor, Pool, Postgres, Transaction};
use tracing::{debug, error, info, instrument};

use campus_web_api_shared::{postgres::SchemaName, request::TenantId};

use crate::{
    provision::{self, ProvisionReport},
    tenant::{Tenant, TenantStatus},
    Error,
};

// WARNING: Hardcoding this id to 0 is only okay because we know exactly
//          which ids are used when. For e.g. sqlx doing so would be a
//          no-go hence why they derive the id from the db name.
const MIGRATION_LOCK_ID: i64 = 0;

/// DDL for the operator-facing management schema.
const MANAGEMENT_SCHEMA_DDL: &str = r#"
    CREATE SCHEMA IF NOT EXISTS management;
    CREATE TABLE IF NOT EXISTS management.tenant (
        tenant_id text PRIMARY KEY,
        schema_name text NOT NULL UNIQUE,
        slug text NOT NULL,
        status text NOT NULL DEFAULT 'trial',
        plan_id text,
        created_at timestamptz NOT NULL DEFAULT now()
    );
"#;

/// DDL for the shared global catalog in `public`.
const PUBLIC_CATALOG_DDL: &str = r#"
    CREATE EXTENSION IF NOT EXISTS pgcrypto;
    CREATE TABLE IF NOT EXISTS public.institutions (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        tenant_id text NOT NULL UNIQUE,
        name text NOT NULL,
        schema_name text NOT NULL UNIQUE,
        created_at timestamptz NOT NULL DEFAULT now()
    );
    CREATE TABLE IF NOT EXISTS public.plans (
        id text PRIMARY KEY,
        name text NOT NULL,
        max_students integer,
        price_per_month numeric(12,2)
    );
    CREATE TABLE IF NOT EXISTS public.modules (
        id text PRIMARY KEY,
        name text NOT NULL
    );
    CREATE TABLE IF NOT EXISTS public.features (
        id text PRIMARY KEY,
        module_id text NOT NULL REFERENCES public.modules (id),
        name text NOT NULL
    );
    CREATE TABLE IF NOT EXISTS public.permissions (
        key text PRIMARY KEY,
        feature_id text REFERENCES public.features (id),
        description text
    );
    CREATE TABLE IF NOT EXISTS public.role_templates (
        id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
        name text NOT NULL,
        role_type text NOT NULL,
        permission_keys text[] NOT NULL DEFAULT '{}'
    );
"#;

/// Initializes the DB for multi-tenant usage.
///
/// 1. The management schema and the shared public catalog are created
///    (if needed).
///
/// 2. Concurrently for each known tenant a provisioning run verifies
///    and completes their schema (if needed).
#[instrument(skip_all, err)]
pub(super) async fn initialize(pool: &Pool<Postgres>) -> Result<(), Error> {
    // Move out to make sure that a pool with a limit of 1 conn doesn't
    // lead to a dead lock when running tenant provisioning. And that we
    // do release the lock in case of an error.
    let mut conn = pool.acquire().await?.detach();

    lock_id_until_unlock(&mut conn, MIGRATION_LOCK_ID).await?;

    // WARNING: Many operations here might not be fully transactional.
    //          Transactions still help with scoping locks and temp.
    //          session settings.
    info!("running management schema migration");
    run_ddl_batch(&mut conn, MANAGEMENT_SCHEMA_DDL).await?;

    info!("running public catalog migration");
    run_ddl_batch(&mut conn, PUBLIC_CATALOG_DDL).await?;

    // We run this _before_ we release the lock but it will
    // run concurrently on multiple different connections.
    //FIXME: There is a limit to how well this scales.
    info!("start tenant schema provisioning");
    let failures = provision_all_tenants(pool).await?;

    unlock_lock_id(&mut conn, MIGRATION_LOCK_ID).await?;

    for (tenant, provision_error) in &failures {
        error!({ %tenant.tenant_id, %provision_error }, "provisioning failed");
    }

    conn.close().await?;

    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("some tenant provisioning runs failed"))
    }
}

async fn run_ddl_batch(
    conn: &mut sqlx::PgConnection,
    ddl: &str,
) -> Result<(), sqlx::Error> {
    let mut tx = conn.begin().await?;
    for statement in ddl.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        tx.execute(statement).await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip(pool), err)]
async fn provision_all_tenants(
    pool: &Pool<Postgres>,
) -> Result<Vec<(Tenant, Error)>, Error> {
    let tenants = list_tenants(pool).await?;
    // Hint: Parallelism is implicitly limited by the connection pool.
    let results = join_all(tenants.iter().map(|tenant| async move {
        provision::provision(pool, &tenant.schema_name)
            .await
            .map_err(Error::from)
            .and_then(|report| {
                report.error.is_none().then_some(()).ok_or_else(|| {
                    anyhow::anyhow!(report.error.unwrap_or_else(|| "unknown".into()))
                })
            })
    }))
    .await;

    Ok(tenants
        .into_iter()
        .zip(results)
        .filter_map(|(tenant, result)| match result {
            Ok(()) => None,
            Err(error) => Some((tenant, error)),
        })
        .collect_vec())
}

#[instrument(skip(pool), err)]
pub(super) async fn list_tenants(pool: &Pool<Postgres>) -> Result<Vec<Tenant>, Error> {
    sqlx::query_as::<_, (TenantId, SchemaName, String, String, Option<String>)>(
        "SELECT tenant_id, schema_name, slug, status, plan_id FROM management.tenant",
    )
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|(tenant_id, schema_name, slug, status, plan_id)| {
        Ok(Tenant {
            tenant_id,
            schema_name,
            slug,
            status: TenantStatus::parse(&status)?,
            plan_id,
        })
    })
    .collect()
}

#[instrument(skip(tx), err)]
pub(super) async fn delete_tenant(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
) -> Result<Option<Tenant>, Error> {
    let deleted_tenant = sqlx::query_as::<_, (SchemaName, String, String, Option<String>)>(
        "DELETE FROM management.tenant
           WHERE tenant_id = $1
           RETURNING schema_name, slug, status, plan_id;",
    )
    .bind(&tenant_id)
    .fetch_optional(&mut *tx)
    .await?
    .map(|(schema_name, slug, status, plan_id)| {
        Ok::<_, Error>(Tenant {
            tenant_id: tenant_id.clone(),
            schema_name,
            slug,
            status: TenantStatus::parse(&status)?,
            plan_id,
        })
    })
    .transpose()?;

    let Some(tenant) = &deleted_tenant else {
        return Ok(None);
    };

    sqlx::query("DELETE FROM public.institutions WHERE tenant_id = $1;")
        .bind(&tenant_id)
        .execute(&mut *tx)
        .await?;

    //Hint: $ binds won't work for identifiers (e.g. schema names)
    let query = format!("DROP SCHEMA IF EXISTS {} CASCADE;", tenant.schema_name);
    tx.execute(query.as_str()).await?;

    Ok(deleted_tenant)
}

/// Registers a new tenant and provisions its schema.
///
/// Registration (management row + institution row) is transactional,
/// the provisioning run itself is resumable DDL on its own connections.
#[instrument(skip(pool), err)]
pub(super) async fn create_tenant(
    pool: &Pool<Postgres>,
    tenant: &Tenant,
    institution_name: &str,
) -> Result<ProvisionReport, Error> {
    let mut tx = pool.begin().await?;

    let lock_id = generate_tenant_lock_id(&tenant.tenant_id);
    lock_id_until_end_of_transaction(&mut tx, lock_id).await?;

    sqlx::query(
        "INSERT INTO management.tenant (tenant_id, schema_name, slug, status, plan_id)
            VALUES ($1, $2, $3, $4, $5);",
    )
    .bind(&tenant.tenant_id)
    .bind(&tenant.schema_name)
    .bind(&tenant.slug)
    .bind(tenant.status.as_str())
    .bind(&tenant.plan_id)
    .execute(&mut tx)
    .await?;

    sqlx::query(
        "INSERT INTO public.institutions (tenant_id, name, schema_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id) DO NOTHING;",
    )
    .bind(&tenant.tenant_id)
    .bind(institution_name)
    .bind(tenant.schema_name.as_unquoted_str())
    .execute(&mut tx)
    .await?;

    tx.commit().await?;

    let report = provision::provision(pool, &tenant.schema_name).await?;
    info!({tenant_id = %tenant.tenant_id, ready = report.ready_for_live}, "created new tenant");
    Ok(report)
}

/// Use a xact lock on given `id`.
///
/// # Warning
///
/// The lock id namespace is per-database global
/// and 64bit. This means this lock functions
/// shares the id-space with any other transaction
/// lock space.
async fn lock_id_until_end_of_transaction(
    tx: &'_ mut Transaction<'_, Postgres>,
    lock_id: i64,
) -> Result<(), sqlx::Error> {
    debug!({ lock_id }, "pg_advisory_xact_lock");
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(lock_id)
        .execute(tx)
        .await?;
    Ok(())
}

/// Locks the id until it's unlocked or the pg session ends (i.e. connection dropped).
async fn lock_id_until_unlock(
    tx: impl Executor<'_, Database = Postgres>,
    lock_id: i64,
) -> Result<(), sqlx::Error> {
    debug!({ lock_id }, "pg_advisory_lock");
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(lock_id)
        .execute(tx)
        .await?;
    Ok(())
}

/// Unlocks an id locked with [`lock_id_until_unlock()`].
///
/// This *can not* be used to unlock ids locked with [`lock_id_until_end_of_transaction()`].
async fn unlock_lock_id(
    tx: impl Executor<'_, Database = Postgres>,
    lock_id: i64,
) -> Result<(), sqlx::Error> {
    let (lock_was_held,) = sqlx::query_as::<_, (bool,)>("SELECT pg_advisory_unlock($1)")
        .bind(lock_id)
        .fetch_one(tx)
        .await?;
    if lock_was_held {
        debug!({ lock_id }, "pg_advisory_unlock");
    } else {
        error!(
            { lock_id },
            "spurious pg_advisory_unlock which wasn't locked"
        );
    }
    Ok(())
}

/// Generate a `i64` postgres management lock id form a [`TenantId`].
///
/// **There can be collisions**, but less collisions are preferable.
fn generate_tenant_lock_id(tenant_id: &TenantId) -> i64 {
    let mut hasher = DefaultHasher::new();
    tenant_id.hash(&mut hasher);
    let id = hasher.finish() as i64;
    if id == MIGRATION_LOCK_ID {
        // Avoid accidentally colliding with the "general purpose migration
        // lock". This could lead to a dead lock if we try to run per-tenant
        // provisioning in their own connection as part of code holding the
        // "general purpose migration lock"
        id + 1
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_lock_id_avoids_migration_lock_id() {
        for raw in ["a", "b", "green-valley", "t1", "t2"] {
            let tenant_id = raw.parse::<TenantId>().unwrap();
            assert_ne!(generate_tenant_lock_id(&tenant_id), MIGRATION_LOCK_ID);
        }
    }
}
