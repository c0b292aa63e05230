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

//! The tenant-bound database handle.
//!
//! A [`Database`] can only be built out of a [`SchemaName`]; every
//! connection it hands out has `search_path` bound to that schema
//! first. The binding is re-applied per acquire because the pool
//! recycles connections between requests, and cleared on release.

use std::time::Instant;

use futures_util::{future::BoxFuture, FutureExt};
use sqlx::{
    pool::{PoolConnection, PoolOptions},
    Acquire,
    Executor,
    Pool,
    Postgres,
    Transaction,
};
use tracing::instrument;
use campus_web_api_shared::postgres::{Config, SchemaName};

use crate::{
    observability::metrics::{counters, histograms, MetricsRegistry},
    SetupError,
};

/// Queries slower than this count as slow queries.
const SLOW_QUERY_MS: f64 = 500.0;

#[derive(Clone)]
pub(crate) struct DatabaseBuilder {
    pool: Pool<Postgres>,
    metrics: MetricsRegistry,
}

impl DatabaseBuilder {
    #[instrument(skip_all, err)]
    pub(crate) async fn connect(
        config: &Config,
        metrics: MetricsRegistry,
    ) -> Result<Self, SetupError> {
        let options = config.to_connection_options()?;
        let pool = PoolOptions::new()
            .max_connections(u32::from(config.max_pool_size))
            .min_connections(u32::from(config.min_pool_size))
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(config.idle_timeout())
            .after_release(|conn, _metadata| {
                async {
                    // connections go back neutral, never tenant-bound
                    sqlx::query("RESET ALL;").execute(conn).await?;
                    Ok(true)
                }
                .boxed()
            })
            .connect_with(options)
            .await?;

        Ok(Self { pool, metrics })
    }

    /// Binds a handle to the given tenant schema.
    pub(crate) fn build_for(&self, schema: &SchemaName) -> Database {
        Database {
            pool: self.pool.clone(),
            schema: schema.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Handle for the shared catalog (`public` + `management`).
    pub(crate) fn shared(&self) -> Database {
        Database {
            pool: self.pool.clone(),
            schema: "public".parse().unwrap(/* static valid name */),
            metrics: self.metrics.clone(),
        }
    }

    pub(crate) fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Clone)]
pub(crate) struct Database {
    pool: Pool<Postgres>,
    schema: SchemaName,
    metrics: MetricsRegistry,
}

impl Database {
    pub(crate) fn schema(&self) -> &SchemaName {
        &self.schema
    }

    pub(crate) async fn acquire(&self) -> Result<PoolConnection<Postgres>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        self.bind_search_path(&mut conn).await?;
        Ok(conn)
    }

    pub(crate) async fn begin(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        // LOCAL so the binding dies with the transaction
        let query = format!("SET LOCAL search_path TO {}, public;", self.schema);
        tx.execute(query.as_str()).await?;
        Ok(tx)
    }

    /// Every connection must pass through here before use.
    ///
    /// `SET` doesn't support `$` binds; `SchemaName` is whitelist
    /// validated which is what makes the splice safe.
    async fn bind_search_path<'c, E>(&self, conn: E) -> Result<(), sqlx::Error>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let query = format!("SET search_path TO {}, public;", self.schema);
        conn.execute(query.as_str()).await?;
        Ok(())
    }

    /// Records one query round trip for the latency histogram.
    pub(crate) fn observe_query(&self, started: Instant) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record(histograms::DB_QUERY_LATENCY, elapsed_ms);
        if elapsed_ms > SLOW_QUERY_MS {
            self.metrics.increment(counters::DB_SLOW_QUERIES);
        }
    }
}

impl<'c> Acquire<'c> for &'c Database {
    type Database = Postgres;

    type Connection = PoolConnection<Postgres>;

    fn acquire(self) -> BoxFuture<'c, Result<Self::Connection, sqlx::Error>> {
        Database::acquire(self).boxed()
    }

    fn begin(self) -> BoxFuture<'c, Result<Transaction<'c, Postgres>, sqlx::Error>> {
        Database::begin(self).boxed()
    }
}
