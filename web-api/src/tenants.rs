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

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Postgres};
use campus_web_api_shared::{postgres::SchemaName, request::TenantId};

use crate::Error;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Honor the privileged `x-schema-name` header.
    ///
    /// Meant for test harnesses; refused in production by config
    /// validation.
    pub allow_schema_header: bool,

    /// Domain whose subdomains map to tenants (`<tenant>.<root_domain>`).
    pub root_domain: Option<String>,

    /// Seconds a directory entry is served from cache.
    pub directory_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allow_schema_header: false,
            root_domain: None,
            directory_ttl_secs: 60,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct TenantRecord {
    pub(crate) tenant_id: TenantId,
    pub(crate) schema_name: SchemaName,
    pub(crate) status: String,
}

impl TenantRecord {
    pub(crate) fn is_suspended(&self) -> bool {
        self.status == "suspended"
    }
}

/// Read-through cache over `management.tenant`.
///
/// Keeps per-request tenant verification off the database for the
/// common case; entries expire after a short TTL so control-plane
/// changes (suspension) are picked up promptly.
pub(crate) struct TenantDirectory {
    cache: DashMap<TenantId, (TenantRecord, Instant)>,
    ttl: Duration,
}

impl TenantDirectory {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            cache: DashMap::new(),
            ttl: Duration::from_secs(config.directory_ttl_secs),
        }
    }

    pub(crate) async fn lookup(
        &self,
        pool: &Pool<Postgres>,
        tenant_id: &TenantId,
    ) -> Result<Option<TenantRecord>, Error> {
        if let Some(entry) = self.cache.get(tenant_id) {
            let (record, cached_at) = entry.value();
            if cached_at.elapsed() < self.ttl {
                return Ok(Some(record.clone()));
            }
        }

        let record = sqlx::query_as::<_, (SchemaName, String)>(
            "SELECT schema_name, status FROM management.tenant WHERE tenant_id = $1;",
        )
        .bind(tenant_id)
        .fetch_optional(pool)
        .await
        .map_err(crate::error::common::InternalError::from_std)?
        .map(|(schema_name, status)| TenantRecord {
            tenant_id: tenant_id.clone(),
            schema_name,
            status,
        });

        match &record {
            Some(record) => {
                self.cache
                    .insert(tenant_id.clone(), (record.clone(), Instant::now()));
            }
            None => {
                self.cache.remove(tenant_id);
            }
        }
        Ok(record)
    }

    pub(crate) fn invalidate(&self, tenant_id: &TenantId) {
        self.cache.remove(tenant_id);
    }
}
