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

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use campus_web_api_shared::{postgres::SchemaName, request::TenantId};

/// Lifecycle status of a tenant.
///
/// Immutable during request handling, changed only by control
/// operations on `management.tenant`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Trial,
    Suspended,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Trial => "trial",
            TenantStatus::Suspended => "suspended",
        }
    }

    pub fn parse(status: &str) -> Result<Self, Error> {
        match status {
            "active" => Ok(TenantStatus::Active),
            "trial" => Ok(TenantStatus::Trial),
            "suspended" => Ok(TenantStatus::Suspended),
            _ => Err(anyhow!("unknown tenant status: {status}")),
        }
    }
}

//Hint: This is directly serialized and returned from the ops CLI.
//      If we do any breaking changes wrt. serialization format we need
//      to create a serde proxy struct.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TenantSerdeProxy")]
pub struct Tenant {
    pub tenant_id: TenantId,
    pub schema_name: SchemaName,
    pub slug: String,
    pub status: TenantStatus,
    pub plan_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct TenantSerdeProxy {
    tenant_id: TenantId,
    #[serde(default)]
    schema_name: Option<SchemaName>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default = "default_status")]
    status: TenantStatus,
    #[serde(default)]
    plan_id: Option<String>,
}

fn default_status() -> TenantStatus {
    TenantStatus::Trial
}

impl From<TenantSerdeProxy> for Tenant {
    fn from(
        TenantSerdeProxy {
            tenant_id,
            schema_name,
            slug,
            status,
            plan_id,
        }: TenantSerdeProxy,
    ) -> Self {
        Self::new_with_defaults(tenant_id, schema_name, slug, status, plan_id)
    }
}

impl Tenant {
    pub async fn load_from_postgres(
        connection: &mut PgConnection,
        tenant_id: TenantId,
    ) -> Result<Tenant, Error> {
        let (schema_name, slug, status, plan_id) =
            sqlx::query_as::<_, (SchemaName, String, String, Option<String>)>(
                "SELECT schema_name, slug, status, plan_id
                FROM management.tenant
                WHERE tenant_id = $1;",
            )
            .bind(&tenant_id)
            .fetch_optional(connection)
            .await?
            .ok_or_else(|| anyhow!("unknown tenant: {tenant_id}"))?;

        Ok(Tenant {
            tenant_id,
            schema_name,
            slug,
            status: TenantStatus::parse(&status)?,
            plan_id,
        })
    }

    pub fn new_with_defaults(
        tenant_id: TenantId,
        schema_name: Option<SchemaName>,
        slug: Option<String>,
        status: TenantStatus,
        plan_id: Option<String>,
    ) -> Self {
        let schema_name =
            schema_name.unwrap_or_else(|| SchemaName::for_tenant_id(&tenant_id));
        let slug = slug.unwrap_or_else(|| tenant_id.to_string());
        Self {
            tenant_id,
            schema_name,
            slug,
            status,
            plan_id,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, TenantStatus::Active | TenantStatus::Trial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_derive_schema_and_slug() {
        let tenant = Tenant::new_with_defaults(
            "north-hill".parse().unwrap(),
            None,
            None,
            TenantStatus::Trial,
            None,
        );
        assert_eq!(tenant.schema_name.as_unquoted_str(), "t_north_hill");
        assert_eq!(tenant.slug, "north-hill");
        assert!(tenant.is_active());
    }

    #[test]
    fn test_suspended_is_not_active() {
        let tenant = Tenant::new_with_defaults(
            "x".parse().unwrap(),
            None,
            None,
            TenantStatus::Suspended,
            None,
        );
        assert!(!tenant.is_active());
    }
}
