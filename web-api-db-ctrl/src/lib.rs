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

pub mod blueprint;
pub mod migrations;
mod postgres;
pub mod provision;
pub mod seed;
pub mod tenant;

use serde::{Deserialize, Serialize};
use sqlx::pool::PoolOptions;

use campus_web_api_shared::{
    postgres::{Client as PgClient, Config as PgConfig, SchemaName},
    request::TenantId,
};

use crate::{
    provision::{ProvisionReport, VerifyReport},
    tenant::{Tenant, TenantStatus},
};

pub type Error = anyhow::Error;

/// Handle on the multi-tenant database layout.
///
/// Owns the management schema, the shared public catalog and the
/// per-tenant schemas derived from the blueprint.
#[derive(Clone, Debug)]
pub struct Provisioner {
    postgres_config: PgConfig,
    postgres: PgClient,
}

impl Provisioner {
    pub async fn new(postgres_config: PgConfig) -> Result<Self, Error> {
        let postgres = PoolOptions::new()
            .max_connections(u32::from(postgres_config.max_pool_size))
            .min_connections(u32::from(postgres_config.min_pool_size))
            .acquire_timeout(postgres_config.acquire_timeout())
            .idle_timeout(postgres_config.idle_timeout())
            .connect_with(postgres_config.to_connection_options()?)
            .await?;

        Ok(Self {
            postgres_config,
            postgres,
        })
    }

    /// Creates management schema + public catalog and re-provisions all
    /// known tenants.
    pub async fn initialize(&self) -> Result<(), Error> {
        postgres::initialize(&self.postgres).await
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>, Error> {
        postgres::list_tenants(&self.postgres).await
    }

    pub async fn create_tenant(
        &self,
        tenant: &Tenant,
        institution_name: &str,
    ) -> Result<ProvisionReport, Error> {
        postgres::create_tenant(&self.postgres, tenant, institution_name).await
    }

    pub async fn delete_tenant(&self, tenant_id: TenantId) -> Result<Option<Tenant>, Error> {
        let mut tx = self.postgres.begin().await?;
        let deleted_tenant = postgres::delete_tenant(&mut tx, tenant_id).await?;
        tx.commit().await?;
        Ok(deleted_tenant)
    }

    /// Builds (or completes) the schema; idempotent.
    pub async fn provision(&self, schema: &SchemaName) -> Result<ProvisionReport, Error> {
        Ok(provision::provision(&self.postgres, schema).await?)
    }

    pub async fn verify(&self, schema: &SchemaName) -> Result<VerifyReport, Error> {
        let mut conn = self.postgres.acquire().await?;
        Ok(provision::verify(&mut conn, schema).await?)
    }

    pub async fn run_operations(
        &self,
        initialize: bool,
        ops: impl IntoIterator<Item = Operation>,
    ) -> Result<Vec<OperationResult>, Error> {
        if initialize {
            self.initialize().await?;
        }

        let mut results = Vec::new();
        for op in ops {
            results.push(self.run_operation(op).await);
        }
        Ok(results)
    }

    async fn run_operation(&self, op: Operation) -> OperationResult {
        match op {
            Operation::ListTenants {} => self
                .list_tenants()
                .await
                .map(|tenants| OperationResult::ListTenants { tenants })
                .unwrap_or_else(error_result),
            Operation::CreateTenant {
                tenant_id,
                institution_name,
                schema_name,
                slug,
                status,
                plan_id,
            } => {
                let tenant =
                    Tenant::new_with_defaults(tenant_id, schema_name, slug, status, plan_id);
                self.create_tenant(&tenant, &institution_name)
                    .await
                    .map(|report| OperationResult::CreateTenant {
                        tenant,
                        report: Box::new(report),
                    })
                    .unwrap_or_else(error_result)
            }
            Operation::DeleteTenant { tenant_id } => self
                .delete_tenant(tenant_id)
                .await
                .map(|tenant| OperationResult::DeleteTenant { tenant })
                .unwrap_or_else(error_result),
            Operation::Provision { schema_name } => self
                .provision(&schema_name)
                .await
                .map(|report| OperationResult::Provision {
                    report: Box::new(report),
                })
                .unwrap_or_else(error_result),
            Operation::Verify { schema_name } => self
                .verify(&schema_name)
                .await
                .map(|report| OperationResult::Verify {
                    report: Box::new(report),
                })
                .unwrap_or_else(error_result),
        }
    }

    pub fn postgres_config(&self) -> &PgConfig {
        &self.postgres_config
    }

    pub fn postgres_client(&self) -> &PgClient {
        &self.postgres
    }
}

fn error_result(error: Error) -> OperationResult {
    OperationResult::Error {
        msg: error.to_string(),
    }
}

#[derive(Deserialize, Debug)]
pub enum Operation {
    ListTenants {},
    CreateTenant {
        tenant_id: TenantId,
        institution_name: String,
        #[serde(default)]
        schema_name: Option<SchemaName>,
        #[serde(default)]
        slug: Option<String>,
        #[serde(default = "default_create_status")]
        status: TenantStatus,
        #[serde(default)]
        plan_id: Option<String>,
    },
    DeleteTenant {
        tenant_id: TenantId,
    },
    Provision {
        schema_name: SchemaName,
    },
    Verify {
        schema_name: SchemaName,
    },
}

fn default_create_status() -> TenantStatus {
    TenantStatus::Trial
}

#[derive(Debug, Serialize)]
pub enum OperationResult {
    ListTenants {
        tenants: Vec<Tenant>,
    },
    CreateTenant {
        tenant: Tenant,
        report: Box<ProvisionReport>,
    },
    DeleteTenant {
        tenant: Option<Tenant>,
    },
    Provision {
        report: Box<ProvisionReport>,
    },
    Verify {
        report: Box<VerifyReport>,
    },
    Error {
        msg: String,
    },
}

impl OperationResult {
    pub fn is_error(&self) -> bool {
        match self {
            OperationResult::Error { .. } => true,
            OperationResult::Provision { report } => !report.success,
            OperationResult::CreateTenant { report, .. } => !report.success,
            _ => false,
        }
    }
}
