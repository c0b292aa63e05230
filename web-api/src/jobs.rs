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

//! Job handlers the server registers with the queue workers.
//!
//! Handlers run outside any request; the tenant binding comes from the
//! job record itself.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use campus_job_queue::{Job, JobHandler};
use campus_web_api_shared::{postgres::SchemaName, request::TenantId};
use tracing::info;

use crate::storage::DatabaseBuilder;

/// Writes a delivery record into the owning tenant's notification log.
///
/// Actual channel delivery (mail/sms gateways) happens behind this
/// hook; the log row is what the tenant-facing UI surfaces.
pub(crate) struct NotificationLogHandler {
    db: DatabaseBuilder,
    channel: &'static str,
}

impl NotificationLogHandler {
    pub(crate) fn new(db: DatabaseBuilder, channel: &'static str) -> Self {
        Self { db, channel }
    }
}

#[async_trait]
impl JobHandler for NotificationLogHandler {
    async fn handle(&self, job: &Job) -> Result<(), anyhow::Error> {
        let tenant_id = job
            .tenant_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("job without tenant_id"))?
            .parse::<TenantId>()?;
        let db = self.db.build_for(&SchemaName::for_tenant_id(&tenant_id));

        let recipient = job
            .payload
            .get("recipient")
            .or_else(|| job.payload.get("student_id"))
            .and_then(|value| value.as_str().map(ToOwned::to_owned))
            .unwrap_or_else(|| "unknown".into());

        let mut conn = db.acquire().await?;
        sqlx::query(
            "INSERT INTO notification_logs (template_key, recipient, channel, status, job_id)
                VALUES ($1, $2, $3, 'sent', $4);",
        )
        .bind(&job.name)
        .bind(&recipient)
        .bind(self.channel)
        .bind(&job.id)
        .execute(&mut conn)
        .await?;

        info!(job_name = %job.name, %tenant_id, "notification logged");
        Ok(())
    }
}

/// The handlers this server wires up; queues without a handler are
/// drained by dedicated worker deployments.
pub(crate) fn default_handlers(db: &DatabaseBuilder) -> HashMap<String, Arc<dyn JobHandler>> {
    let mut handlers: HashMap<String, Arc<dyn JobHandler>> = HashMap::new();
    handlers.insert(
        "notifications".into(),
        Arc::new(NotificationLogHandler::new(db.clone(), "email")),
    );
    handlers.insert(
        "fees".into(),
        Arc::new(NotificationLogHandler::new(db.clone(), "receipt")),
    );
    handlers
}
