// Copyright 2022 Xayn AG
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

use std::time::Instant;

use campus_job_queue::JobQueue;
use campus_web_api_db_ctrl::Provisioner;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    auth::tokens::TokenKeys,
    config::Config,
    jobs,
    middleware::rate_limit::RateLimiters,
    observability::{metrics::MetricsRegistry, redflags::RedFlagRegistry},
    rbac::Rbac,
    storage::DatabaseBuilder,
    tenants::TenantDirectory,
    SetupError,
};

/// Long-lived shared state, created once at startup and handed to the
/// HTTP layer via `web::Data`.
pub struct AppState {
    pub(crate) config: Config,
    pub(crate) db: DatabaseBuilder,
    pub(crate) queue: JobQueue,
    pub(crate) metrics: MetricsRegistry,
    pub(crate) red_flags: RedFlagRegistry,
    pub(crate) rbac: Rbac,
    pub(crate) tokens: TokenKeys,
    pub(crate) rate_limits: RateLimiters,
    pub(crate) tenant_directory: TenantDirectory,
    pub(crate) started_at: Instant,
    worker_shutdown: watch::Sender<bool>,
}

impl AppState {
    pub(crate) async fn create(config: Config) -> Result<Self, SetupError> {
        let metrics = MetricsRegistry::new();
        let red_flags = RedFlagRegistry::new();

        let db = DatabaseBuilder::connect(&config.storage, metrics.clone()).await?;

        if !config.storage.skip_migrations {
            // management schema, shared catalog and a provisioning pass
            // over every known tenant
            let provisioner = Provisioner::new(config.storage.clone()).await?;
            provisioner.initialize().await?;
        }

        let queue = JobQueue::connect(config.queue.clone()).await;

        let (worker_shutdown, shutdown_receiver) = watch::channel(false);
        if queue.is_available() {
            queue.spawn_workers(jobs::default_handlers(&db), shutdown_receiver)?;
        } else {
            warn!("queue backend unavailable, no workers spawned");
        }

        let rbac = Rbac::new(config.rbac.clone(), metrics.clone());
        let tokens = TokenKeys::from_config(&config.auth);
        let rate_limits = RateLimiters::new(config.rate_limit.clone());
        let tenant_directory = TenantDirectory::new(&config.tenants);

        Ok(Self {
            config,
            db,
            queue,
            metrics,
            red_flags,
            rbac,
            tokens,
            rate_limits,
            tenant_directory,
            started_at: Instant::now(),
            worker_shutdown,
        })
    }

    pub(crate) async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.worker_shutdown.send(true);
        self.db.close().await;
    }
}
