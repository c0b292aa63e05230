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

//! Role based access control.
//!
//! Effective permissions for `(tenant, user)` are the union of the
//! user's role grants and direct grants. Checks are `any-of` or
//! `all-of` over dotted keys; the wildcard `*` satisfies everything.
//! There is no implicit admin bypass: a route has to opt in explicitly
//! via [`Guard::allow_admin_override`].

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;
use campus_web_api_shared::request::TenantId;

use crate::{
    error::common::PermissionDenied,
    observability::metrics::{counters, histograms, MetricsRegistry},
    storage::Database,
    Error,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Log denials without enforcing them (rollout aid).
    ///
    /// Tenant isolation violations stay enforced regardless.
    pub strict_log: bool,

    /// Maximum seconds a cached permission set is served.
    pub cache_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strict_log: false,
            cache_ttl_secs: 300,
        }
    }
}

/// The actor's resolved permission keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct PermissionSet {
    keys: HashSet<String>,
}

impl PermissionSet {
    pub(crate) fn new(keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.keys.contains("*") || self.keys.contains(key)
    }

    pub(crate) fn satisfies_any(&self, required: &[&str]) -> bool {
        required.iter().any(|key| self.contains(key))
    }

    pub(crate) fn satisfies_all(&self, required: &[&str]) -> bool {
        required.iter().all(|key| self.contains(key))
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

#[derive(Clone, Copy, Debug)]
enum GuardMode {
    AnyOf,
    AllOf,
}

/// A permission requirement attached to a route.
#[derive(Clone, Debug)]
pub(crate) struct Guard {
    mode: GuardMode,
    required: &'static [&'static str],
    admin_override: bool,
}

impl Guard {
    pub(crate) const fn any_of(required: &'static [&'static str]) -> Self {
        Self {
            mode: GuardMode::AnyOf,
            required,
            admin_override: false,
        }
    }

    pub(crate) const fn all_of(required: &'static [&'static str]) -> Self {
        Self {
            mode: GuardMode::AllOf,
            required,
            admin_override: false,
        }
    }

    /// Explicit per-route opt-in for the admin role to bypass the check.
    #[allow(dead_code)]
    pub(crate) const fn allow_admin_override(mut self) -> Self {
        self.admin_override = true;
        self
    }

    fn is_satisfied(&self, permissions: &PermissionSet, roles: &[String]) -> bool {
        if self.admin_override && roles.iter().any(|role| role == "admin") {
            return true;
        }
        match self.mode {
            GuardMode::AnyOf => permissions.satisfies_any(self.required),
            GuardMode::AllOf => permissions.satisfies_all(self.required),
        }
    }

    fn required_keys(&self) -> Vec<String> {
        self.required.iter().map(|key| (*key).to_string()).collect()
    }
}

struct CachedPermissions {
    permissions: Arc<PermissionSet>,
    epoch: u64,
    cached_at: Instant,
}

/// Shared resolver + cache, constructed once at startup.
pub(crate) struct Rbac {
    config: Config,
    metrics: MetricsRegistry,
    cache: DashMap<(TenantId, Uuid), CachedPermissions>,
    tenant_epochs: DashMap<TenantId, u64>,
}

impl Rbac {
    pub(crate) fn new(config: Config, metrics: MetricsRegistry) -> Self {
        Self {
            config,
            metrics,
            cache: DashMap::new(),
            tenant_epochs: DashMap::new(),
        }
    }

    fn current_epoch(&self, tenant_id: &TenantId) -> u64 {
        self.tenant_epochs
            .get(tenant_id)
            .map(|entry| *entry)
            .unwrap_or(0)
    }

    /// Resolves the effective permission set, serving from cache when
    /// the entry is fresh (epoch matches and TTL not exceeded).
    pub(crate) async fn effective_permissions(
        &self,
        db: &Database,
        tenant_id: &TenantId,
        user_id: Uuid,
    ) -> Result<Arc<PermissionSet>, Error> {
        let epoch = self.current_epoch(tenant_id);
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        if let Some(entry) = self.cache.get(&(tenant_id.clone(), user_id)) {
            if entry.epoch == epoch && entry.cached_at.elapsed() < ttl {
                return Ok(entry.permissions.clone());
            }
        }

        let started = Instant::now();
        let permissions = Arc::new(resolve_permissions(db, user_id).await?);
        self.metrics.record(
            histograms::RBAC_RESOLUTION_LATENCY,
            started.elapsed().as_secs_f64() * 1000.0,
        );

        self.cache.insert(
            (tenant_id.clone(), user_id),
            CachedPermissions {
                permissions: permissions.clone(),
                epoch,
                cached_at: Instant::now(),
            },
        );
        Ok(permissions)
    }

    /// Eager invalidation for one user (role assignment change,
    /// deactivation).
    pub(crate) fn invalidate_user(&self, tenant_id: &TenantId, user_id: Uuid) {
        self.cache.remove(&(tenant_id.clone(), user_id));
    }

    /// Lazy invalidation for everyone in the tenant (role edit).
    #[allow(dead_code)]
    pub(crate) fn bump_tenant_epoch(&self, tenant_id: &TenantId) {
        *self.tenant_epochs.entry(tenant_id.clone()).or_insert(0) += 1;
    }

    /// Enforces a guard against the actor's permissions.
    ///
    /// In shadow mode denials are logged and counted, not enforced.
    pub(crate) fn enforce(
        &self,
        guard: &Guard,
        permissions: &PermissionSet,
        roles: &[String],
    ) -> Result<(), Error> {
        if guard.is_satisfied(permissions, roles) {
            return Ok(());
        }

        self.metrics.increment(counters::RBAC_DENY_COUNT);
        if self.config.strict_log {
            warn!(
                required = ?guard.required,
                "permission denied (shadow mode, not enforced)"
            );
            return Ok(());
        }
        debug!(required = ?guard.required, "permission denied");
        Err(PermissionDenied {
            required: guard.required_keys(),
        }
        .into())
    }
}

/// Union of role grants and direct user grants.
async fn resolve_permissions(db: &Database, user_id: Uuid) -> Result<PermissionSet, Error> {
    let started = Instant::now();
    let mut conn = db.acquire().await?;
    let keys = sqlx::query_as::<_, (String,)>(
        "SELECT rp.permission_key
            FROM role_permissions rp
            JOIN user_roles ur ON ur.role_id = rp.role_id
            WHERE ur.user_id = $1
        UNION
        SELECT up.permission_key
            FROM user_permissions up
            WHERE up.user_id = $1;",
    )
    .bind(user_id)
    .fetch_all(&mut conn)
    .await?;
    db.observe_query(started);

    Ok(PermissionSet::new(keys.into_iter().map(|(key,)| key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permissions(keys: &[&str]) -> PermissionSet {
        PermissionSet::new(keys.iter().map(|key| (*key).to_string()))
    }

    #[test]
    fn test_wildcard_satisfies_everything() {
        let all = permissions(&["*"]);
        assert!(all.contains("fees.collect"));
        assert!(all.satisfies_all(&["fees.collect", "academics.students.view"]));
    }

    #[test]
    fn test_any_of_and_all_of() {
        let teacher = permissions(&["academics.attendance.mark", "academics.marks.enter"]);
        assert!(Guard::any_of(&["academics.attendance.mark", "fees.collect"])
            .is_satisfied(&teacher, &[]));
        assert!(!Guard::all_of(&["academics.attendance.mark", "fees.collect"])
            .is_satisfied(&teacher, &[]));
        assert!(Guard::all_of(&["academics.attendance.mark", "academics.marks.enter"])
            .is_satisfied(&teacher, &[]));
    }

    #[test]
    fn test_no_implicit_admin_bypass() {
        let empty = permissions(&[]);
        let admin_roles = vec!["admin".to_string()];
        assert!(!Guard::any_of(&["fees.collect"]).is_satisfied(&empty, &admin_roles));
        assert!(Guard::any_of(&["fees.collect"])
            .allow_admin_override()
            .is_satisfied(&empty, &admin_roles));
    }

    #[test]
    fn test_shadow_mode_logs_but_allows() {
        let metrics = MetricsRegistry::new();
        let rbac = Rbac::new(
            Config {
                strict_log: true,
                ..Config::default()
            },
            metrics.clone(),
        );
        let result = rbac.enforce(&Guard::any_of(&["fees.collect"]), &permissions(&[]), &[]);
        assert!(result.is_ok());
        assert_eq!(metrics.counter_total(counters::RBAC_DENY_COUNT), 1);
    }

    #[test]
    fn test_strict_mode_denies_and_counts() {
        let metrics = MetricsRegistry::new();
        let rbac = Rbac::new(Config::default(), metrics.clone());
        let result = rbac.enforce(&Guard::any_of(&["fees.collect"]), &permissions(&[]), &[]);
        assert!(result.is_err());
        assert_eq!(metrics.counter_total(counters::RBAC_DENY_COUNT), 1);
    }

    #[test]
    fn test_epoch_bump_changes_current_epoch() {
        let rbac = Rbac::new(Config::default(), MetricsRegistry::new());
        let tenant_id = "t1".parse::<TenantId>().unwrap();
        assert_eq!(rbac.current_epoch(&tenant_id), 0);
        rbac.bump_tenant_epoch(&tenant_id);
        rbac.bump_tenant_epoch(&tenant_id);
        assert_eq!(rbac.current_epoch(&tenant_id), 2);
    }
}
