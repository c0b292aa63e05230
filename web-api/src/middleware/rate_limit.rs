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

//! Tiered fixed-window rate limiting.
//!
//! Three tiers: a global per-caller limit, a tighter one on the auth
//! endpoints and a failure-only one on login attempts. Keys are the
//! authenticated subject where available, the peer ip otherwise.

use std::time::{SystemTime, UNIX_EPOCH};

use actix_web::dev::ServiceRequest;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{auth::tokens, middleware::request_context::bearer_token};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    /// Requests per minute per authenticated user (per ip otherwise).
    pub global_per_minute: u32,
    /// Requests per window on the auth endpoints, keyed by ip.
    pub auth_per_window: u32,
    pub auth_window_secs: u64,
    /// Failed login attempts per window, keyed by ip; successful
    /// attempts do not count.
    pub login_failures_per_window: u32,
    pub login_failure_window_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            global_per_minute: 100,
            auth_per_window: 20,
            auth_window_secs: 900,
            login_failures_per_window: 10,
            login_failure_window_secs: 900,
        }
    }
}

const AUTH_PATH_PREFIX: &str = "/api/v1/tenant/auth";

pub(crate) struct RateLimiters {
    config: Config,
    global: DashMap<String, (u64, u32)>,
    auth: DashMap<String, (u64, u32)>,
    login_failures: DashMap<String, (u64, u32)>,
}

impl RateLimiters {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            config,
            global: DashMap::new(),
            auth: DashMap::new(),
            login_failures: DashMap::new(),
        }
    }

    /// Applies the global tier and, on auth paths, the auth tier.
    pub(crate) fn check_request(&self, request: &ServiceRequest) -> Result<(), String> {
        if !self.config.enabled {
            return Ok(());
        }

        let caller = caller_key(request);
        if !bump_window(
            &self.global,
            &caller,
            60,
            self.config.global_per_minute,
        ) {
            return Err(format!("global limit exceeded for {caller}"));
        }

        if request.path().starts_with(AUTH_PATH_PREFIX) {
            let ip = peer_ip(request);
            if !bump_window(
                &self.auth,
                &ip,
                self.config.auth_window_secs,
                self.config.auth_per_window,
            ) {
                return Err(format!("auth limit exceeded for {ip}"));
            }
        }

        Ok(())
    }

    /// Failure-only login tier; call before attempting the login.
    pub(crate) fn check_login_failures(&self, ip: &str) -> Result<(), String> {
        if !self.config.enabled {
            return Ok(());
        }
        let window = window_id(self.config.login_failure_window_secs);
        let over_limit = self
            .login_failures
            .get(ip)
            .map(|entry| {
                let (entry_window, count) = *entry;
                entry_window == window && count >= self.config.login_failures_per_window
            })
            .unwrap_or(false);
        if over_limit {
            Err(format!("login failure limit exceeded for {ip}"))
        } else {
            Ok(())
        }
    }

    /// Counts one failed login attempt.
    pub(crate) fn record_login_failure(&self, ip: &str) {
        if !self.config.enabled {
            return;
        }
        bump_window(
            &self.login_failures,
            ip,
            self.config.login_failure_window_secs,
            u32::MAX,
        );
    }
}

fn caller_key(request: &ServiceRequest) -> String {
    bearer_token(request)
        .and_then(tokens::peek_subject)
        .map(|subject| format!("user:{subject}"))
        .unwrap_or_else(|| format!("ip:{}", peer_ip(request)))
}

fn peer_ip(request: &ServiceRequest) -> String {
    request
        .connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_owned()
}

fn window_id(window_secs: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    now / window_secs.max(1)
}

/// Returns false when the limit is exhausted for this window.
fn bump_window(
    map: &DashMap<String, (u64, u32)>,
    key: &str,
    window_secs: u64,
    limit: u32,
) -> bool {
    let window = window_id(window_secs);
    let mut entry = map.entry(key.to_owned()).or_insert((window, 0));
    let (entry_window, count) = *entry;
    if entry_window != window {
        *entry = (window, 1);
        return true;
    }
    if count >= limit {
        return false;
    }
    *entry = (window, count + 1);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_window_enforces_limit() {
        let map = DashMap::new();
        for _ in 0..3 {
            assert!(bump_window(&map, "k", 3600, 3));
        }
        assert!(!bump_window(&map, "k", 3600, 3));
        // another key is unaffected
        assert!(bump_window(&map, "other", 3600, 3));
    }

    #[test]
    fn test_login_failure_tier_counts_failures_only() {
        let limiters = RateLimiters::new(Config {
            login_failures_per_window: 2,
            ..Config::default()
        });
        assert!(limiters.check_login_failures("1.2.3.4").is_ok());
        limiters.record_login_failure("1.2.3.4");
        assert!(limiters.check_login_failures("1.2.3.4").is_ok());
        limiters.record_login_failure("1.2.3.4");
        assert!(limiters.check_login_failures("1.2.3.4").is_err());
        assert!(limiters.check_login_failures("5.6.7.8").is_ok());
    }
}
