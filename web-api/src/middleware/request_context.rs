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

use std::{future::Future, sync::Arc, time::Instant};

use actix_web::{
    body::BoxBody,
    dev::{Service, ServiceRequest, ServiceResponse},
    http::header,
    web::Data,
    HttpMessage,
    HttpRequest,
};
use futures_util::{
    future::{self, Either},
    FutureExt,
};
use serde::Serialize;
use thiserror::Error;
use tokio::{task::futures::TaskLocalFuture, task_local};
use tracing::{error_span, instrument, trace, Instrument};
use uuid::Uuid;
use campus_web_api_shared::{postgres::SchemaName, request::TenantId};

use crate::{
    app::AppState,
    auth::tokens,
    error::{
        common::{BadRequest, RateLimited, TenantUnresolved},
        early_failure::middleware_failure,
    },
    observability::metrics::{counters, histograms},
};

/// Per-request context available to every extractor and handler.
///
/// Carrying the resolved tenant here is what makes the schema binding
/// explicit: storage handles can only be built out of this context.
pub(crate) struct RequestContext {
    pub(crate) tenant_id: TenantId,
    pub(crate) schema_name: SchemaName,
    pub(crate) request_id: RequestId,
    /// Set when the schema was named directly via the privileged header.
    pub(crate) schema_from_header: bool,
    #[allow(unused)]
    pub(crate) start_time: Instant,
}

impl RequestContext {
    /// Tries to return the current [`RequestContext`] based on a request.
    ///
    /// The context will be setup by the `setup_request_context` middleware.
    #[instrument(skip_all, err)]
    pub(crate) fn try_extract_from_request<R>(
        request: &HttpRequest,
        func: impl FnOnce(&Arc<RequestContext>) -> R,
    ) -> Result<R, AccessError> {
        let extensions = request.extensions();
        Ok(func(extensions.get::<Arc<RequestContext>>().ok_or(
            AccessError {
                method: "try_extract_from_request",
            },
        )?))
    }
}

#[derive(Debug, Error)]
#[error("Failed to access expected context value in: {method}")]
pub(crate) struct AccessError {
    method: &'static str,
}

#[derive(Clone, Copy, Debug, derive_more::Display, Serialize)]
#[serde(transparent)]
pub(crate) struct RequestId(Uuid);

task_local! {
    static CURRENT_REQUEST_ID: RequestId;
}

impl RequestId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub(crate) const fn missing() -> Self {
        Self(Uuid::nil())
    }

    pub(crate) fn wrap_future<F>(self, future: F) -> TaskLocalFuture<RequestId, F>
    where
        F: 'static + Future,
    {
        CURRENT_REQUEST_ID.scope(self, future)
    }

    pub(crate) fn extract_from_task_local_storage() -> Result<RequestId, AccessError> {
        CURRENT_REQUEST_ID
            .try_with(|id| *id)
            .map_err(|_| AccessError {
                method: "extract_from_task_local_storage",
            })
    }
}

/// Sets up the call context for tenant scoped routes.
///
/// This resolves the tenant, makes the `RequestContext` available as an
/// extension, enforces the global rate limit and sets up tracing for
/// all calls.
pub(crate) fn setup_request_context<S>(
    state: &Data<AppState>,
    request: ServiceRequest,
    service: &S,
) -> impl Future<Output = Result<ServiceResponse<BoxBody>, actix_web::Error>> + 'static
where
    S: Service<ServiceRequest, Response = ServiceResponse<BoxBody>, Error = actix_web::Error>,
    S::Future: 'static,
{
    let request_id = RequestId::generate();
    let start_time = Instant::now();

    if let Some(polluted_key) = first_duplicated_query_key(request.query_string()) {
        let response = middleware_failure(
            "query_sanitation",
            request,
            Some(request_id),
            None,
            BadRequest::from(format!("duplicated query parameter: {polluted_key}")).into(),
            "parameter pollution rejected",
        );
        return Either::Left(future::ok(response));
    }

    if let Err(limited) = state.rate_limits.check_request(&request) {
        let response = middleware_failure(
            "rate_limit",
            request,
            Some(request_id),
            None,
            RateLimited.into(),
            limited,
        );
        return Either::Left(future::ok(response));
    }

    let resolved = match resolve_tenant(state, &request) {
        Ok(resolved) => resolved,
        Err(cause) => {
            let response = middleware_failure(
                "setup_request_context",
                request,
                Some(request_id),
                None,
                TenantUnresolved.into(),
                cause,
            );
            return Either::Left(future::ok(response));
        }
    };

    // the request span must have the lowest level, otherwise it will not be added to the logs if a
    // subscriber with a lower level filter than the span level is used
    let span = error_span!(
        "request",
        path = %request.request().path(),
        method = %request.request().method(),
        %request_id,
        tenant_id = %resolved.tenant_id,
    );

    trace!(parent: &span, "request received");

    let context = Arc::new(RequestContext {
        tenant_id: resolved.tenant_id,
        schema_name: resolved.schema_name,
        request_id,
        schema_from_header: resolved.schema_from_header,
        start_time,
    });

    request.extensions_mut().insert(context);

    let metrics = state.metrics.clone();
    Either::Right(
        request_id.wrap_future(
            service
                .call(request)
                .instrument(span.clone())
                .inspect(move |result| {
                    trace!(parent: span, "request processed");
                    let latency_ms = start_time.elapsed().as_secs_f64() * 1000.0;
                    metrics.record(histograms::HTTP_REQUEST_LATENCY, latency_ms);
                    let is_error = match result {
                        Ok(response) => response.status().is_server_error(),
                        Err(_) => true,
                    };
                    if is_error {
                        metrics.increment(counters::HTTP_ERROR_COUNT);
                    }
                }),
        ),
    )
}

struct ResolvedTenant {
    tenant_id: TenantId,
    schema_name: SchemaName,
    schema_from_header: bool,
}

const TENANT_ID_HEADER: &str = "x-tenant-id";
const SCHEMA_NAME_HEADER: &str = "x-schema-name";
const TENANT_COOKIE: &str = "tenant";

/// Resolves the tenant for a request.
///
/// Priority: privileged `x-schema-name` header (gated), bearer claim,
/// host subdomain, cookie. The resolved identity is verified against
/// the management directory later in the authenticator; this only
/// derives it.
fn resolve_tenant(
    state: &Data<AppState>,
    request: &ServiceRequest,
) -> Result<ResolvedTenant, anyhow::Error> {
    let tenants_config = &state.config.tenants;

    // 1. privileged schema header, only with a matching tenant id header
    if tenants_config.allow_schema_header {
        if let Some(schema) = header_value(request, SCHEMA_NAME_HEADER) {
            let schema_name = schema.parse::<SchemaName>()?;
            let tenant_id = header_value(request, TENANT_ID_HEADER)
                .ok_or_else(|| {
                    anyhow::anyhow!("{SCHEMA_NAME_HEADER} requires {TENANT_ID_HEADER}")
                })?
                .parse::<TenantId>()?;
            return Ok(ResolvedTenant {
                tenant_id,
                schema_name,
                schema_from_header: true,
            });
        }
    }

    // 2. bearer token claim (signature is verified by the authenticator)
    if let Some(tenant_id) = bearer_token(request).and_then(tokens::peek_tenant_id) {
        let schema_name = SchemaName::for_tenant_id(&tenant_id);
        return Ok(ResolvedTenant {
            tenant_id,
            schema_name,
            schema_from_header: false,
        });
    }

    // 3. host subdomain under the configured root domain
    if let Some(root_domain) = &tenants_config.root_domain {
        if let Some(host) = header_value(request, header::HOST.as_str()) {
            let host = host.split(':').next().unwrap_or(host);
            if let Some(subdomain) = host.strip_suffix(&format!(".{root_domain}")) {
                if let Ok(tenant_id) = subdomain.parse::<TenantId>() {
                    let schema_name = SchemaName::for_tenant_id(&tenant_id);
                    return Ok(ResolvedTenant {
                        tenant_id,
                        schema_name,
                        schema_from_header: false,
                    });
                }
            }
        }
    }

    // 4. cookie fallback
    if let Some(cookie) = request.request().cookie(TENANT_COOKIE) {
        let tenant_id = cookie.value().parse::<TenantId>()?;
        let schema_name = SchemaName::for_tenant_id(&tenant_id);
        return Ok(ResolvedTenant {
            tenant_id,
            schema_name,
            schema_from_header: false,
        });
    }

    Err(anyhow::anyhow!("no tenant could be resolved"))
}

/// Detects HTTP parameter pollution: the same query key supplied twice.
fn first_duplicated_query_key(query: &str) -> Option<String> {
    let mut seen = std::collections::HashSet::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let key = pair.split('=').next().unwrap_or(pair);
        if !seen.insert(key) {
            return Some(key.to_owned());
        }
    }
    None
}

fn header_value<'a>(request: &'a ServiceRequest, name: &str) -> Option<&'a str> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub(crate) fn bearer_token(request: &ServiceRequest) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicated_query_keys_are_detected() {
        assert_eq!(first_duplicated_query_key(""), None);
        assert_eq!(first_duplicated_query_key("a=1&b=2"), None);
        assert_eq!(
            first_duplicated_query_key("a=1&b=2&a=3"),
            Some("a".to_owned())
        );
        assert_eq!(
            first_duplicated_query_key("role=admin&role=student"),
            Some("role".to_owned())
        );
        // a bare key still counts as that key
        assert_eq!(first_duplicated_query_key("a&a=1"), Some("a".to_owned()));
    }
}
