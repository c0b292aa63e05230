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

//! Authentication and the authenticated-request extractor.

pub(crate) mod password;
pub(crate) mod routes;
pub(crate) mod store;
pub(crate) mod tokens;

use std::{sync::Arc, time::Instant};

use actix_web::{dev::Payload, web::Data, FromRequest, HttpRequest};
use futures_util::future::LocalBoxFuture;
use uuid::Uuid;
use campus_web_api_shared::request::TenantId;

use crate::{
    app::AppState,
    error::common::{
        CredentialExpired,
        InternalError,
        MissingCredential,
        PasswordChangeRequired,
        TenantBindingMissing,
        TenantMismatch,
        TenantSuspended,
        TenantUnresolved,
    },
    middleware::request_context::RequestContext,
    observability::{
        metrics::histograms,
        redflags::{kinds, Severity},
    },
    rbac::PermissionSet,
    storage::Database,
    tenants::TenantRecord,
    Error,
};

pub(crate) use tokens::Config;

/// The authenticated principal of a request.
pub(crate) struct Actor {
    pub(crate) user_id: Uuid,
    pub(crate) tenant_id: TenantId,
    pub(crate) session_id: Uuid,
    pub(crate) roles: Vec<String>,
    pub(crate) permissions: Arc<PermissionSet>,
}

/// Extractor for routes behind the authenticator.
///
/// Performs, in order: tenant verification against the management
/// directory, bearer verification, session check, the cross-tenant
/// isolation guard, and permission resolution. The bound [`Database`]
/// is only reachable through here, which keeps the schema binding
/// fail-closed.
pub(crate) struct Auth {
    pub(crate) actor: Actor,
    pub(crate) db: Database,
    #[allow(unused)]
    pub(crate) context: Arc<RequestContext>,
}

impl FromRequest for Auth {
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(request: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let request = request.clone();
        Box::pin(async move {
            authenticate(&request)
                .await
                .map_err(actix_web::Error::from)
        })
    }
}

async fn authenticate(request: &HttpRequest) -> Result<Auth, Error> {
    let started = Instant::now();
    let state = request
        .app_data::<Data<AppState>>()
        .ok_or_else(|| InternalError::from_message("app state missing"))?;
    // a tenant scoped route outside the binding middleware is a wiring
    // bug, fail closed
    let context = RequestContext::try_extract_from_request(request, Clone::clone)
        .map_err(|_| TenantBindingMissing)?;

    let (_record, db) = resolve_tenant_db(state, &context).await?;

    let token = bearer_token_from_http(request).ok_or(MissingCredential)?;
    let claims = state
        .tokens
        .verify(token, tokens::TokenKind::Access)?;

    // cross-tenant isolation guard: the verified claim must agree with
    // the bound schema; enforced even in RBAC shadow mode
    if claims.tenant_id != context.tenant_id.to_string() {
        state.red_flags.raise(
            kinds::TENANT_ISOLATION_MISMATCH,
            Severity::P0,
            format!(
                "token for tenant {} used against tenant {}",
                claims.tenant_id, context.tenant_id
            ),
            Some(&context.tenant_id),
            None,
            None,
        );
        return Err(TenantMismatch.into());
    }

    let session = store::find_session(&db, claims.session_id)
        .await?
        .ok_or(CredentialExpired)?;
    if !session.is_usable() || session.user_id != claims.sub {
        return Err(CredentialExpired.into());
    }

    if claims.must_change_password && !is_password_change_exempt(request.path()) {
        return Err(PasswordChangeRequired.into());
    }

    let permissions = state
        .rbac
        .effective_permissions(&db, &context.tenant_id, claims.sub)
        .await?;

    state.metrics.record(
        histograms::AUTH_LATENCY,
        started.elapsed().as_secs_f64() * 1000.0,
    );

    Ok(Auth {
        actor: Actor {
            user_id: claims.sub,
            tenant_id: context.tenant_id.clone(),
            session_id: claims.session_id,
            roles: claims.roles,
            permissions,
        },
        db,
        context,
    })
}

/// Verifies the resolved tenant against the management directory and
/// binds the database handle to the directory's schema.
///
/// When the schema was named directly via the privileged header it must
/// match the directory entry; a disagreement is an isolation violation.
pub(crate) async fn resolve_tenant_db(
    state: &AppState,
    context: &Arc<RequestContext>,
) -> Result<(TenantRecord, Database), Error> {
    let record = state
        .tenant_directory
        .lookup(state.db.pool(), &context.tenant_id)
        .await?
        .ok_or(TenantUnresolved)?;

    if record.is_suspended() {
        return Err(TenantSuspended.into());
    }

    if context.schema_from_header && record.schema_name != context.schema_name {
        state.red_flags.raise(
            kinds::TENANT_ISOLATION_MISMATCH,
            Severity::P0,
            format!(
                "header named schema {} but tenant {} owns {}",
                context.schema_name, record.tenant_id, record.schema_name
            ),
            Some(&context.tenant_id),
            None,
            None,
        );
        return Err(TenantMismatch.into());
    }

    let db = state.db.build_for(&record.schema_name);
    Ok((record, db))
}

fn is_password_change_exempt(path: &str) -> bool {
    matches!(
        path,
        "/api/v1/tenant/auth/password" | "/api/v1/tenant/auth/logout"
    )
}

fn bearer_token_from_http(request: &HttpRequest) -> Option<&str> {
    request
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_change_exemptions() {
        assert!(is_password_change_exempt("/api/v1/tenant/auth/password"));
        assert!(is_password_change_exempt("/api/v1/tenant/auth/logout"));
        assert!(!is_password_change_exempt("/api/v2/school/fees/payments"));
        assert!(!is_password_change_exempt("/api/v1/tenant/auth/me"));
    }
}
