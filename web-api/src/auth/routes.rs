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

use actix_web::{
    web::{self, Data, Json, ServiceConfig},
    HttpRequest,
    HttpResponse,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::{
    app::AppState,
    auth::{password, resolve_tenant_db, store, tokens::TokenKind, Auth},
    error::common::{BadRequest, CredentialExpired, InvalidCredentials, RateLimited},
    middleware::request_context::RequestContext,
    observability::{metrics::counters, redflags},
    response,
    Error,
};

// mounted under the `/api` scope
pub(crate) fn configure_service(config: &mut ServiceConfig) {
    config.service(
        web::scope("/v1/tenant/auth")
            .route("/login", web::post().to(login))
            .route("/refresh", web::post().to(refresh))
            .route("/logout", web::post().to(logout))
            .route("/password", web::post().to(change_password))
            .route("/me", web::get().to(me)),
    );
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login(
    request: HttpRequest,
    state: Data<AppState>,
    body: Json<LoginRequest>,
) -> Result<HttpResponse, Error> {
    let context = RequestContext::try_extract_from_request(&request, Clone::clone)
        .map_err(|_| crate::error::common::TenantBindingMissing)?;
    let (_record, db) = resolve_tenant_db(&state, &context).await?;

    let ip = request
        .connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_owned();
    state
        .rate_limits
        .check_login_failures(&ip)
        .map_err(|_| RateLimited)?;

    let user = match store::find_user_by_email(&db, &body.email).await? {
        Some(user) if user.is_active => user,
        _ => return Err(login_failure(&state, &ip)),
    };
    if !password::verify_password(&body.password, &user.password_hash) {
        return Err(login_failure(&state, &ip));
    }

    let roles = store::user_role_slugs(&db, user.id).await?;
    let session_id = Uuid::new_v4();

    let refresh = state.tokens.issue(
        TokenKind::Refresh,
        user.id,
        &context.tenant_id,
        session_id,
        roles.clone(),
        user.must_change_password,
    )?;
    let access = state.tokens.issue(
        TokenKind::Access,
        user.id,
        &context.tenant_id,
        session_id,
        roles.clone(),
        user.must_change_password,
    )?;

    store::create_session(
        &db,
        session_id,
        user.id,
        &store::hash_refresh_token(&refresh.token),
        refresh.expires_in_secs,
        request
            .headers()
            .get(actix_web::http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok()),
        Some(&ip),
    )
    .await?;
    store::record_login(&db, user.id).await?;

    info!(user_id = %user.id, "login succeeded");
    Ok(response::ok(json!({
        "accessToken": access.token,
        "expiresIn": access.expires_in_secs,
        "refreshToken": refresh.token,
        "mustChangePassword": user.must_change_password,
        "user": {
            "id": user.id,
            "email": user.email,
            "firstName": user.first_name,
            "lastName": user.last_name,
            "roles": roles,
        },
    })))
}

fn login_failure(state: &AppState, ip: &str) -> Error {
    state.rate_limits.record_login_failure(ip);
    state.metrics.increment(counters::AUTH_LOGIN_FAILURES);
    redflags::evaluate_thresholds(&state.metrics, &state.red_flags);
    InvalidCredentials.into()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: String,
}

async fn refresh(
    request: HttpRequest,
    state: Data<AppState>,
    body: Json<RefreshRequest>,
) -> Result<HttpResponse, Error> {
    let context = RequestContext::try_extract_from_request(&request, Clone::clone)
        .map_err(|_| crate::error::common::TenantBindingMissing)?;
    let (_record, db) = resolve_tenant_db(&state, &context).await?;

    let claims = state.tokens.verify(&body.refresh_token, TokenKind::Refresh)?;
    if claims.tenant_id != context.tenant_id.to_string() {
        return Err(CredentialExpired.into());
    }

    let session = store::find_session(&db, claims.session_id)
        .await?
        .ok_or(CredentialExpired)?;
    if !session.is_usable()
        || session.user_id != claims.sub
        || session.refresh_token_hash != store::hash_refresh_token(&body.refresh_token)
    {
        return Err(CredentialExpired.into());
    }

    let access = state.tokens.issue(
        TokenKind::Access,
        claims.sub,
        &context.tenant_id,
        claims.session_id,
        claims.roles,
        claims.must_change_password,
    )?;

    Ok(response::ok(json!({
        "accessToken": access.token,
        "expiresIn": access.expires_in_secs,
    })))
}

async fn logout(auth: Auth) -> Result<HttpResponse, Error> {
    store::revoke_session(&auth.db, auth.actor.session_id).await?;
    info!(user_id = %auth.actor.user_id, "logout");
    Ok(response::ok_with_message("logged out", json!(null)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

async fn change_password(
    auth: Auth,
    state: Data<AppState>,
    body: Json<ChangePasswordRequest>,
) -> Result<HttpResponse, Error> {
    if body.new_password.len() < 8 {
        return Err(BadRequest::from("password must be at least 8 characters").into());
    }

    let user = store::find_user_by_id(&auth.db, auth.actor.user_id)
        .await?
        .ok_or(CredentialExpired)?;
    if !password::verify_password(&body.current_password, &user.password_hash) {
        return Err(InvalidCredentials.into());
    }

    let new_hash = password::hash_password(&body.new_password)?;
    store::change_password(&auth.db, user.id, auth.actor.session_id, &new_hash).await?;
    state
        .rbac
        .invalidate_user(&auth.actor.tenant_id, user.id);

    info!(user_id = %user.id, "password changed, other sessions revoked");
    Ok(response::ok_with_message("password changed", json!(null)))
}

async fn me(auth: Auth) -> Result<HttpResponse, Error> {
    Ok(response::ok(json!({
        "id": auth.actor.user_id,
        "tenantId": auth.actor.tenant_id,
        "roles": auth.actor.roles,
        "permissions": auth.actor.permissions.keys().collect::<Vec<_>>(),
    })))
}
