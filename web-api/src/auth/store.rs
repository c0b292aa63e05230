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

//! User/session queries against the bound tenant schema.

use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

use crate::{storage::Database, Error};

#[derive(Debug, FromRow)]
pub(crate) struct UserRecord {
    pub(crate) id: Uuid,
    pub(crate) institution_id: Uuid,
    pub(crate) email: String,
    pub(crate) password_hash: String,
    pub(crate) first_name: String,
    pub(crate) last_name: String,
    pub(crate) is_active: bool,
    pub(crate) must_change_password: bool,
}

#[derive(Debug, FromRow)]
pub(crate) struct SessionRecord {
    pub(crate) id: Uuid,
    pub(crate) user_id: Uuid,
    pub(crate) refresh_token_hash: String,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) revoked_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub(crate) fn is_usable(&self) -> bool {
        self.revoked_at.is_none() && self.expires_at > Utc::now()
    }
}

pub(crate) fn hash_refresh_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
        out
    })
}

pub(crate) async fn find_user_by_email(
    db: &Database,
    email: &str,
) -> Result<Option<UserRecord>, Error> {
    let started = Instant::now();
    let mut conn = db.acquire().await?;
    let user = sqlx::query_as::<_, UserRecord>(
        "SELECT id, institution_id, email, password_hash, first_name, last_name,
                is_active, must_change_password
            FROM users
            WHERE lower(email) = lower($1);",
    )
    .bind(email)
    .fetch_optional(&mut conn)
    .await?;
    db.observe_query(started);
    Ok(user)
}

pub(crate) async fn find_user_by_id(
    db: &Database,
    user_id: Uuid,
) -> Result<Option<UserRecord>, Error> {
    let started = Instant::now();
    let mut conn = db.acquire().await?;
    let user = sqlx::query_as::<_, UserRecord>(
        "SELECT id, institution_id, email, password_hash, first_name, last_name,
                is_active, must_change_password
            FROM users
            WHERE id = $1;",
    )
    .bind(user_id)
    .fetch_optional(&mut conn)
    .await?;
    db.observe_query(started);
    Ok(user)
}

pub(crate) async fn user_role_slugs(db: &Database, user_id: Uuid) -> Result<Vec<String>, Error> {
    let started = Instant::now();
    let mut conn = db.acquire().await?;
    let roles = sqlx::query_as::<_, (String,)>(
        "SELECT r.slug
            FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            WHERE ur.user_id = $1
            ORDER BY r.slug;",
    )
    .bind(user_id)
    .fetch_all(&mut conn)
    .await?;
    db.observe_query(started);
    Ok(roles.into_iter().map(|(slug,)| slug).collect())
}

pub(crate) async fn create_session(
    db: &Database,
    session_id: Uuid,
    user_id: Uuid,
    refresh_token_hash: &str,
    ttl_secs: i64,
    user_agent: Option<&str>,
    ip: Option<&str>,
) -> Result<(), Error> {
    let started = Instant::now();
    let mut conn = db.acquire().await?;
    sqlx::query(
        "INSERT INTO sessions (id, user_id, refresh_token_hash, expires_at, user_agent, ip)
            VALUES ($1, $2, $3, $4, $5, $6);",
    )
    .bind(session_id)
    .bind(user_id)
    .bind(refresh_token_hash)
    .bind(Utc::now() + Duration::seconds(ttl_secs))
    .bind(user_agent)
    .bind(ip)
    .execute(&mut conn)
    .await?;
    db.observe_query(started);
    Ok(())
}

pub(crate) async fn find_session(
    db: &Database,
    session_id: Uuid,
) -> Result<Option<SessionRecord>, Error> {
    let started = Instant::now();
    let mut conn = db.acquire().await?;
    let session = sqlx::query_as::<_, SessionRecord>(
        "SELECT id, user_id, refresh_token_hash, expires_at, revoked_at
            FROM sessions
            WHERE id = $1;",
    )
    .bind(session_id)
    .fetch_optional(&mut conn)
    .await?;
    db.observe_query(started);
    Ok(session)
}

pub(crate) async fn revoke_session(db: &Database, session_id: Uuid) -> Result<(), Error> {
    let started = Instant::now();
    let mut conn = db.acquire().await?;
    sqlx::query("UPDATE sessions SET revoked_at = now() WHERE id = $1 AND revoked_at IS NULL;")
        .bind(session_id)
        .execute(&mut conn)
        .await?;
    db.observe_query(started);
    Ok(())
}

pub(crate) async fn revoke_other_sessions(
    db: &Database,
    user_id: Uuid,
    keep_session_id: Uuid,
) -> Result<u64, Error> {
    let started = Instant::now();
    let mut conn = db.acquire().await?;
    let result = sqlx::query(
        "UPDATE sessions
            SET revoked_at = now()
            WHERE user_id = $1 AND id <> $2 AND revoked_at IS NULL;",
    )
    .bind(user_id)
    .bind(keep_session_id)
    .execute(&mut conn)
    .await?;
    db.observe_query(started);
    Ok(result.rows_affected())
}

pub(crate) async fn record_login(db: &Database, user_id: Uuid) -> Result<(), Error> {
    let started = Instant::now();
    let mut conn = db.acquire().await?;
    sqlx::query("UPDATE users SET last_login_at = now() WHERE id = $1;")
        .bind(user_id)
        .execute(&mut conn)
        .await?;
    db.observe_query(started);
    Ok(())
}

/// Password change runs in one transaction with the session revocation
/// so a failure cannot leave the old sessions alive on a new password.
pub(crate) async fn change_password(
    db: &Database,
    user_id: Uuid,
    keep_session_id: Uuid,
    new_password_hash: &str,
) -> Result<(), Error> {
    let started = Instant::now();
    let mut tx = db.begin().await?;
    sqlx::query(
        "UPDATE users
            SET password_hash = $2, must_change_password = false, updated_at = now()
            WHERE id = $1;",
    )
    .bind(user_id)
    .bind(new_password_hash)
    .execute(&mut tx)
    .await?;
    sqlx::query(
        "UPDATE sessions
            SET revoked_at = now()
            WHERE user_id = $1 AND id <> $2 AND revoked_at IS NULL;",
    )
    .bind(user_id)
    .bind(keep_session_id)
    .execute(&mut tx)
    .await?;
    tx.commit().await?;
    db.observe_query(started);
    Ok(())
}

/// Active users holding the system admin role.
pub(crate) async fn count_active_admins(db: &Database) -> Result<i64, Error> {
    let started = Instant::now();
    let mut conn = db.acquire().await?;
    let (count,) = sqlx::query_as::<_, (i64,)>(
        "SELECT count(*)
            FROM users u
            JOIN user_roles ur ON ur.user_id = u.id
            JOIN roles r ON r.id = ur.role_id
            WHERE r.slug = 'admin' AND r.is_system AND u.is_active;",
    )
    .fetch_one(&mut conn)
    .await?;
    db.observe_query(started);
    Ok(count)
}
