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

use std::{fmt::Display, str::FromStr, time::Duration};

use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgConnectOptions, Pool, Postgres, Transaction, Type};
use thiserror::Error;

use crate::{request::TenantId, serde::serialize_redacted};

pub type Client = Pool<Postgres>;

/// Configuration for connection to postgres
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The default base url.
    ///
    /// Passwords in the URL will be ignored, do not set the
    /// db password with the db url.
    base_url: String,

    /// Override port from base url.
    port: Option<u16>,

    /// Override user from base url.
    user: Option<String>,

    /// Sets the password.
    #[serde(serialize_with = "serialize_redacted")]
    password: Secret<String>,

    /// Override db from base url.
    db: Option<String>,

    /// Override default application name from base url.
    application_name: Option<String>,

    /// If true skips running db migrations on start up.
    pub skip_migrations: bool,

    /// Upper bound of connections in the shared pool.
    pub max_pool_size: u8,

    /// Number of connections the pool keeps open preemptively.
    pub min_pool_size: u8,

    /// Seconds to wait for a free connection before giving up.
    pub acquire_timeout_secs: u64,

    /// Seconds an idle connection is kept before being closed.
    pub idle_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "postgres://user:pw@localhost:5432/campus".into(),
            port: None,
            user: None,
            password: String::from("pw").into(),
            db: None,
            application_name: option_env!("CARGO_BIN_NAME").map(|name| format!("campus-{name}")),
            skip_migrations: false,
            max_pool_size: 20,
            min_pool_size: 5,
            acquire_timeout_secs: 60,
            idle_timeout_secs: 10,
        }
    }
}

impl Config {
    pub fn to_connection_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        let Self {
            base_url,
            port,
            user,
            password,
            db,
            application_name,
            ..
        } = self;

        let mut options = base_url
            .parse::<PgConnectOptions>()?
            .password(password.expose_secret());

        if let Some(user) = user {
            options = options.username(user);
        }
        if let Some(port) = port {
            options = options.port(*port);
        }
        if let Some(db) = db {
            options = options.database(db);
        }
        if let Some(application_name) = application_name {
            options = options.application_name(application_name);
        }

        Ok(options)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// A validated per-tenant schema name.
///
/// Every externally supplied schema name must pass through this type
/// before it gets anywhere near DDL/DML. The whitelist is deliberately
/// narrower than what postgres would accept for a quoted identifier:
/// `^[a-z_][a-z0-9_]{0,62}$`.
///
/// If displayed (e.g. `.to_string()`) quotes (`"`) will be included,
/// which makes it safe to splice into statements where `$` bindings
/// are not supported (`SET search_path TO ...`, `CREATE SCHEMA ...`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaName(String);

impl SchemaName {
    pub fn as_unquoted_str(&self) -> &str {
        &self.0
    }

    /// Derives the schema name owned by a tenant.
    ///
    /// Tenant ids allow `-` which schema names do not, those are folded
    /// to `_`.
    pub fn for_tenant_id(tenant_id: &TenantId) -> Self {
        let name = format!("t_{}", tenant_id.as_ref().replace('-', "_"));
        name.try_into()
            .unwrap(/* tenant ids are a subset of valid schema names */)
    }
}

impl FromStr for SchemaName {
    type Err = InvalidSchemaName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_owned().try_into()
    }
}

impl TryFrom<String> for SchemaName {
    type Error = InvalidSchemaName;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").unwrap());
        if RE.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(InvalidSchemaName { name })
        }
    }
}

impl From<SchemaName> for String {
    fn from(name: SchemaName) -> Self {
        name.0
    }
}

impl Display for SchemaName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

#[derive(Debug, Error)]
#[error("String is not a valid schema name: {name:?}")]
pub struct InvalidSchemaName {
    name: String,
}

/// A quoted postgres identifier.
///
/// Like [`SchemaName`] but for identifiers which are not schema names
/// (roles, index names). We only allow printable us-ascii characters
/// excluding `"`; this is stricter than postgres itself.
#[derive(Debug, Clone, Type)]
#[sqlx(transparent)]
pub struct QuotedIdentifier(String);

impl QuotedIdentifier {
    pub fn as_unquoted_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for QuotedIdentifier {
    type Err = InvalidQuotedIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_owned().try_into()
    }
}

impl TryFrom<String> for QuotedIdentifier {
    type Error = InvalidQuotedIdentifier;

    fn try_from(identifier: String) -> Result<Self, Self::Error> {
        static RE: Lazy<Regex> = Lazy::new(|| {
            // printable us-ascii excluding `"`
            Regex::new(r#"^[[:print:]&&[^"]]{1,63}$"#).unwrap()
        });
        if RE.is_match(&identifier) {
            Ok(Self(identifier))
        } else {
            Err(InvalidQuotedIdentifier { identifier })
        }
    }
}

impl Display for QuotedIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

#[derive(Debug, Error)]
#[error("String is not a supported quoted identifier: {identifier:?}")]
pub struct InvalidQuotedIdentifier {
    identifier: String,
}

/// Use a xact lock on given `id`.
///
/// # Warning
///
/// The lock id namespace is per-database global
/// and 64bit. This means this lock functions
/// shares the id-space with any other transaction
/// lock space.
pub async fn lock_id_until_end_of_transaction(
    tx: &'_ mut Transaction<'_, Postgres>,
    lock_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(lock_id)
        .execute(tx)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str;

    use super::*;

    #[test]
    fn test_schema_name_whitelist() {
        assert!(SchemaName::from_str("").is_err());
        assert!(SchemaName::from_str("demo").is_ok());
        assert!(SchemaName::from_str("_private").is_ok());
        assert!(SchemaName::from_str("t_green_valley").is_ok());
        assert!(SchemaName::from_str("0leading_digit").is_err());
        assert!(SchemaName::from_str("Upper").is_err());
        assert!(SchemaName::from_str("has-dash").is_err());
        assert!(SchemaName::from_str("inject\"; DROP SCHEMA public;--").is_err());
        assert!(SchemaName::from_str(str::from_utf8(&[b'a'; 63]).unwrap()).is_ok());
        assert!(SchemaName::from_str(str::from_utf8(&[b'a'; 64]).unwrap()).is_err());
    }

    #[test]
    fn test_schema_name_for_tenant_id() {
        let tenant_id = "green-valley".parse::<TenantId>().unwrap();
        assert_eq!(
            SchemaName::for_tenant_id(&tenant_id).as_unquoted_str(),
            "t_green_valley"
        );
    }

    #[test]
    fn test_format_schema_name_is_quoted() {
        assert_eq!(SchemaName::from_str("demo").unwrap().to_string(), "\"demo\"");
    }

    #[test]
    fn test_quoted_identifier_parsing() {
        assert!(QuotedIdentifier::from_str("").is_err());
        assert!(QuotedIdentifier::from_str(str::from_utf8(&[0x41; 63]).unwrap()).is_ok());
        assert!(QuotedIdentifier::from_str(str::from_utf8(&[0x41; 64]).unwrap()).is_err());
        for chr in ' '..='~' {
            assert_eq!(
                QuotedIdentifier::try_from(format!("{chr}")).is_ok(),
                chr != '"'
            );
        }
    }
}
