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

//! Structural migrations applied on top of the blueprint.
//!
//! Scripts run in declaration order with the search path bound to the
//! tenant schema. A `${SCHEMA_NAME}` placeholder in the script text is
//! substituted with the quoted schema identifier. Scripts declaring
//! concurrent index creation cannot run inside a transaction; they are
//! split into single statements and executed on a plain connection.

use sqlx::{Connection, Executor, PgConnection};
use tracing::{info, instrument, warn};

use campus_web_api_shared::postgres::SchemaName;

pub struct MigrationScript {
    pub name: &'static str,
    pub sql: &'static str,
    /// Set for scripts containing `CREATE INDEX CONCURRENTLY`.
    pub concurrent: bool,
}

pub const TENANT_MIGRATIONS: &[MigrationScript] = &[
    MigrationScript {
        name: "0001_users_locale",
        sql: "ALTER TABLE users ADD COLUMN locale text NOT NULL DEFAULT 'en';",
        concurrent: false,
    },
    MigrationScript {
        name: "0002_payment_mode_check",
        sql: r#"ALTER TABLE fee_payments
            ADD CONSTRAINT fee_payments_mode_check
            CHECK (mode IN ('cash', 'card', 'upi', 'bank_transfer', 'cheque'));"#,
        concurrent: false,
    },
    MigrationScript {
        name: "0003_attendance_status_check",
        sql: r#"ALTER TABLE student_attendance
            ADD CONSTRAINT student_attendance_status_check
            CHECK (status IN ('present', 'absent', 'late', 'half_day', 'excused'));"#,
        concurrent: false,
    },
    MigrationScript {
        name: "0004_session_expiry_index",
        sql: r#"CREATE INDEX CONCURRENTLY IF NOT EXISTS sessions_expires_at_idx
                ON ${SCHEMA_NAME}.sessions (expires_at);
            CREATE INDEX CONCURRENTLY IF NOT EXISTS fee_payments_student_session_idx
                ON ${SCHEMA_NAME}.fee_payments (student_id, academic_session_id);
            CREATE INDEX CONCURRENTLY IF NOT EXISTS student_attendance_date_idx
                ON ${SCHEMA_NAME}.student_attendance (attendance_date);"#,
        concurrent: true,
    },
    MigrationScript {
        name: "0005_audit_log_entity_index",
        sql: "CREATE INDEX IF NOT EXISTS audit_logs_entity_idx ON audit_logs (entity, entity_id);",
        concurrent: false,
    },
    MigrationScript {
        name: "0006_enrollment_status_check",
        sql: r#"ALTER TABLE enrollments
            ADD CONSTRAINT enrollments_status_check
            CHECK (status IN ('active', 'transferred', 'withdrawn', 'passed_out'));"#,
        concurrent: false,
    },
];

#[derive(Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    Applied,
    AlreadyApplied,
}

// duplicate_column, duplicate_object, duplicate_table, duplicate_function
const ALREADY_APPLIED_SQLSTATES: &[&str] = &["42701", "42710", "42P07", "42723"];

fn is_already_applied(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_error) => db_error
            .code()
            .map(|code| ALREADY_APPLIED_SQLSTATES.contains(&&*code))
            .unwrap_or(false),
        _ => false,
    }
}

/// Substitutes `${SCHEMA_NAME}` with the quoted schema identifier.
pub fn bind_schema(sql: &str, schema: &SchemaName) -> String {
    sql.replace("${SCHEMA_NAME}", &schema.to_string())
}

/// Runs all migration scripts against the given tenant schema.
///
/// Returns the outcome per script in declaration order.
#[instrument(skip(conn), err)]
pub async fn run_tenant_migrations(
    conn: &mut PgConnection,
    schema: &SchemaName,
) -> Result<Vec<(&'static str, MigrationOutcome)>, sqlx::Error> {
    let mut outcomes = Vec::with_capacity(TENANT_MIGRATIONS.len());
    for script in TENANT_MIGRATIONS {
        let outcome = if script.concurrent {
            run_concurrent_script(conn, schema, script).await?
        } else {
            run_transactional_script(conn, schema, script).await?
        };
        info!(migration = script.name, ?outcome, "migration finished");
        outcomes.push((script.name, outcome));
    }
    Ok(outcomes)
}

async fn run_transactional_script(
    conn: &mut PgConnection,
    schema: &SchemaName,
    script: &MigrationScript,
) -> Result<MigrationOutcome, sqlx::Error> {
    let mut tx = conn.begin().await?;
    let query = format!("SET LOCAL search_path TO {schema};");
    tx.execute(query.as_str()).await?;

    match tx.execute(bind_schema(script.sql, schema).as_str()).await {
        Ok(_) => {
            tx.commit().await?;
            Ok(MigrationOutcome::Applied)
        }
        Err(error) if is_already_applied(&error) => {
            tx.rollback().await?;
            Ok(MigrationOutcome::AlreadyApplied)
        }
        Err(error) => {
            tx.rollback().await?;
            Err(error)
        }
    }
}

async fn run_concurrent_script(
    conn: &mut PgConnection,
    schema: &SchemaName,
    script: &MigrationScript,
) -> Result<MigrationOutcome, sqlx::Error> {
    let query = format!("SET search_path TO {schema}, public;");
    conn.execute(query.as_str()).await?;

    let mut any_applied = false;
    for statement in split_statements(&bind_schema(script.sql, schema)) {
        match conn.execute(statement.as_str()).await {
            Ok(_) => any_applied = true,
            Err(error) if is_already_applied(&error) => {
                warn!(migration = script.name, %error, "statement already applied");
            }
            Err(error) => return Err(error),
        }
    }

    Ok(if any_applied {
        MigrationOutcome::Applied
    } else {
        MigrationOutcome::AlreadyApplied
    })
}

/// Splits a script into single statements on `;` boundaries.
///
/// Good enough for our migration set: no literals containing `;`.
fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_bind_schema_substitutes_quoted_identifier() {
        let schema = SchemaName::from_str("t_demo").unwrap();
        let bound = bind_schema("CREATE INDEX i ON ${SCHEMA_NAME}.users (email);", &schema);
        assert_eq!(bound, "CREATE INDEX i ON \"t_demo\".users (email);");
    }

    #[test]
    fn test_split_statements_drops_empty_tails() {
        let statements = split_statements("SELECT 1;\n  SELECT 2;  \n;");
        assert_eq!(statements, vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn test_concurrent_scripts_are_flagged() {
        for script in TENANT_MIGRATIONS {
            assert_eq!(
                script.sql.contains("CONCURRENTLY"),
                script.concurrent,
                "concurrent flag mismatch on {}",
                script.name
            );
        }
    }

    #[test]
    fn test_migration_names_are_ordered_and_unique() {
        let names = TENANT_MIGRATIONS
            .iter()
            .map(|script| script.name)
            .collect::<Vec<_>>();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names, sorted);
    }
}
