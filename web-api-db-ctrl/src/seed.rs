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

//! Baseline seed data for a freshly materialized tenant schema.
//!
//! Seeds are upserts keyed on `(id)` with fixed UUIDs for the
//! well-known rows, so re-running a provision never duplicates them.

use sqlx::{Executor, PgConnection, Postgres, Transaction};
use tracing::{info, instrument};
use uuid::{uuid, Uuid};

use campus_web_api_shared::postgres::SchemaName;

pub const ADMIN_ROLE_ID: Uuid = uuid!("00000000-0000-0000-0000-000000000001");
pub const TEACHER_ROLE_ID: Uuid = uuid!("00000000-0000-0000-0000-000000000002");
pub const STUDENT_ROLE_ID: Uuid = uuid!("00000000-0000-0000-0000-000000000003");
const ATTENDANCE_SETTINGS_ID: Uuid = uuid!("00000000-0000-0000-0000-00000000a001");

struct RoleSeed {
    id: Uuid,
    name: &'static str,
    slug: &'static str,
    role_type: &'static str,
    is_system: bool,
    permissions: &'static [&'static str],
}

const ROLE_SEEDS: &[RoleSeed] = &[
    RoleSeed {
        id: ADMIN_ROLE_ID,
        name: "Admin",
        slug: "admin",
        role_type: "system",
        is_system: true,
        permissions: &["*"],
    },
    RoleSeed {
        id: TEACHER_ROLE_ID,
        name: "Teacher",
        slug: "teacher",
        role_type: "staff",
        is_system: false,
        permissions: &[
            "academics.students.view",
            "academics.attendance.mark",
            "academics.attendance.view",
            "academics.marks.enter",
            "academics.marks.view",
            "academics.assignments.manage",
        ],
    },
    RoleSeed {
        id: STUDENT_ROLE_ID,
        name: "Student",
        slug: "student",
        role_type: "student",
        is_system: false,
        permissions: &[
            "academics.attendance.view_own",
            "academics.marks.view_own",
            "fees.view_own",
        ],
    },
];

/// Academic defaults every school starts with.
const DEFAULT_GRADE_SCALE: &[(&str, &str, &str, &str)] = &[
    ("91", "100", "A1", "10.0"),
    ("81", "90", "A2", "9.0"),
    ("71", "80", "B1", "8.0"),
    ("61", "70", "B2", "7.0"),
    ("51", "60", "C1", "6.0"),
    ("41", "50", "C2", "5.0"),
    ("33", "40", "D", "4.0"),
    ("0", "32", "E", "0.0"),
];

#[derive(Debug, Default)]
pub struct SeedReport {
    pub roles_inserted: u64,
    pub permissions_inserted: u64,
    pub attendance_settings_inserted: u64,
    pub grade_scales_inserted: u64,
}

impl SeedReport {
    pub fn total_inserted(&self) -> u64 {
        self.roles_inserted
            + self.permissions_inserted
            + self.attendance_settings_inserted
            + self.grade_scales_inserted
    }
}

/// Inserts the baseline rows into the tenant schema bound via search path.
#[instrument(skip(tx), err)]
pub async fn seed_tenant_defaults(
    tx: &mut Transaction<'_, Postgres>,
    schema: &SchemaName,
) -> Result<SeedReport, sqlx::Error> {
    let query = format!("SET LOCAL search_path TO {schema};");
    tx.execute(query.as_str()).await?;

    let mut report = SeedReport::default();

    for role in ROLE_SEEDS {
        let result = sqlx::query(
            "INSERT INTO roles (id, name, slug, role_type, is_system)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO NOTHING;",
        )
        .bind(role.id)
        .bind(role.name)
        .bind(role.slug)
        .bind(role.role_type)
        .bind(role.is_system)
        .execute(&mut *tx)
        .await?;
        report.roles_inserted += result.rows_affected();

        for permission in role.permissions {
            let result = sqlx::query(
                "INSERT INTO role_permissions (role_id, permission_key)
                    VALUES ($1, $2)
                    ON CONFLICT DO NOTHING;",
            )
            .bind(role.id)
            .bind(permission)
            .execute(&mut *tx)
            .await?;
            report.permissions_inserted += result.rows_affected();
        }
    }

    let institution_id = lookup_institution_id(tx, schema).await?;
    let result = sqlx::query(
        "INSERT INTO attendance_settings (id, institution_id)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING;",
    )
    .bind(ATTENDANCE_SETTINGS_ID)
    .bind(institution_id)
    .execute(&mut *tx)
    .await?;
    report.attendance_settings_inserted = result.rows_affected();

    for (index, (min, max, grade, point)) in DEFAULT_GRADE_SCALE.iter().enumerate() {
        // deterministic ids so the upsert key stays (id)
        let id = Uuid::from_u128(0xb000 + index as u128);
        let result = sqlx::query(
            "INSERT INTO grade_scales (id, name, min_percent, max_percent, grade, grade_point)
                VALUES ($1, 'default', $2::numeric, $3::numeric, $4, $5::numeric)
                ON CONFLICT (id) DO NOTHING;",
        )
        .bind(id)
        .bind(min)
        .bind(max)
        .bind(grade)
        .bind(point)
        .execute(&mut *tx)
        .await?;
        report.grade_scales_inserted += result.rows_affected();
    }

    info!(
        roles = report.roles_inserted,
        permissions = report.permissions_inserted,
        "tenant defaults seeded"
    );
    Ok(report)
}

async fn lookup_institution_id(
    conn: &mut PgConnection,
    schema: &SchemaName,
) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_as::<_, (Uuid,)>(
        "SELECT id FROM public.institutions WHERE schema_name = $1;",
    )
    .bind(schema.as_unquoted_str())
    .fetch_optional(conn)
    .await
    .map(|row| row.map(|(id,)| id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_role_ids_are_distinct() {
        assert_ne!(ADMIN_ROLE_ID, TEACHER_ROLE_ID);
        assert_ne!(TEACHER_ROLE_ID, STUDENT_ROLE_ID);
    }

    #[test]
    fn test_only_admin_is_a_system_role() {
        let system_roles = ROLE_SEEDS
            .iter()
            .filter(|role| role.is_system)
            .collect::<Vec<_>>();
        assert_eq!(system_roles.len(), 1);
        assert_eq!(system_roles[0].slug, "admin");
        assert_eq!(system_roles[0].permissions, ["*"]);
    }

    #[test]
    fn test_grade_scale_covers_zero_to_hundred() {
        assert_eq!(DEFAULT_GRADE_SCALE.first().unwrap().1, "100");
        assert_eq!(DEFAULT_GRADE_SCALE.last().unwrap().0, "0");
    }
}
