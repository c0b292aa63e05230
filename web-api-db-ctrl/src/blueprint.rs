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

//! The per-tenant schema blueprint.
//!
//! Tables are listed in dependency order; the provisioner materializes
//! them top to bottom with the search path bound to the tenant schema,
//! so the DDL stays unqualified. The only allowed cross-schema
//! reference is the `institution_id` pointer into `public.institutions`.

/// A single tenant-scoped table.
pub struct TableSpec {
    pub name: &'static str,
    pub ddl: &'static str,
}

/// Entity types owned by the global catalog, never materialized per tenant.
pub const GLOBAL_TABLES: &[&str] = &[
    "institutions",
    "plans",
    "modules",
    "features",
    "permissions",
    "role_templates",
];

/// Tables which must exist for a tenant to be declared live.
pub const CRITICAL_TABLES: &[&str] = &[
    "users",
    "roles",
    "user_roles",
    "user_permissions",
    "role_permissions",
    "students",
    "student_attendance",
    "attendance_settings",
    "classes",
    "sections",
    "subjects",
    "teachers",
    "academic_sessions",
    "exams",
    "marks",
];

/// A tenant is ready only when at least this many tables exist.
pub const MIN_READY_TABLE_COUNT: usize = 50;

macro_rules! table {
    ($name:literal, $ddl:literal) => {
        TableSpec {
            name: $name,
            ddl: $ddl,
        }
    };
}

pub const TENANT_TABLES: &[TableSpec] = &[
    // -- identity & access ------------------------------------------------
    table!(
        "users",
        r#"CREATE TABLE users (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            institution_id uuid NOT NULL REFERENCES public.institutions (id),
            email text NOT NULL UNIQUE,
            password_hash text NOT NULL,
            first_name text NOT NULL,
            last_name text NOT NULL DEFAULT '',
            phone text,
            is_active boolean NOT NULL DEFAULT true,
            must_change_password boolean NOT NULL DEFAULT false,
            last_login_at timestamptz,
            created_at timestamptz NOT NULL DEFAULT now(),
            updated_at timestamptz NOT NULL DEFAULT now()
        );"#
    ),
    table!(
        "roles",
        r#"CREATE TABLE roles (
            id uuid PRIMARY KEY,
            name text NOT NULL,
            slug text NOT NULL UNIQUE,
            role_type text NOT NULL DEFAULT 'custom',
            is_system boolean NOT NULL DEFAULT false,
            asset_type text,
            created_at timestamptz NOT NULL DEFAULT now()
        );"#
    ),
    table!(
        "user_roles",
        r#"CREATE TABLE user_roles (
            user_id uuid NOT NULL REFERENCES users (id) ON DELETE CASCADE,
            role_id uuid NOT NULL REFERENCES roles (id) ON DELETE CASCADE,
            assigned_at timestamptz NOT NULL DEFAULT now(),
            PRIMARY KEY (user_id, role_id)
        );"#
    ),
    table!(
        "role_permissions",
        r#"CREATE TABLE role_permissions (
            role_id uuid NOT NULL REFERENCES roles (id) ON DELETE CASCADE,
            permission_key text NOT NULL,
            granted_at timestamptz NOT NULL DEFAULT now(),
            PRIMARY KEY (role_id, permission_key)
        );"#
    ),
    table!(
        "user_permissions",
        r#"CREATE TABLE user_permissions (
            user_id uuid NOT NULL REFERENCES users (id) ON DELETE CASCADE,
            permission_key text NOT NULL,
            granted_at timestamptz NOT NULL DEFAULT now(),
            PRIMARY KEY (user_id, permission_key)
        );"#
    ),
    table!(
        "sessions",
        r#"CREATE TABLE sessions (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            user_id uuid NOT NULL REFERENCES users (id) ON DELETE CASCADE,
            refresh_token_hash text NOT NULL,
            issued_at timestamptz NOT NULL DEFAULT now(),
            expires_at timestamptz NOT NULL,
            revoked_at timestamptz,
            user_agent text,
            ip text
        );"#
    ),
    table!(
        "password_resets",
        r#"CREATE TABLE password_resets (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            user_id uuid NOT NULL REFERENCES users (id) ON DELETE CASCADE,
            token_hash text NOT NULL,
            expires_at timestamptz NOT NULL,
            used_at timestamptz
        );"#
    ),
    table!(
        "audit_logs",
        r#"CREATE TABLE audit_logs (
            id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            actor_id uuid,
            action text NOT NULL,
            entity text NOT NULL,
            entity_id text,
            old_values jsonb,
            new_values jsonb,
            request_id text,
            created_at timestamptz NOT NULL DEFAULT now()
        );"#
    ),
    // -- academic structure -----------------------------------------------
    table!(
        "academic_sessions",
        r#"CREATE TABLE academic_sessions (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            name text NOT NULL,
            starts_on date NOT NULL,
            ends_on date NOT NULL,
            is_current boolean NOT NULL DEFAULT false,
            created_at timestamptz NOT NULL DEFAULT now()
        );"#
    ),
    table!(
        "classes",
        r#"CREATE TABLE classes (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            name text NOT NULL,
            numeric_level smallint,
            display_order smallint NOT NULL DEFAULT 0,
            created_at timestamptz NOT NULL DEFAULT now()
        );"#
    ),
    table!(
        "sections",
        r#"CREATE TABLE sections (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            class_id uuid NOT NULL REFERENCES classes (id) ON DELETE CASCADE,
            name text NOT NULL,
            capacity smallint,
            UNIQUE (class_id, name)
        );"#
    ),
    table!(
        "subjects",
        r#"CREATE TABLE subjects (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            name text NOT NULL,
            code text NOT NULL UNIQUE,
            is_elective boolean NOT NULL DEFAULT false
        );"#
    ),
    table!(
        "class_subjects",
        r#"CREATE TABLE class_subjects (
            class_id uuid NOT NULL REFERENCES classes (id) ON DELETE CASCADE,
            subject_id uuid NOT NULL REFERENCES subjects (id) ON DELETE CASCADE,
            PRIMARY KEY (class_id, subject_id)
        );"#
    ),
    table!(
        "teachers",
        r#"CREATE TABLE teachers (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            user_id uuid NOT NULL UNIQUE REFERENCES users (id) ON DELETE CASCADE,
            employee_code text NOT NULL UNIQUE,
            joined_on date,
            qualification text,
            is_active boolean NOT NULL DEFAULT true
        );"#
    ),
    table!(
        "teacher_subjects",
        r#"CREATE TABLE teacher_subjects (
            teacher_id uuid NOT NULL REFERENCES teachers (id) ON DELETE CASCADE,
            subject_id uuid NOT NULL REFERENCES subjects (id) ON DELETE CASCADE,
            PRIMARY KEY (teacher_id, subject_id)
        );"#
    ),
    table!(
        "teacher_sections",
        r#"CREATE TABLE teacher_sections (
            teacher_id uuid NOT NULL REFERENCES teachers (id) ON DELETE CASCADE,
            section_id uuid NOT NULL REFERENCES sections (id) ON DELETE CASCADE,
            is_class_teacher boolean NOT NULL DEFAULT false,
            PRIMARY KEY (teacher_id, section_id)
        );"#
    ),
    table!(
        "student_categories",
        r#"CREATE TABLE student_categories (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            name text NOT NULL UNIQUE
        );"#
    ),
    table!(
        "students",
        r#"CREATE TABLE students (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            user_id uuid REFERENCES users (id) ON DELETE SET NULL,
            admission_number text NOT NULL UNIQUE,
            first_name text NOT NULL,
            last_name text NOT NULL DEFAULT '',
            date_of_birth date,
            gender text,
            category_id uuid REFERENCES student_categories (id),
            admitted_on date NOT NULL DEFAULT CURRENT_DATE,
            is_active boolean NOT NULL DEFAULT true,
            created_at timestamptz NOT NULL DEFAULT now(),
            updated_at timestamptz NOT NULL DEFAULT now()
        );"#
    ),
    table!(
        "guardians",
        r#"CREATE TABLE guardians (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            first_name text NOT NULL,
            last_name text NOT NULL DEFAULT '',
            relation text NOT NULL,
            phone text,
            email text,
            occupation text
        );"#
    ),
    table!(
        "student_guardians",
        r#"CREATE TABLE student_guardians (
            student_id uuid NOT NULL REFERENCES students (id) ON DELETE CASCADE,
            guardian_id uuid NOT NULL REFERENCES guardians (id) ON DELETE CASCADE,
            is_primary boolean NOT NULL DEFAULT false,
            PRIMARY KEY (student_id, guardian_id)
        );"#
    ),
    table!(
        "enrollments",
        r#"CREATE TABLE enrollments (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            student_id uuid NOT NULL REFERENCES students (id) ON DELETE CASCADE,
            section_id uuid NOT NULL REFERENCES sections (id),
            academic_session_id uuid NOT NULL REFERENCES academic_sessions (id),
            roll_number smallint,
            enrolled_on date NOT NULL DEFAULT CURRENT_DATE,
            status text NOT NULL DEFAULT 'active',
            UNIQUE (student_id, academic_session_id)
        );"#
    ),
    table!(
        "student_documents",
        r#"CREATE TABLE student_documents (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            student_id uuid NOT NULL REFERENCES students (id) ON DELETE CASCADE,
            kind text NOT NULL,
            file_path text NOT NULL,
            uploaded_at timestamptz NOT NULL DEFAULT now()
        );"#
    ),
    // -- attendance -------------------------------------------------------
    table!(
        "attendance_settings",
        r#"CREATE TABLE attendance_settings (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            institution_id uuid REFERENCES public.institutions (id),
            marking_mode text NOT NULL DEFAULT 'daily',
            late_after_minutes smallint NOT NULL DEFAULT 15,
            half_day_after_minutes smallint NOT NULL DEFAULT 240,
            lock_after_days smallint NOT NULL DEFAULT 7,
            notify_guardians boolean NOT NULL DEFAULT true
        );"#
    ),
    table!(
        "student_attendance",
        r#"CREATE TABLE student_attendance (
            id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            student_id uuid NOT NULL REFERENCES students (id) ON DELETE CASCADE,
            section_id uuid NOT NULL REFERENCES sections (id),
            attendance_date date NOT NULL,
            status text NOT NULL,
            remarks text,
            marked_by uuid REFERENCES users (id),
            marked_at timestamptz NOT NULL DEFAULT now(),
            UNIQUE (student_id, attendance_date)
        );"#
    ),
    table!(
        "teacher_attendance",
        r#"CREATE TABLE teacher_attendance (
            id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            teacher_id uuid NOT NULL REFERENCES teachers (id) ON DELETE CASCADE,
            attendance_date date NOT NULL,
            status text NOT NULL,
            marked_at timestamptz NOT NULL DEFAULT now(),
            UNIQUE (teacher_id, attendance_date)
        );"#
    ),
    table!(
        "leave_types",
        r#"CREATE TABLE leave_types (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            name text NOT NULL UNIQUE,
            max_days_per_year smallint
        );"#
    ),
    table!(
        "leave_applications",
        r#"CREATE TABLE leave_applications (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            applicant_id uuid NOT NULL REFERENCES users (id) ON DELETE CASCADE,
            leave_type_id uuid NOT NULL REFERENCES leave_types (id),
            starts_on date NOT NULL,
            ends_on date NOT NULL,
            reason text,
            status text NOT NULL DEFAULT 'pending',
            decided_by uuid REFERENCES users (id),
            decided_at timestamptz
        );"#
    ),
    // -- examinations -----------------------------------------------------
    table!(
        "grade_scales",
        r#"CREATE TABLE grade_scales (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            name text NOT NULL,
            min_percent numeric(5,2) NOT NULL,
            max_percent numeric(5,2) NOT NULL,
            grade text NOT NULL,
            grade_point numeric(4,2)
        );"#
    ),
    table!(
        "exams",
        r#"CREATE TABLE exams (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            academic_session_id uuid NOT NULL REFERENCES academic_sessions (id),
            name text NOT NULL,
            exam_type text NOT NULL DEFAULT 'term',
            starts_on date,
            ends_on date,
            is_published boolean NOT NULL DEFAULT false
        );"#
    ),
    table!(
        "exam_schedules",
        r#"CREATE TABLE exam_schedules (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            exam_id uuid NOT NULL REFERENCES exams (id) ON DELETE CASCADE,
            class_id uuid NOT NULL REFERENCES classes (id),
            subject_id uuid NOT NULL REFERENCES subjects (id),
            held_on date NOT NULL,
            max_marks numeric(6,2) NOT NULL,
            pass_marks numeric(6,2) NOT NULL
        );"#
    ),
    table!(
        "marks",
        r#"CREATE TABLE marks (
            id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            exam_schedule_id uuid NOT NULL REFERENCES exam_schedules (id) ON DELETE CASCADE,
            student_id uuid NOT NULL REFERENCES students (id) ON DELETE CASCADE,
            marks_obtained numeric(6,2),
            is_absent boolean NOT NULL DEFAULT false,
            remarks text,
            entered_by uuid REFERENCES users (id),
            entered_at timestamptz NOT NULL DEFAULT now(),
            UNIQUE (exam_schedule_id, student_id)
        );"#
    ),
    table!(
        "report_cards",
        r#"CREATE TABLE report_cards (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            student_id uuid NOT NULL REFERENCES students (id) ON DELETE CASCADE,
            academic_session_id uuid NOT NULL REFERENCES academic_sessions (id),
            exam_id uuid NOT NULL REFERENCES exams (id),
            total_marks numeric(8,2),
            percentage numeric(5,2),
            grade text,
            generated_at timestamptz NOT NULL DEFAULT now(),
            UNIQUE (student_id, exam_id)
        );"#
    ),
    // -- fees -------------------------------------------------------------
    table!(
        "fee_categories",
        r#"CREATE TABLE fee_categories (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            name text NOT NULL UNIQUE,
            is_refundable boolean NOT NULL DEFAULT false
        );"#
    ),
    table!(
        "fee_structures",
        r#"CREATE TABLE fee_structures (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            academic_session_id uuid NOT NULL REFERENCES academic_sessions (id),
            class_id uuid REFERENCES classes (id),
            name text NOT NULL,
            billing_cycle text NOT NULL DEFAULT 'monthly',
            due_day smallint NOT NULL DEFAULT 10,
            late_fee_per_day numeric(12,2) NOT NULL DEFAULT 0,
            created_at timestamptz NOT NULL DEFAULT now()
        );"#
    ),
    table!(
        "fee_structure_items",
        r#"CREATE TABLE fee_structure_items (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            fee_structure_id uuid NOT NULL REFERENCES fee_structures (id) ON DELETE CASCADE,
            fee_category_id uuid NOT NULL REFERENCES fee_categories (id),
            amount numeric(12,2) NOT NULL,
            UNIQUE (fee_structure_id, fee_category_id)
        );"#
    ),
    table!(
        "fee_discounts",
        r#"CREATE TABLE fee_discounts (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            name text NOT NULL,
            percent numeric(5,2),
            flat_amount numeric(12,2)
        );"#
    ),
    table!(
        "student_fee_assignments",
        r#"CREATE TABLE student_fee_assignments (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            student_id uuid NOT NULL REFERENCES students (id) ON DELETE CASCADE,
            fee_structure_id uuid NOT NULL REFERENCES fee_structures (id),
            academic_session_id uuid NOT NULL REFERENCES academic_sessions (id),
            discount_id uuid REFERENCES fee_discounts (id),
            final_amount numeric(12,2) NOT NULL,
            assigned_at timestamptz NOT NULL DEFAULT now(),
            UNIQUE (student_id, fee_structure_id, academic_session_id)
        );"#
    ),
    table!(
        "receipt_counters",
        r#"CREATE TABLE receipt_counters (
            institution_id uuid NOT NULL REFERENCES public.institutions (id),
            year integer NOT NULL,
            last_number integer NOT NULL DEFAULT 0,
            PRIMARY KEY (institution_id, year)
        );"#
    ),
    table!(
        "fee_payments",
        r#"CREATE TABLE fee_payments (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            institution_id uuid NOT NULL REFERENCES public.institutions (id),
            student_id uuid NOT NULL REFERENCES students (id),
            academic_session_id uuid NOT NULL REFERENCES academic_sessions (id),
            fee_structure_id uuid NOT NULL REFERENCES fee_structures (id),
            receipt_number text NOT NULL UNIQUE,
            amount_paid numeric(12,2) NOT NULL,
            late_fee numeric(12,2) NOT NULL DEFAULT 0,
            mode text NOT NULL,
            reference text,
            idempotency_key text UNIQUE,
            status text NOT NULL DEFAULT 'success',
            remarks text,
            voided_by uuid REFERENCES users (id),
            void_reason text,
            collected_by uuid REFERENCES users (id),
            paid_at timestamptz NOT NULL DEFAULT now()
        );"#
    ),
    table!(
        "fee_reminders",
        r#"CREATE TABLE fee_reminders (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            student_id uuid NOT NULL REFERENCES students (id) ON DELETE CASCADE,
            fee_structure_id uuid NOT NULL REFERENCES fee_structures (id),
            sent_at timestamptz NOT NULL DEFAULT now(),
            channel text NOT NULL
        );"#
    ),
    // -- timetable --------------------------------------------------------
    table!(
        "rooms",
        r#"CREATE TABLE rooms (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            name text NOT NULL UNIQUE,
            capacity smallint
        );"#
    ),
    table!(
        "timetable_slots",
        r#"CREATE TABLE timetable_slots (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            name text NOT NULL,
            starts_at time NOT NULL,
            ends_at time NOT NULL
        );"#
    ),
    table!(
        "timetables",
        r#"CREATE TABLE timetables (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            section_id uuid NOT NULL REFERENCES sections (id) ON DELETE CASCADE,
            subject_id uuid NOT NULL REFERENCES subjects (id),
            teacher_id uuid REFERENCES teachers (id),
            slot_id uuid NOT NULL REFERENCES timetable_slots (id),
            room_id uuid REFERENCES rooms (id),
            weekday smallint NOT NULL,
            UNIQUE (section_id, slot_id, weekday)
        );"#
    ),
    // -- communication ----------------------------------------------------
    table!(
        "notices",
        r#"CREATE TABLE notices (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            title text NOT NULL,
            body text NOT NULL,
            audience text NOT NULL DEFAULT 'all',
            published_by uuid REFERENCES users (id),
            published_at timestamptz NOT NULL DEFAULT now(),
            expires_at timestamptz
        );"#
    ),
    table!(
        "messages",
        r#"CREATE TABLE messages (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            sender_id uuid NOT NULL REFERENCES users (id),
            subject text NOT NULL,
            body text NOT NULL,
            sent_at timestamptz NOT NULL DEFAULT now()
        );"#
    ),
    table!(
        "message_recipients",
        r#"CREATE TABLE message_recipients (
            message_id uuid NOT NULL REFERENCES messages (id) ON DELETE CASCADE,
            recipient_id uuid NOT NULL REFERENCES users (id) ON DELETE CASCADE,
            read_at timestamptz,
            PRIMARY KEY (message_id, recipient_id)
        );"#
    ),
    table!(
        "notification_templates",
        r#"CREATE TABLE notification_templates (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            key text NOT NULL UNIQUE,
            channel text NOT NULL,
            subject text,
            body text NOT NULL
        );"#
    ),
    table!(
        "notification_logs",
        r#"CREATE TABLE notification_logs (
            id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            template_key text,
            recipient text NOT NULL,
            channel text NOT NULL,
            status text NOT NULL,
            job_id text,
            sent_at timestamptz NOT NULL DEFAULT now()
        );"#
    ),
    // -- homework ---------------------------------------------------------
    table!(
        "assignments",
        r#"CREATE TABLE assignments (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            section_id uuid NOT NULL REFERENCES sections (id) ON DELETE CASCADE,
            subject_id uuid NOT NULL REFERENCES subjects (id),
            teacher_id uuid REFERENCES teachers (id),
            title text NOT NULL,
            instructions text,
            due_on date,
            created_at timestamptz NOT NULL DEFAULT now()
        );"#
    ),
    table!(
        "assignment_submissions",
        r#"CREATE TABLE assignment_submissions (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            assignment_id uuid NOT NULL REFERENCES assignments (id) ON DELETE CASCADE,
            student_id uuid NOT NULL REFERENCES students (id) ON DELETE CASCADE,
            submitted_at timestamptz NOT NULL DEFAULT now(),
            file_path text,
            score numeric(6,2),
            feedback text,
            UNIQUE (assignment_id, student_id)
        );"#
    ),
    // -- library ----------------------------------------------------------
    table!(
        "library_books",
        r#"CREATE TABLE library_books (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            title text NOT NULL,
            author text,
            isbn text,
            copies_total smallint NOT NULL DEFAULT 1,
            copies_available smallint NOT NULL DEFAULT 1
        );"#
    ),
    table!(
        "book_issues",
        r#"CREATE TABLE book_issues (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            book_id uuid NOT NULL REFERENCES library_books (id),
            borrower_id uuid NOT NULL REFERENCES users (id),
            issued_on date NOT NULL DEFAULT CURRENT_DATE,
            due_on date NOT NULL,
            returned_on date,
            fine numeric(12,2)
        );"#
    ),
    // -- transport --------------------------------------------------------
    table!(
        "transport_routes",
        r#"CREATE TABLE transport_routes (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            name text NOT NULL UNIQUE,
            vehicle_number text,
            driver_name text,
            driver_phone text
        );"#
    ),
    table!(
        "transport_stops",
        r#"CREATE TABLE transport_stops (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            route_id uuid NOT NULL REFERENCES transport_routes (id) ON DELETE CASCADE,
            name text NOT NULL,
            pickup_time time,
            monthly_charge numeric(12,2)
        );"#
    ),
    table!(
        "student_transport",
        r#"CREATE TABLE student_transport (
            student_id uuid NOT NULL REFERENCES students (id) ON DELETE CASCADE,
            stop_id uuid NOT NULL REFERENCES transport_stops (id),
            effective_from date NOT NULL DEFAULT CURRENT_DATE,
            PRIMARY KEY (student_id, stop_id)
        );"#
    ),
    // -- hostel -----------------------------------------------------------
    table!(
        "hostels",
        r#"CREATE TABLE hostels (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            name text NOT NULL UNIQUE,
            warden_id uuid REFERENCES users (id)
        );"#
    ),
    table!(
        "hostel_rooms",
        r#"CREATE TABLE hostel_rooms (
            id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
            hostel_id uuid NOT NULL REFERENCES hostels (id) ON DELETE CASCADE,
            room_number text NOT NULL,
            capacity smallint NOT NULL DEFAULT 2,
            monthly_charge numeric(12,2),
            UNIQUE (hostel_id, room_number)
        );"#
    ),
    table!(
        "student_hostel",
        r#"CREATE TABLE student_hostel (
            student_id uuid NOT NULL REFERENCES students (id) ON DELETE CASCADE,
            room_id uuid NOT NULL REFERENCES hostel_rooms (id),
            allotted_on date NOT NULL DEFAULT CURRENT_DATE,
            vacated_on date,
            PRIMARY KEY (student_id, room_id)
        );"#
    ),
];

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_blueprint_covers_critical_set() {
        let names = TENANT_TABLES
            .iter()
            .map(|table| table.name)
            .collect::<HashSet<_>>();
        for critical in CRITICAL_TABLES {
            assert!(names.contains(critical), "missing critical table {critical}");
        }
    }

    #[test]
    fn test_blueprint_meets_ready_count() {
        assert!(TENANT_TABLES.len() >= MIN_READY_TABLE_COUNT);
    }

    #[test]
    fn test_blueprint_has_no_duplicates_and_no_global_tables() {
        let mut seen = HashSet::new();
        for table in TENANT_TABLES {
            assert!(seen.insert(table.name), "duplicate table {}", table.name);
            assert!(
                !GLOBAL_TABLES.contains(&table.name),
                "global table {} in tenant blueprint",
                table.name
            );
        }
    }

    #[test]
    fn test_ddl_matches_declared_name() {
        for table in TENANT_TABLES {
            assert!(
                table.ddl.contains(&format!("CREATE TABLE {}", table.name)),
                "ddl of {} does not create it",
                table.name
            );
        }
    }

    #[test]
    fn test_tables_are_in_dependency_order() {
        // every `REFERENCES <table>` must point at an earlier table
        // (or at the global catalog)
        let mut defined = HashSet::new();
        for table in TENANT_TABLES {
            for part in table.ddl.split("REFERENCES ").skip(1) {
                let referenced = part
                    .split([' ', '('])
                    .next()
                    .unwrap()
                    .trim();
                if let Some(global) = referenced.strip_prefix("public.") {
                    assert!(GLOBAL_TABLES.contains(&global), "unknown global {global}");
                    continue;
                }
                assert!(
                    defined.contains(referenced) || referenced == table.name,
                    "{} references {} before it is defined",
                    table.name,
                    referenced
                );
            }
            defined.insert(table.name);
        }
    }
}
