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

//! Fee collection: the money-critical path.
//!
//! Everything mutating runs inside one transaction. The assignment row
//! is locked before dues are computed and the receipt counter insert
//! takes a row lock on `(institution, year)`, so two concurrent
//! collections serialize and can neither overdraw nor mint the same
//! receipt number.

use std::time::Instant;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    error::common::{AlreadyRefunded, BadRequest, Conflict, NotFound},
    fees::money::Money,
    storage::Database,
    Error,
};

pub(crate) const PAYMENT_MODES: &[&str] = &["cash", "card", "upi", "bank_transfer", "cheque"];

#[derive(Clone, Debug, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PaymentRecord {
    pub(crate) id: Uuid,
    pub(crate) receipt_number: String,
    pub(crate) student_id: Uuid,
    pub(crate) academic_session_id: Uuid,
    pub(crate) fee_structure_id: Uuid,
    pub(crate) amount_paid: Decimal,
    pub(crate) late_fee: Decimal,
    pub(crate) mode: String,
    pub(crate) status: String,
    pub(crate) remarks: Option<String>,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) paid_at: DateTime<Utc>,
}

const PAYMENT_COLUMNS: &str = "id, receipt_number, student_id, academic_session_id, \
     fee_structure_id, amount_paid, late_fee, mode, status, remarks, idempotency_key, paid_at";

#[derive(Debug)]
pub(crate) struct CollectParams {
    pub(crate) institution_id: Uuid,
    pub(crate) student_id: Uuid,
    pub(crate) academic_session_id: Uuid,
    pub(crate) fee_structure_id: Uuid,
    pub(crate) amount_paid: Money,
    pub(crate) mode: String,
    pub(crate) reference: Option<String>,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) collected_by: Uuid,
}

#[derive(Debug, FromRow)]
struct AssignmentRow {
    #[allow(dead_code)]
    id: Uuid,
    final_amount: Decimal,
    due_day: i16,
    late_fee_per_day: Decimal,
}

/// Outcome of a collect call; `created` distinguishes 201 from an
/// idempotent replay (200).
pub(crate) struct CollectOutcome {
    pub(crate) payment: PaymentRecord,
    pub(crate) created: bool,
}

#[instrument(skip(db, params), fields(student_id = %params.student_id), err)]
pub(crate) async fn collect(db: &Database, params: CollectParams) -> Result<CollectOutcome, Error> {
    if !params.amount_paid.is_positive() {
        return Err(BadRequest::from("amount_paid must be positive").into());
    }
    if !PAYMENT_MODES.contains(&params.mode.as_str()) {
        return Err(BadRequest::from(format!("unknown payment mode: {}", params.mode)).into());
    }

    let started = Instant::now();
    let mut tx = db.begin().await?;

    // idempotent replay returns the stored payment unchanged
    if let Some(key) = &params.idempotency_key {
        let existing = sqlx::query_as::<_, PaymentRecord>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM fee_payments WHERE idempotency_key = $1;"
        ))
        .bind(key)
        .fetch_optional(&mut tx)
        .await?;
        if let Some(payment) = existing {
            tx.commit().await?;
            db.observe_query(started);
            return Ok(CollectOutcome {
                payment,
                created: false,
            });
        }
    }

    // the institution pointer must belong to this tenant's schema
    let (institution_ok,) = sqlx::query_as::<_, (bool,)>(
        "SELECT EXISTS (
            SELECT FROM public.institutions WHERE id = $1 AND schema_name = $2
        );",
    )
    .bind(params.institution_id)
    .bind(db.schema().as_unquoted_str())
    .fetch_one(&mut tx)
    .await?;
    if !institution_ok {
        return Err(BadRequest::from("institution does not belong to this tenant").into());
    }

    // lock the assignment before reading dues
    let assignment = sqlx::query_as::<_, AssignmentRow>(
        "SELECT sfa.id, sfa.final_amount, fs.due_day, fs.late_fee_per_day
            FROM student_fee_assignments sfa
            JOIN fee_structures fs ON fs.id = sfa.fee_structure_id
            WHERE sfa.student_id = $1
              AND sfa.fee_structure_id = $2
              AND sfa.academic_session_id = $3
            FOR UPDATE OF sfa;",
    )
    .bind(params.student_id)
    .bind(params.fee_structure_id)
    .bind(params.academic_session_id)
    .fetch_optional(&mut tx)
    .await?
    .ok_or(NotFound {
        entity: "fee assignment",
    })?;

    let (paid_so_far,) = sqlx::query_as::<_, (Decimal,)>(
        "SELECT COALESCE(SUM(amount_paid), 0)
            FROM fee_payments
            WHERE student_id = $1
              AND fee_structure_id = $2
              AND academic_session_id = $3
              AND status = 'success';",
    )
    .bind(params.student_id)
    .bind(params.fee_structure_id)
    .bind(params.academic_session_id)
    .fetch_one(&mut tx)
    .await?;

    let payment_date = Utc::now().date_naive();
    let late_fee = applicable_late_fee(
        Money::new(assignment.late_fee_per_day),
        assignment.due_day,
        payment_date,
    );
    let outstanding = Money::new(assignment.final_amount) - Money::new(paid_so_far);
    if params.amount_paid > outstanding + late_fee {
        return Err(BadRequest::from(format!(
            "amount {} exceeds outstanding dues {} (incl. late fee {late_fee})",
            params.amount_paid,
            outstanding + late_fee,
        ))
        .into());
    }

    // counter row lock serializes concurrent collections per year
    let (receipt_no,) = sqlx::query_as::<_, (i32,)>(
        "INSERT INTO receipt_counters (institution_id, year, last_number)
            VALUES ($1, $2, 1)
            ON CONFLICT (institution_id, year)
            DO UPDATE SET last_number = receipt_counters.last_number + 1
            RETURNING last_number;",
    )
    .bind(params.institution_id)
    .bind(payment_date.year())
    .fetch_one(&mut tx)
    .await?;
    let receipt_number = format_receipt_number(payment_date.year(), receipt_no);

    let remarks = late_fee
        .is_positive()
        .then(|| format!("includes late fee of {late_fee}"));

    let insert = sqlx::query_as::<_, PaymentRecord>(&format!(
        "INSERT INTO fee_payments (
            institution_id, student_id, academic_session_id, fee_structure_id,
            receipt_number, amount_paid, late_fee, mode, reference,
            idempotency_key, status, remarks, collected_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'success', $11, $12)
        RETURNING {PAYMENT_COLUMNS};"
    ))
    .bind(params.institution_id)
    .bind(params.student_id)
    .bind(params.academic_session_id)
    .bind(params.fee_structure_id)
    .bind(&receipt_number)
    .bind(params.amount_paid.amount())
    .bind(late_fee.amount())
    .bind(&params.mode)
    .bind(&params.reference)
    .bind(&params.idempotency_key)
    .bind(&remarks)
    .bind(params.collected_by)
    .fetch_one(&mut tx)
    .await;

    let payment = match insert {
        Ok(payment) => payment,
        Err(sqlx::Error::Database(db_error)) if db_error.code().as_deref() == Some("23505") => {
            // a concurrent submission with the same idempotency key won
            drop(tx);
            if let Some(key) = &params.idempotency_key {
                let mut conn = db.acquire().await?;
                let existing = sqlx::query_as::<_, PaymentRecord>(&format!(
                    "SELECT {PAYMENT_COLUMNS} FROM fee_payments WHERE idempotency_key = $1;"
                ))
                .bind(key)
                .fetch_optional(&mut conn)
                .await?
                .ok_or(Conflict {
                    message: "payment submission raced and lost".into(),
                })?;
                db.observe_query(started);
                return Ok(CollectOutcome {
                    payment: existing,
                    created: false,
                });
            }
            return Err(Conflict {
                message: "receipt number collision".into(),
            }
            .into());
        }
        Err(error) => return Err(error.into()),
    };

    tx.commit().await?;
    db.observe_query(started);
    info!(receipt = %payment.receipt_number, "payment collected");
    Ok(CollectOutcome {
        payment,
        created: true,
    })
}

#[instrument(skip(db), err)]
pub(crate) async fn refund(
    db: &Database,
    payment_id: Uuid,
    voided_by: Uuid,
    reason: &str,
) -> Result<PaymentRecord, Error> {
    let started = Instant::now();
    let mut tx = db.begin().await?;

    let (status,) = sqlx::query_as::<_, (String,)>(
        "SELECT status FROM fee_payments WHERE id = $1 FOR UPDATE;",
    )
    .bind(payment_id)
    .fetch_optional(&mut tx)
    .await?
    .ok_or(NotFound { entity: "payment" })?;

    match status.as_str() {
        "success" => {}
        "refunded" => return Err(AlreadyRefunded.into()),
        _ => {
            return Err(BadRequest::from(format!(
                "payment in status {status} cannot be refunded"
            ))
            .into())
        }
    }

    let payment = sqlx::query_as::<_, PaymentRecord>(&format!(
        "UPDATE fee_payments
            SET status = 'refunded', voided_by = $2, void_reason = $3
            WHERE id = $1
            RETURNING {PAYMENT_COLUMNS};"
    ))
    .bind(payment_id)
    .bind(voided_by)
    .bind(reason)
    .fetch_one(&mut tx)
    .await?;

    tx.commit().await?;
    db.observe_query(started);
    info!(receipt = %payment.receipt_number, "payment refunded");
    Ok(payment)
}

pub(crate) async fn list_payments(
    db: &Database,
    student_id: Option<Uuid>,
    academic_session_id: Option<Uuid>,
    limit: i64,
) -> Result<Vec<PaymentRecord>, Error> {
    let started = Instant::now();
    let mut conn = db.acquire().await?;
    let payments = sqlx::query_as::<_, PaymentRecord>(&format!(
        "SELECT {PAYMENT_COLUMNS}
            FROM fee_payments
            WHERE ($1::uuid IS NULL OR student_id = $1)
              AND ($2::uuid IS NULL OR academic_session_id = $2)
            ORDER BY paid_at DESC
            LIMIT $3;"
    ))
    .bind(student_id)
    .bind(academic_session_id)
    .bind(limit)
    .fetch_all(&mut conn)
    .await?;
    db.observe_query(started);
    Ok(payments)
}

pub(crate) fn format_receipt_number(year: i32, number: i32) -> String {
    format!("RCP-{year}-{number:05}")
}

/// Late fee for a payment made on `payment_date`.
///
/// The effective due date is the structure's due day of the payment
/// month, clamped to the month's length.
pub(crate) fn applicable_late_fee(
    late_fee_per_day: Money,
    due_day: i16,
    payment_date: NaiveDate,
) -> Money {
    if !late_fee_per_day.is_positive() {
        return Money::ZERO;
    }
    let last_day = days_in_month(payment_date.year(), payment_date.month());
    let effective_due_day = u32::from(due_day.max(1) as u16).min(last_day);
    let due_date = NaiveDate::from_ymd_opt(
        payment_date.year(),
        payment_date.month(),
        effective_due_day,
    )
    .unwrap(/* clamped to month length */);

    let days_overdue = (payment_date - due_date).num_days().max(0);
    late_fee_per_day.times(days_overdue)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap(/* month is 1..=12 */)
        .pred_opt()
        .unwrap(/* not the minimum date */)
        .day()
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn money(value: &str) -> Money {
        Money::new(Decimal::from_str(value).unwrap())
    }

    fn date(value: &str) -> NaiveDate {
        NaiveDate::from_str(value).unwrap()
    }

    #[test]
    fn test_receipt_number_format() {
        assert_eq!(format_receipt_number(2024, 1), "RCP-2024-00001");
        assert_eq!(format_receipt_number(2024, 123), "RCP-2024-00123");
        assert_eq!(format_receipt_number(2025, 99999), "RCP-2025-99999");
    }

    #[test]
    fn test_no_late_fee_on_or_before_due_day() {
        let per_day = money("10.00");
        assert_eq!(applicable_late_fee(per_day, 10, date("2024-04-10")), Money::ZERO);
        assert_eq!(applicable_late_fee(per_day, 10, date("2024-04-05")), Money::ZERO);
    }

    #[test]
    fn test_late_fee_accrues_per_day() {
        let per_day = money("10.00");
        assert_eq!(
            applicable_late_fee(per_day, 10, date("2024-04-13")),
            money("30.00")
        );
    }

    #[test]
    fn test_due_day_clamped_to_month_length() {
        let per_day = money("5.00");
        // due day 31 in february clamps to the 29th (leap year)
        assert_eq!(
            applicable_late_fee(per_day, 31, date("2024-02-29")),
            Money::ZERO
        );
        assert_eq!(
            applicable_late_fee(per_day, 31, date("2023-02-28")),
            Money::ZERO
        );
    }

    #[test]
    fn test_zero_rate_never_accrues() {
        assert_eq!(
            applicable_late_fee(Money::ZERO, 1, date("2024-04-30")),
            Money::ZERO
        );
    }

    #[test]
    fn test_days_in_month() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2024, 12), 31);
        assert_eq!(days_in_month(2024, 4), 30);
    }
}
