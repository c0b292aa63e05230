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
    web::{self, Data, Json, Path, Query, ServiceConfig},
    HttpResponse,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::{
    app::AppState,
    auth::Auth,
    error::common::BadRequest,
    fees::{money::Money, store},
    rbac::Guard,
    response,
    Error,
};
use campus_job_queue::EnqueueOptions;

const FEES_VIEW: Guard = Guard::any_of(&["fees.view", "fees.view_own"]);
const FEES_COLLECT: Guard = Guard::any_of(&["fees.collect"]);
const FEES_REFUND: Guard = Guard::any_of(&["fees.refund"]);

// mounted under the `/api` scope
pub(crate) fn configure_service(config: &mut ServiceConfig) {
    config.service(
        web::scope("/v2/school/fees")
            .route("/payments", web::get().to(list_payments))
            .route("/payments", web::post().to(collect_payment))
            .route("/payments/{payment_id}/refund", web::post().to(refund_payment)),
    );
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    student_id: Option<Uuid>,
    // one canonical concept, the year spelling is aliased at the edge
    #[serde(alias = "academic_year_id")]
    academic_session_id: Option<Uuid>,
    limit: Option<i64>,
}

async fn list_payments(
    auth: Auth,
    state: Data<AppState>,
    query: Query<ListQuery>,
) -> Result<HttpResponse, Error> {
    state
        .rbac
        .enforce(&FEES_VIEW, &auth.actor.permissions, &auth.actor.roles)?;

    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let payments = store::list_payments(
        &auth.db,
        query.student_id,
        query.academic_session_id,
        limit,
    )
    .await?;
    Ok(response::ok(json!({ "payments": payments })))
}

#[derive(Debug, Deserialize)]
struct CollectRequest {
    institution_id: Uuid,
    student_id: Uuid,
    #[serde(alias = "academic_year_id")]
    academic_session_id: Uuid,
    fee_structure_id: Uuid,
    amount_paid: Decimal,
    mode: String,
    reference: Option<String>,
    idempotency_key: Option<String>,
}

async fn collect_payment(
    auth: Auth,
    state: Data<AppState>,
    body: Json<CollectRequest>,
) -> Result<HttpResponse, Error> {
    state
        .rbac
        .enforce(&FEES_COLLECT, &auth.actor.permissions, &auth.actor.roles)?;

    let body = body.into_inner();
    let outcome = store::collect(
        &auth.db,
        store::CollectParams {
            institution_id: body.institution_id,
            student_id: body.student_id,
            academic_session_id: body.academic_session_id,
            fee_structure_id: body.fee_structure_id,
            amount_paid: Money::new(body.amount_paid),
            mode: body.mode,
            reference: body.reference,
            idempotency_key: body.idempotency_key,
            collected_by: auth.actor.user_id,
        },
    )
    .await?;

    if outcome.created {
        // receipt notification rides the queue; the payment stands even
        // when the backend is degraded
        let enqueue = state
            .queue
            .enqueue(
                "fees",
                "receipt_issued",
                json!({
                    "payment_id": outcome.payment.id,
                    "receipt_number": outcome.payment.receipt_number,
                    "student_id": outcome.payment.student_id,
                }),
                EnqueueOptions {
                    idempotency_key: Some(format!("receipt:{}", outcome.payment.id)),
                    tenant_id: Some(auth.actor.tenant_id.to_string()),
                    ..Default::default()
                },
            )
            .await;
        if let Err(enqueue_error) = enqueue {
            warn!(%enqueue_error, "receipt notification not enqueued");
        }
        Ok(response::created(json!({ "payment": outcome.payment })))
    } else {
        Ok(response::ok(json!({ "payment": outcome.payment })))
    }
}

#[derive(Debug, Deserialize)]
struct RefundRequest {
    reason: Option<String>,
}

async fn refund_payment(
    auth: Auth,
    state: Data<AppState>,
    path: Path<Uuid>,
    body: Json<RefundRequest>,
) -> Result<HttpResponse, Error> {
    state
        .rbac
        .enforce(&FEES_REFUND, &auth.actor.permissions, &auth.actor.roles)?;

    let reason = body
        .into_inner()
        .reason
        .filter(|reason| !reason.trim().is_empty())
        .ok_or_else(|| BadRequest::from("a refund reason is required"))?;

    let payment = store::refund(&auth.db, path.into_inner(), auth.actor.user_id, &reason).await?;
    Ok(response::ok(json!({ "payment": payment })))
}
