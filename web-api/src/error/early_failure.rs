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

use std::fmt::Display;

use actix_web::{
    body::BoxBody,
    dev::{ServiceRequest, ServiceResponse},
};
use campus_web_api_shared::request::TenantId;

use crate::{
    error::{application::application_event, json_error::JsonErrorResponseBuilder},
    middleware::request_context::RequestId,
    Error,
};

/// Renders a typed failure raised before the handler chain ran.
///
/// Middleware cannot rely on the task-local request id being set yet,
/// so everything is passed explicitly.
pub(crate) fn middleware_failure(
    middleware: &'static str,
    request: ServiceRequest,
    request_id: Option<RequestId>,
    tenant_id: Option<TenantId>,
    error: Error,
    cause: impl Display,
) -> ServiceResponse<BoxBody> {
    let request_id = request_id.unwrap_or_else(RequestId::missing);
    let tenant_id = tenant_id.unwrap_or_else(TenantId::missing);

    application_event!(
        error.level(),
        middleware,
        path = %request.request().path(),
        method = %request.request().method(),
        %request_id,
        %tenant_id,
        error = %error,
        %cause,
    );

    let response = JsonErrorResponseBuilder::render(
        error.kind(),
        &error.to_string(),
        request_id,
        &error.encode_details(),
    )
    .into_response(error.status_code());

    let (request, _) = request.into_parts();
    ServiceResponse::new(request, response)
}
