// Copyright 2022 Xayn AG
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

use std::borrow::Cow;

use actix_web::http::StatusCode;
use derive_more::From;
use displaydoc::Display;
use serde::Serialize;
use tracing::Level;
use thiserror::Error;

use super::application::ApplicationError;
use crate::{error::application::impl_application_error, Error};

/// Custom error for 400 Bad Request status code.
#[derive(Debug, Error, Display, Serialize, From)]
pub(crate) struct BadRequest {
    pub(crate) message: Cow<'static, str>,
}

impl_application_error!(BadRequest => BAD_REQUEST, INFO);

impl From<&'static str> for BadRequest {
    fn from(message: &'static str) -> Self {
        Self {
            message: Cow::Borrowed(message),
        }
    }
}

impl From<String> for BadRequest {
    fn from(message: String) -> Self {
        Self {
            message: Cow::Owned(message),
        }
    }
}

/// The requested entity was not found.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct NotFound {
    pub(crate) entity: &'static str,
}

impl_application_error!(NotFound => NOT_FOUND, INFO);

/// The submitted state conflicts with existing data: {message}
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct Conflict {
    pub(crate) message: Cow<'static, str>,
}

impl_application_error!(Conflict => CONFLICT, INFO);

/// Invalid email or password.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct InvalidCredentials;

impl_application_error!(InvalidCredentials => UNAUTHORIZED, INFO);

/// Missing or malformed bearer credential.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct MissingCredential;

impl_application_error!(MissingCredential => UNAUTHORIZED, INFO);

/// The credential is expired or revoked.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct CredentialExpired;

impl_application_error!(CredentialExpired => UNAUTHORIZED, INFO);

/// A password change is required before other requests are served.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct PasswordChangeRequired;

impl_application_error!(PasswordChangeRequired => FORBIDDEN, INFO);

/// Caller lacks the required permissions.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct PermissionDenied {
    pub(crate) required: Vec<String>,
}

impl_application_error!(PermissionDenied => FORBIDDEN, INFO);

/// Too many requests.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct RateLimited;

impl_application_error!(RateLimited => TOO_MANY_REQUESTS, INFO);

/// No tenant could be resolved for this request.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct TenantUnresolved;

impl ApplicationError for TenantUnresolved {
    fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    fn kind(&self) -> &str {
        "TENANT_UNRESOLVED"
    }

    fn level(&self) -> Level {
        Level::INFO
    }
}

/// A tenant scoped operation ran without a bound tenant schema.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct TenantBindingMissing;

impl ApplicationError for TenantBindingMissing {
    fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    fn kind(&self) -> &str {
        "TENANT_BINDING_MISSING"
    }

    fn level(&self) -> Level {
        Level::ERROR
    }
}

/// The authenticated principal does not belong to the bound tenant.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct TenantMismatch;

impl ApplicationError for TenantMismatch {
    fn status_code(&self) -> StatusCode {
        StatusCode::FORBIDDEN
    }

    fn kind(&self) -> &str {
        "TENANT_MISMATCH"
    }

    fn level(&self) -> Level {
        Level::ERROR
    }
}

/// The tenant is suspended.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct TenantSuspended;

impl_application_error!(TenantSuspended => FORBIDDEN, WARN);

/// The payment was already refunded.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct AlreadyRefunded;

impl ApplicationError for AlreadyRefunded {
    fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    fn kind(&self) -> &str {
        "ALREADY_REFUNDED"
    }

    fn level(&self) -> Level {
        Level::INFO
    }
}

/// The queue backend is unavailable.
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct QueueUnavailable;

impl ApplicationError for QueueUnavailable {
    fn status_code(&self) -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    fn kind(&self) -> &str {
        "QUEUE_UNAVAILABLE"
    }

    fn level(&self) -> Level {
        Level::WARN
    }
}

/// A backing dependency is unreachable: {dependency}
#[derive(Debug, Error, Display, Serialize)]
pub(crate) struct DependencyDown {
    pub(crate) dependency: &'static str,
}

impl_application_error!(DependencyDown => SERVICE_UNAVAILABLE, ERROR);

/// Internal Error: {0}
#[derive(Debug, Display, Error)]
pub(crate) struct InternalError(anyhow::Error);

impl InternalError {
    pub(crate) fn from_message(msg: &'static str) -> Self {
        Self::from_anyhow(anyhow::Error::msg(msg))
    }

    pub(crate) fn from_std(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(anyhow::Error::new(error))
    }

    pub(crate) fn from_anyhow(error: anyhow::Error) -> Self {
        Self(error)
    }
}

impl ApplicationError for InternalError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn kind(&self) -> &str {
        "Internal"
    }

    fn level(&self) -> Level {
        Level::ERROR
    }

    fn encode_details(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        InternalError::from_anyhow(error).into()
    }
}

impl From<campus_job_queue::QueueError> for Error {
    fn from(error: campus_job_queue::QueueError) -> Self {
        match error {
            campus_job_queue::QueueError::Unavailable => QueueUnavailable.into(),
            other => InternalError::from_std(other).into(),
        }
    }
}

macro_rules! impl_from_std_error {
    ($($error:ty,)*) => {$(
        impl From<$error> for Error {
            fn from(error: $error) -> Self {
                InternalError::from_std(error).into()
            }
        }
    )*};
}

impl_from_std_error!(
    sqlx::Error,
    std::io::Error,
    tokio::task::JoinError,
    serde_json::Error,
);
