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

//! Multi-tenant control plane server.
//!
//! One process serves many independent schools, each isolated inside
//! its own database schema. The crate wires the request pipeline
//! (request id, tenant resolution, schema binding, authentication,
//! RBAC), the fee collection money path, the job queue surface and the
//! observability/go-live machinery.

#![cfg_attr(not(test), forbid(unsafe_code))]
#![cfg_attr(test, deny(unsafe_code))]
#![warn(unreachable_pub, rustdoc::missing_crate_level_docs)]

mod app;
mod auth;
pub mod config;
mod error;
mod fees;
mod jobs;
pub mod logging;
mod middleware;
mod net;
mod observability;
mod rbac;
mod response;
mod storage;
mod tenants;

pub use crate::{
    app::{start, AppState},
    config::Config,
    error::application::{ApplicationError, Error},
    logging::initialize as initialize_logging,
    net::AppHandle,
};

pub type SetupError = anyhow::Error;
