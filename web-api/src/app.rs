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

mod state;

use std::{env::current_dir, path::PathBuf};

use actix_web::web;
use futures_util::FutureExt;
use tracing::{info, instrument};

pub use self::state::AppState;
use crate::{config::Config, net, net::AppHandle, SetupError};

/// Run the server.
///
/// The return value is a handle on the running application.
#[instrument(skip_all)]
pub async fn start(config: Config) -> Result<AppHandle, SetupError> {
    info!({ ?config }, "starting service");

    let pwd = current_dir().unwrap_or_else(|_| PathBuf::from("<no working directory set>"));
    info!(pwd=?pwd);

    let app_state = web::Data::new(AppState::create(config).await?);

    let shutdown = Box::new({
        let app_state = app_state.clone();
        move || async move { app_state.shutdown().await }.boxed()
    });

    net::start_actix_server(app_state, shutdown)
}
