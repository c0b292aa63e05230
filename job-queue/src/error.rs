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

use displaydoc::Display;
use thiserror::Error;

#[derive(Debug, Display, Error)]
pub enum QueueError {
    /// queue backend is unavailable
    Unavailable,
    /// unknown queue: {0}
    UnknownQueue(String),
    /// backend failure: {0}
    Backend(#[from] redis::RedisError),
    /// job payload could not be (de)serialized: {0}
    Codec(#[from] serde_json::Error),
}

impl QueueError {
    /// True for errors worth a transient retry (backend hiccups).
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Backend(error) => {
                error.is_connection_dropped()
                    || error.is_timeout()
                    || error.is_cluster_error()
                    || error.is_io_error()
            }
            QueueError::Unavailable => true,
            _ => false,
        }
    }
}
