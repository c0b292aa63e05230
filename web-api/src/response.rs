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

//! The uniform success envelope: `{success, message, data, errors}`.

use actix_web::HttpResponse;
use serde::Serialize;
use serde_json::json;

pub(crate) fn ok(data: impl Serialize) -> HttpResponse {
    HttpResponse::Ok().json(envelope("ok", data))
}

pub(crate) fn ok_with_message(message: &str, data: impl Serialize) -> HttpResponse {
    HttpResponse::Ok().json(envelope(message, data))
}

pub(crate) fn created(data: impl Serialize) -> HttpResponse {
    HttpResponse::Created().json(envelope("created", data))
}

fn envelope(message: &str, data: impl Serialize) -> serde_json::Value {
    json!({
        "success": true,
        "message": message,
        "data": data,
        "errors": [],
    })
}
