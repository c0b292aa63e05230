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

use secrecy::Secret;
use serde::Serializer;
use serde_json::Value;

/// Serialize a `Secret<String>` as `"[REDACTED]"`.
pub fn serialize_redacted<S>(_secret: &Secret<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str("[REDACTED]")
}

const REDACTED: &str = "[REDACTED]";

/// Keys whose values must never reach a log line or a serialized payload.
///
/// Matching is case-insensitive on the whole key as well as on `_`/`-`
/// separated segments, so `accessToken`, `api-key` and `user_password`
/// are all caught.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "authorization",
    "cookie",
    "jwt",
    "api_key",
    "apikey",
    "private_key",
    "credit_card",
    "ssn",
    "aadhar",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|sensitive| {
        lower == *sensitive
            || lower
                .split(['_', '-'])
                .any(|segment| segment == *sensitive)
            // camelCase tails like accessToken/refreshToken
            || lower.ends_with(sensitive)
    })
}

/// Recursively replaces values of sensitive keys with `"[REDACTED]"`.
///
/// Applying this twice yields the same value as applying it once.
pub fn redact_json(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *entry = Value::String(REDACTED.into());
                } else {
                    redact_json(entry);
                }
            }
        }
        Value::Array(entries) => {
            for entry in entries {
                redact_json(entry);
            }
        }
        _ => {}
    }
}

/// Like [`redact_json()`] but leaves the input untouched.
pub fn redacted_copy(value: &Value) -> Value {
    let mut copy = value.clone();
    redact_json(&mut copy);
    copy
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sensitive_key_matching() {
        assert!(is_sensitive_key("password"));
        assert!(is_sensitive_key("PASSWORD"));
        assert!(is_sensitive_key("user_password"));
        assert!(is_sensitive_key("accessToken"));
        assert!(is_sensitive_key("refresh_token"));
        assert!(is_sensitive_key("api-key"));
        assert!(is_sensitive_key("aadhar"));
        assert!(!is_sensitive_key("email"));
        assert!(!is_sensitive_key("amount_paid"));
    }

    #[test]
    fn test_redaction_recurses_into_nested_objects() {
        let mut value = json!({
            "user": {
                "email": "u@school.com",
                "password": "P@ssw0rd!",
                "profile": { "ssn": "123-45-6789" },
            },
            "items": [{ "authorization": "Bearer abc" }],
            "amount": 42,
        });
        redact_json(&mut value);
        assert_eq!(value["user"]["email"], "u@school.com");
        assert_eq!(value["user"]["password"], "[REDACTED]");
        assert_eq!(value["user"]["profile"]["ssn"], "[REDACTED]");
        assert_eq!(value["items"][0]["authorization"], "[REDACTED]");
        assert_eq!(value["amount"], 42);
    }

    #[test]
    fn test_redaction_is_idempotent() {
        let value = json!({
            "cookie": "session=abc",
            "nested": { "jwt": "ey..", "plain": true },
        });
        let once = redacted_copy(&value);
        let twice = redacted_copy(&once);
        assert_eq!(once, twice);
    }
}
