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

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use campus_web_api_shared::{request::TenantId, serde::serialize_redacted};

use crate::{
    error::common::{CredentialExpired, MissingCredential},
    Error,
};

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HMAC signing secret; must be overridden outside development.
    #[serde(serialize_with = "serialize_redacted")]
    pub secret: Secret<String>,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub issuer: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secret: String::from("dev-only-secret-change-me").into(),
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
            issuer: "campus-web-api".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Claims {
    /// User id.
    pub(crate) sub: Uuid,
    pub(crate) tenant_id: String,
    pub(crate) session_id: Uuid,
    #[serde(default)]
    pub(crate) roles: Vec<String>,
    pub(crate) must_change_password: bool,
    pub(crate) kind: TokenKind,
    pub(crate) iss: String,
    pub(crate) iat: i64,
    pub(crate) exp: i64,
    pub(crate) jti: String,
}

/// Signing/verification keys, derived once at startup.
pub(crate) struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
    issuer: String,
}

pub(crate) struct IssuedToken {
    pub(crate) token: String,
    pub(crate) expires_in_secs: i64,
}

impl TokenKeys {
    pub(crate) fn from_config(config: &Config) -> Self {
        let secret = config.secret.expose_secret().as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            access_ttl_secs: config.access_ttl_secs,
            refresh_ttl_secs: config.refresh_ttl_secs,
            issuer: config.issuer.clone(),
        }
    }

    pub(crate) fn issue(
        &self,
        kind: TokenKind,
        user_id: Uuid,
        tenant_id: &TenantId,
        session_id: Uuid,
        roles: Vec<String>,
        must_change_password: bool,
    ) -> Result<IssuedToken, Error> {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl_secs,
            TokenKind::Refresh => self.refresh_ttl_secs,
        };
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id,
            tenant_id: tenant_id.to_string(),
            session_id,
            roles,
            must_change_password,
            kind,
            iss: self.issuer.clone(),
            iat: now,
            exp: now + ttl,
            jti: Uuid::new_v4().to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|error| crate::error::common::InternalError::from_std(error))?;
        Ok(IssuedToken {
            token,
            expires_in_secs: ttl,
        })
    }

    /// Verifies signature, expiry and issuer; rejects wrong token kinds.
    pub(crate) fn verify(&self, token: &str, expected: TokenKind) -> Result<Claims, Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|error| match error.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Error::from(CredentialExpired)
                }
                _ => Error::from(MissingCredential),
            })?
            .claims;
        if claims.kind != expected {
            return Err(MissingCredential.into());
        }
        Ok(claims)
    }
}

/// Reads the `tenant_id` claim without verifying the signature.
///
/// Only used as a resolution *hint*; the authenticator verifies the
/// token and the isolation guard compares the verified claim against
/// the bound schema afterwards.
pub(crate) fn peek_tenant_id(token: &str) -> Option<TenantId> {
    peek_claims(token)?.tenant_id.parse().ok()
}

/// Reads the subject claim without verifying the signature.
///
/// Only used as a rate-limit key.
pub(crate) fn peek_subject(token: &str) -> Option<String> {
    peek_claims(token).map(|claims| claims.sub.to_string())
}

fn peek_claims(token: &str) -> Option<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .ok()
        .map(|data| data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> TokenKeys {
        TokenKeys::from_config(&Config::default())
    }

    fn tenant() -> TenantId {
        "green-valley".parse().unwrap()
    }

    #[test]
    fn test_issue_and_verify_roundtrip() {
        let keys = keys();
        let user_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let issued = keys
            .issue(
                TokenKind::Access,
                user_id,
                &tenant(),
                session_id,
                vec!["teacher".into()],
                false,
            )
            .unwrap();

        let claims = keys.verify(&issued.token, TokenKind::Access).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.session_id, session_id);
        assert_eq!(claims.tenant_id, "green-valley");
        assert_eq!(claims.roles, ["teacher"]);
    }

    #[test]
    fn test_refresh_token_is_not_an_access_token() {
        let keys = keys();
        let issued = keys
            .issue(
                TokenKind::Refresh,
                Uuid::new_v4(),
                &tenant(),
                Uuid::new_v4(),
                Vec::new(),
                false,
            )
            .unwrap();
        assert!(keys.verify(&issued.token, TokenKind::Access).is_err());
        assert!(keys.verify(&issued.token, TokenKind::Refresh).is_ok());
    }

    #[test]
    fn test_tampered_token_is_rejected() {
        let keys = keys();
        let issued = keys
            .issue(
                TokenKind::Access,
                Uuid::new_v4(),
                &tenant(),
                Uuid::new_v4(),
                Vec::new(),
                false,
            )
            .unwrap();
        let mut tampered = issued.token.clone();
        tampered.pop();
        tampered.push('x');
        assert!(keys.verify(&tampered, TokenKind::Access).is_err());
    }

    #[test]
    fn test_peek_reads_tenant_without_verification() {
        let keys = keys();
        let issued = keys
            .issue(
                TokenKind::Access,
                Uuid::new_v4(),
                &tenant(),
                Uuid::new_v4(),
                Vec::new(),
                false,
            )
            .unwrap();
        assert_eq!(peek_tenant_id(&issued.token), Some(tenant()));
        assert!(peek_subject(&issued.token).is_some());
        assert_eq!(peek_tenant_id("not-a-jwt"), None);
    }
}
