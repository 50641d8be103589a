/*!
Credential verification.

- `AuthVerifier` is the seam the gatekeeper calls; `JwtVerifier` checks HS256 tokens carrying
  `{ sub, role, exp }`.
- `bearer_token` pulls the credential out of an `Authorization` header value.
*/

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::errors::AuthFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Student,
}

/// A validated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub operator_id: String,
    pub role: Role,
}

impl Principal {
    /// Only admins may open terminals or manage sessions.
    pub fn can_open_terminal(&self) -> bool {
        self.role == Role::Admin
    }
}

#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Principal, AuthFailure>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: Role,
    exp: u64,
}

pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        JwtVerifier {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mint a token for `operator_id` valid for `ttl`.
    pub fn issue(
        &self,
        operator_id: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let exp = chrono::Utc::now().timestamp().max(0) as u64 + ttl.as_secs();
        let claims = Claims {
            sub: operator_id.to_string(),
            role,
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

#[async_trait]
impl AuthVerifier for JwtVerifier {
    async fn verify(&self, credential: &str) -> Result<Principal, AuthFailure> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(AuthFailure::MissingCredential);
        }
        let data = decode::<Claims>(credential, &self.decoding, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthFailure::Expired,
                _ => AuthFailure::InvalidCredential,
            },
        )?;
        if data.claims.sub.trim().is_empty() {
            return Err(AuthFailure::InvalidCredential);
        }
        Ok(Principal {
            operator_id: data.claims.sub,
            role: data.claims.role,
        })
    }
}

/// Extract the credential from an Authorization header value using the Bearer scheme
/// (RFC 6750): scheme case-insensitive, at least one ASCII whitespace before the token,
/// token made of token68 characters only.
pub fn bearer_token(value: &str) -> Option<&str> {
    let v = value.trim();
    let idx = v.find(|c: char| c.is_ascii_whitespace())?;
    let (scheme, rest) = v.split_at(idx);
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let cred = rest.trim();
    let token68 = |c: char| c.is_ascii_alphanumeric() || "-._~+/=".contains(c);
    if cred.is_empty() || !cred.chars().all(token68) {
        return None;
    }
    Some(cred)
}
