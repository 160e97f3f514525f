//! Connection handshake: credentials and origin policy.
//!
//! The upgrade request must carry either a signed HS256 JWT (query
//! `token`, `Authorization: Bearer`, or the `session` cookie) whose
//! claims identify the user, or nothing — in which case the upgrade is
//! refused with 401. The `Origin` header is checked against the
//! configured allow-list and refused with 403 on mismatch.
//!
//! Guests are deterministic: a guest handle always maps to the same
//! UUIDv5 under a fixed namespace, so a reconnecting guest lands on the
//! same account rows.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Namespace for deriving guest user ids (UUIDv5).
pub const GUEST_NAMESPACE: Uuid = Uuid::from_bytes([
    0x2f, 0x1c, 0x5a, 0x88, 0x41, 0xd3, 0x4e, 0x0b, 0x9a, 0x6d, 0x33, 0x7e, 0xc4, 0x51, 0x09,
    0xaf,
]);

/// An authenticated connection identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub provider: String,
    pub is_guest: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("origin not allowed")]
    OriginNotAllowed,
}

/// JWT claims issued by the session service.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    #[serde(default)]
    pub user_id: Option<Uuid>,
    pub username: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub is_guest: Option<bool>,
    pub exp: u64,
}

/// Derives the deterministic identity for a guest handle.
pub fn guest_identity(handle: &str) -> Identity {
    Identity {
        user_id: Uuid::new_v5(&GUEST_NAMESPACE, handle.as_bytes()),
        username: handle.to_string(),
        provider: "guest".to_string(),
        is_guest: true,
    }
}

/// Verifies a signed token and extracts the identity. Guest tokens may
/// omit `userId`; it is derived from the handle.
pub fn verify_token(token: &str, secret: &str) -> Result<Identity, AuthError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| AuthError::InvalidCredentials(e.to_string()))?;
    let claims = data.claims;

    let is_guest = claims.is_guest.unwrap_or(false);
    if is_guest {
        let mut identity = guest_identity(&claims.username);
        if let Some(id) = claims.user_id {
            identity.user_id = id;
        }
        return Ok(identity);
    }

    let user_id = claims
        .user_id
        .ok_or_else(|| AuthError::InvalidCredentials("missing userId claim".into()))?;
    Ok(Identity {
        user_id,
        username: claims.username,
        provider: claims.provider.unwrap_or_else(|| "unknown".to_string()),
        is_guest: false,
    })
}

/// Pulls the bearer token out of an upgrade request: `token` query
/// parameter, `Authorization: Bearer`, or the `session` cookie.
pub fn token_from_request(req: &actix_web::HttpRequest) -> Option<String> {
    if let Some(token) = req
        .query_string()
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }
    if let Some(value) = req.headers().get(actix_web::http::header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.to_string());
    }
    req.cookie("session").map(|c| c.value().to_string())
}

/// Checks the `Origin` header against the allow-list. Requests without an
/// Origin (non-browser clients) pass; browser mismatches are refused.
pub fn origin_allowed(origin: Option<&str>, allow_list: &[String]) -> bool {
    match origin {
        None => true,
        Some(origin) => allow_list.iter().any(|allowed| allowed == origin),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn sign(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> u64 {
        4_000_000_000
    }

    #[test]
    fn test_token_roundtrip() {
        let user_id = Uuid::new_v4();
        let token = sign(
            &Claims {
                user_id: Some(user_id),
                username: "alice".into(),
                provider: Some("lichess".into()),
                is_guest: None,
                exp: far_future(),
            },
            "s3cret",
        );
        let identity = verify_token(&token, "s3cret").unwrap();
        assert_eq!(identity.user_id, user_id);
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.provider, "lichess");
        assert!(!identity.is_guest);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = sign(
            &Claims {
                user_id: Some(Uuid::new_v4()),
                username: "mallory".into(),
                provider: None,
                is_guest: None,
                exp: far_future(),
            },
            "secret-a",
        );
        assert!(verify_token(&token, "secret-b").is_err());
    }

    #[test]
    fn test_guest_identity_is_deterministic() {
        let a = guest_identity("anon-42");
        let b = guest_identity("anon-42");
        let c = guest_identity("anon-43");
        assert_eq!(a.user_id, b.user_id);
        assert_ne!(a.user_id, c.user_id);
        assert!(a.is_guest);
        assert_eq!(a.provider, "guest");
    }

    #[test]
    fn test_guest_token_derives_user_id() {
        let token = sign(
            &Claims {
                user_id: None,
                username: "anon-42".into(),
                provider: None,
                is_guest: Some(true),
                exp: far_future(),
            },
            "s3cret",
        );
        let identity = verify_token(&token, "s3cret").unwrap();
        assert_eq!(identity, guest_identity("anon-42"));
    }

    #[test]
    fn test_registered_token_requires_user_id() {
        let token = sign(
            &Claims {
                user_id: None,
                username: "nobody".into(),
                provider: None,
                is_guest: None,
                exp: far_future(),
            },
            "s3cret",
        );
        assert!(verify_token(&token, "s3cret").is_err());
    }

    #[test]
    fn test_origin_allow_list() {
        let allowed = vec!["http://localhost:3000".to_string()];
        assert!(origin_allowed(None, &allowed));
        assert!(origin_allowed(Some("http://localhost:3000"), &allowed));
        assert!(!origin_allowed(Some("https://evil.example"), &allowed));
    }
}
