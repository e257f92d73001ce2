// =============================================================================
// Caller Authentication — Axum extractors
// =============================================================================
//
// Two layers:
//
//   1. `ServiceToken` proves the caller is a trusted front end. It checks
//      `Authorization: Bearer <token>` against the token configured through
//      `SIGNAL_API_TOKEN`, in constant time. Without a configured token every
//      gated request is refused.
//   2. `Requester` is the subscriber key that front end acts for, forwarded
//      in the `X-Requester-Key` header. It is only meaningful behind
//      `ServiceToken`: it becomes the owner of new signals and the identity
//      checked on manual close.
//
// Usage as Axum extractors:
//
//   async fn handler(_auth: ServiceToken, Requester(key): Requester, ...) { ... }
//
// Missing or malformed credentials short-circuit with 401; a wrong token or
// an unconfigured server with 403.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::AppState;

pub const REQUESTER_HEADER: &str = "x-requester-key";

/// Longest accepted requester key.
const MAX_KEY_LEN: usize = 128;

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Byte-wise equality that inspects every byte once lengths match.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Whether `presented` matches the configured token. An unset or empty
/// configured token matches nothing.
pub fn token_matches(expected: Option<&str>, presented: &str) -> bool {
    match expected {
        Some(expected) if !expected.is_empty() => {
            constant_time_eq(presented.as_bytes(), expected.as_bytes())
        }
        _ => false,
    }
}

// =============================================================================
// Service token
// =============================================================================

pub struct ServiceToken;

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let code = if self.status == StatusCode::UNAUTHORIZED {
            "UNAUTHENTICATED"
        } else {
            "FORBIDDEN"
        };
        let body = serde_json::json!({
            "error": code,
            "message": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for ServiceToken {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let expected = match state.api_token.as_deref() {
            Some(t) if !t.is_empty() => t,
            _ => {
                warn!("SIGNAL_API_TOKEN is not set — refusing authenticated request");
                return Err(AuthRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "server authentication not configured",
                });
            }
        };

        let presented = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let Some(presented) = presented else {
            warn!("missing or malformed Authorization header");
            return Err(AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "missing bearer token",
            });
        };

        if !token_matches(Some(expected), presented) {
            warn!("invalid service token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "invalid bearer token",
            });
        }
        Ok(ServiceToken)
    }
}

// =============================================================================
// Requester
// =============================================================================

pub struct Requester(pub String);

pub struct RequesterRejection {
    message: &'static str,
}

impl IntoResponse for RequesterRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": "MISSING_REQUESTER",
            "message": self.message,
        });
        (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response()
    }
}

/// Trimmed key if it is usable as an owner identity.
fn parse_key(raw: &str) -> Option<&str> {
    let key = raw.trim();
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.chars().all(|c| c.is_ascii_graphic());
    valid.then_some(key)
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Requester
where
    S: Send + Sync,
{
    type Rejection = RequesterRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = match parts.headers.get(REQUESTER_HEADER).and_then(|v| v.to_str().ok()) {
            Some(v) => v,
            None => {
                warn!("request without requester key");
                return Err(RequesterRejection {
                    message: "missing X-Requester-Key header",
                });
            }
        };

        match parse_key(raw) {
            Some(key) => Ok(Requester(key.to_string())),
            None => {
                warn!("malformed requester key");
                Err(RequesterRejection {
                    message: "malformed X-Requester-Key header",
                })
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_cases() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"short", b"longer_token"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn unset_or_empty_token_matches_nothing() {
        assert!(!token_matches(None, ""));
        assert!(!token_matches(None, "anything"));
        assert!(!token_matches(Some(""), ""));
        assert!(token_matches(Some("s3cret"), "s3cret"));
        assert!(!token_matches(Some("s3cret"), "s3cre"));
    }

    #[test]
    fn accepts_plain_keys() {
        assert_eq!(parse_key("alice"), Some("alice"));
        assert_eq!(parse_key("  tg:12345 "), Some("tg:12345"));
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        assert_eq!(parse_key(""), None);
        assert_eq!(parse_key("   "), None);
        assert_eq!(parse_key("two words"), None);
    }

    #[test]
    fn rejects_overlong_keys() {
        let long = "k".repeat(MAX_KEY_LEN + 1);
        assert_eq!(parse_key(&long), None);
    }
}
