// =============================================================================
// Bearer Token Authentication — Axum extractor
// =============================================================================
//
// Validates `Authorization: Bearer <token>` against the
// `MERIDIAN_ADMIN_TOKEN` environment variable. The token is re-read per
// request so rotation needs no restart, and the comparison runs in
// constant time.
// =============================================================================

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Compare two byte slices in constant time, touching every byte even after
/// a mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Extractor yielding the validated token, or a 403 before the handler runs.
pub struct AuthBearer(pub String);

pub struct AuthRejection {
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var("MERIDIAN_ADMIN_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            warn!("MERIDIAN_ADMIN_TOKEN is not set — rejecting authenticated request");
            return Err(AuthRejection {
                message: "Server authentication not configured",
            });
        }

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match token {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
                Ok(AuthBearer(token.to_string()))
            }
            Some(_) => {
                warn!("invalid admin token presented");
                Err(AuthRejection {
                    message: "Invalid authorization token",
                })
            }
            None => Err(AuthRejection {
                message: "Missing or invalid authorization token",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_match() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn different_inputs_do_not_match() {
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }
}
