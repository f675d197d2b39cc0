// =============================================================================
// Admin Token Authentication
// =============================================================================
//
// Every non-public route takes `AuthBearer` as its first extractor. It checks
// `Authorization: Bearer <token>` against the `FORESIGHT_ADMIN_TOKEN`
// environment variable and short-circuits with a 403 before the handler body
// runs. The rejection is a regular `PipelineError::Denied` serialised through
// the same `{code, message}` body the dispatch boundary uses.
//
// The token comparison is constant time. The env var is re-read per request
// so the token can be rotated without a restart.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::error::PipelineError;

const TOKEN_ENV: &str = "FORESIGHT_ADMIN_TOKEN";

/// Byte-wise comparison that always walks both slices in full, so a mismatch
/// position cannot be recovered from response timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        // A length mismatch leaks only that the lengths differ; the expected
        // token length is not attacker-controlled.
        return false;
    }

    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Extractor yielding the validated bearer token for audit logging.
pub struct AuthBearer(pub String);

/// Authentication failure, carried as the shared pipeline error type so the
/// wire body matches every other denied operation.
pub struct AuthRejection(PipelineError);

impl AuthRejection {
    fn denied(message: &str) -> Self {
        Self(PipelineError::denied(message))
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::FORBIDDEN);
        (status, axum::Json(self.0.to_body(None))).into_response()
    }
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var(TOKEN_ENV).unwrap_or_default();
        if expected.is_empty() {
            warn!("{TOKEN_ENV} is not set — all authenticated requests will be rejected");
            return Err(AuthRejection::denied("server authentication not configured"));
        }

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match header.and_then(|v| v.strip_prefix("Bearer ")) {
            Some(token) => token,
            None => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection::denied("missing or invalid authorization token"));
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AuthRejection::denied("invalid authorization token"));
        }

        Ok(AuthBearer(token.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_identical() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer_string"));
    }

    #[test]
    fn constant_time_eq_empty() {
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn constant_time_eq_single_bit_diff() {
        assert!(!constant_time_eq(b"\x00", b"\x01"));
    }

    #[tokio::test]
    async fn extractor_accepts_matching_token_and_rejects_others() {
        std::env::set_var(TOKEN_ENV, "secret-token");

        let (mut parts, _) = axum::http::Request::builder()
            .header("Authorization", "Bearer secret-token")
            .body(())
            .unwrap()
            .into_parts();
        let ok = AuthBearer::from_request_parts(&mut parts, &()).await;
        assert!(matches!(ok, Ok(AuthBearer(t)) if t == "secret-token"));

        let (mut parts, _) = axum::http::Request::builder()
            .header("Authorization", "Bearer wrong-token")
            .body(())
            .unwrap()
            .into_parts();
        assert!(AuthBearer::from_request_parts(&mut parts, &()).await.is_err());

        let (mut parts, _) = axum::http::Request::builder().body(()).unwrap().into_parts();
        assert!(AuthBearer::from_request_parts(&mut parts, &()).await.is_err());
    }

    #[tokio::test]
    async fn rejection_uses_the_denied_wire_shape() {
        let rejection = AuthRejection::denied("invalid authorization token");
        let response = rejection.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
