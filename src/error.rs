// =============================================================================
// Pipeline Error Taxonomy
// =============================================================================
//
// Four families of failure, matching how the workers and the dispatch
// boundary treat them:
//
//   Transient    — network/LLM/timeout; retried on the next scheduled pass.
//   Validation   — bad input (invalid symbol prefix, malformed thresholds);
//                  rejected immediately, no partial write.
//   Consistency  — test/production crossing or misconfiguration; fatal for
//                  the operation, logged loudly, never coerced.
//   NotFound /   — unknown entity or scope ownership mismatch, surfaced as a
//   Denied         typed error to the caller.
//
// The dispatch boundary serialises these into `{code, message, details}`
// without leaking internal detail.
// =============================================================================

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Typed error for every core pipeline operation.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Transient external failure (network, LLM provider, timeout). The unit
    /// of work is retried on the next scheduled pass, never synchronously.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// Input rejected before any write. `code` is a stable machine-readable
    /// identifier such as `INVALID_SYMBOL` or `INVALID_THRESHOLDS`.
    #[error("validation failed [{code}]: {message}")]
    Validation { code: &'static str, message: String },

    /// Test/production isolation or configuration violated. Fatal for the
    /// operation.
    #[error("consistency violation: {message}")]
    Consistency { message: String },

    /// Referenced entity does not exist.
    #[error("not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    /// Caller does not own the referenced scope.
    #[error("denied: {message}")]
    Denied { message: String },
}

impl PipelineError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into() }
    }

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation { code, message: message.into() }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency { message: message.into() }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::Denied { message: message.into() }
    }

    /// Stable error code for the HTTP/dispatch boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "TRANSIENT",
            Self::Validation { code, .. } => code,
            Self::Consistency { .. } => "CONSISTENCY_VIOLATION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Denied { .. } => "DENIED",
        }
    }

    /// HTTP status the dispatch boundary maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Transient { .. } => 503,
            Self::Validation { .. } => 400,
            Self::Consistency { .. } => 500,
            Self::NotFound { .. } => 404,
            Self::Denied { .. } => 403,
        }
    }

    /// Convert to the structured wire body, optionally attaching details
    /// (e.g. the failing backtest criteria for a rejected promotion).
    pub fn to_body(&self, details: Option<Value>) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            details,
        }
    }
}

/// Structured error body crossing the routing boundary.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_carries_code() {
        let e = PipelineError::validation("INVALID_SYMBOL", "symbol AAPL lacks T_ prefix");
        assert_eq!(e.code(), "INVALID_SYMBOL");
        assert_eq!(e.http_status(), 400);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(PipelineError::transient("x").http_status(), 503);
        assert_eq!(PipelineError::consistency("x").http_status(), 500);
        assert_eq!(PipelineError::not_found("universe", "u1").http_status(), 404);
        assert_eq!(PipelineError::denied("x").http_status(), 403);
    }

    #[test]
    fn body_serialises_without_details() {
        let body = PipelineError::not_found("target", "t1").to_body(None);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "NOT_FOUND");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn body_serialises_with_details() {
        let e = PipelineError::validation("BACKTEST_CRITERIA", "2 criteria failed");
        let body = e.to_body(Some(serde_json::json!({
            "failing": ["min_sample_size", "min_significance"],
        })));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["details"]["failing"][0], "min_sample_size");
    }
}
