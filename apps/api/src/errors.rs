use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;
use thiserror::Error;

/// Application-level error type: the closed taxonomy every handler and
/// middleware stage raises. The error-normalization stage matches on this
/// enum exhaustively; nothing in the codebase classifies errors by message
/// substring.
///
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Forbidden: missing permission {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Quota exceeded")]
    QuotaExceeded,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Upstream timeout: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable application string code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::ParseError(_) => "PARSE_ERROR",
            AppError::MethodNotFound(_) => "METHOD_NOT_FOUND",
            AppError::InvalidParams(_) => "INVALID_PARAMS",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::InvalidCredential => "INVALID_CREDENTIAL",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "RESOURCE_NOT_FOUND",
            AppError::Conflict(_) => "RESOURCE_CONFLICT",
            AppError::RateLimited => "RATE_LIMIT_EXCEEDED",
            AppError::QuotaExceeded => "QUOTA_EXCEEDED",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Upstream(_) => "UPSTREAM_ERROR",
            AppError::Timeout(_) => "UPSTREAM_TIMEOUT",
            AppError::Database(_) | AppError::Cache(_) => "UPSTREAM_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// JSON-RPC error `code` field. Protocol-level failures use the fixed
    /// negative integers; application failures use their string code.
    pub fn rpc_code(&self) -> Value {
        match self {
            AppError::ParseError(_) => json!(-32700),
            AppError::InvalidRequest(_) => json!(-32600),
            AppError::MethodNotFound(_) => json!(-32601),
            AppError::InvalidParams(_) => json!(-32602),
            AppError::Internal(_) => json!(-32603),
            other => json!(other.code()),
        }
    }

    /// Deterministic HTTP status per error kind.
    pub fn http_status(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_)
            | AppError::ParseError(_)
            | AppError::InvalidParams(_)
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized | AppError::InvalidCredential => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::MethodNotFound(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::RateLimited | AppError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream(_) | AppError::Database(_) | AppError::Cache(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message destined for the caller. In production mode internal
    /// identifiers (store names, file paths, IPs, emails) are scrubbed;
    /// store-level failures are replaced wholesale.
    pub fn public_message(&self, dev_mode: bool) -> String {
        match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                if dev_mode {
                    format!("Database error: {e}")
                } else {
                    "A storage error occurred".to_string()
                }
            }
            AppError::Cache(e) => {
                tracing::error!("Cache error: {e}");
                if dev_mode {
                    format!("Cache error: {e}")
                } else {
                    "A cache error occurred".to_string()
                }
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                if dev_mode {
                    format!("Internal error: {e}")
                } else {
                    "An internal server error occurred".to_string()
                }
            }
            other => {
                let message = other.to_string();
                if dev_mode {
                    message
                } else {
                    scrub_identifiers(&message)
                }
            }
        }
    }
}

/// Replaces patterns that could leak internal identifiers: email addresses,
/// absolute file paths, raw IPs, and schema-qualified store names. The path
/// rule anchors on a start-of-message or whitespace boundary so URL paths
/// and slash-delimited tokens embedded in larger words survive.
fn scrub_identifiers(message: &str) -> String {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            // emails first so user@host.tld is not half-eaten by the IP rule
            (
                Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(),
                "[redacted]",
            ),
            // absolute file paths with two or more segments
            (
                Regex::new(r"(^|\s)(/[\w.\-]+){2,}").unwrap(),
                "${1}[redacted]",
            ),
            // dotted-quad IPs
            (
                Regex::new(r"\b(\d{1,3}\.){3}\d{1,3}\b").unwrap(),
                "[redacted]",
            ),
            // schema-qualified store identifiers (table.column)
            (
                Regex::new(r"\b[a-z_]+_(logs|keys|entries|transactions|captures)\.[a-z_]+\b")
                    .unwrap(),
                "[redacted]",
            ),
        ]
    });

    let mut scrubbed = message.to_string();
    for (re, replacement) in patterns {
        scrubbed = re.replace_all(&scrubbed, *replacement).into_owned();
    }
    scrubbed
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(false)
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_code_protocol_errors_are_integers() {
        assert_eq!(AppError::ParseError("x".into()).rpc_code(), json!(-32700));
        assert_eq!(
            AppError::InvalidRequest("x".into()).rpc_code(),
            json!(-32600)
        );
        assert_eq!(
            AppError::MethodNotFound("ghost".into()).rpc_code(),
            json!(-32601)
        );
        assert_eq!(AppError::InvalidParams("x".into()).rpc_code(), json!(-32602));
    }

    #[test]
    fn test_rpc_code_application_errors_are_strings() {
        assert_eq!(AppError::Unauthorized.rpc_code(), json!("UNAUTHORIZED"));
        assert_eq!(
            AppError::Forbidden("experience:write".into()).rpc_code(),
            json!("FORBIDDEN")
        );
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            AppError::Unauthorized.http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Forbidden("x".into()).http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::NotFound("x".into()).http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Conflict("x".into()).http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::RateLimited.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::Upstream("x".into()).http_status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::Timeout("llm".into()).http_status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_scrub_removes_paths_ips_emails() {
        let scrubbed =
            scrub_identifiers("failed at /var/lib/vitae/data.db from 10.0.0.12 for a@b.com");
        assert!(!scrubbed.contains("/var/lib"));
        assert!(!scrubbed.contains("10.0.0.12"));
        assert!(!scrubbed.contains("a@b.com"));
        assert!(scrubbed.contains("[redacted]"));
    }

    #[test]
    fn test_scrub_leaves_urls_and_slash_tokens_alone() {
        let scrubbed = scrub_identifiers(
            "fetch https://api.example.com/v1/users failed for group a/b/c (text/html)",
        );
        assert!(scrubbed.contains("https://api.example.com/v1/users"));
        assert!(scrubbed.contains("a/b/c"));
        assert!(scrubbed.contains("text/html"));
        assert!(!scrubbed.contains("[redacted]"));
    }

    #[test]
    fn test_dev_mode_preserves_message() {
        let err = AppError::Validation("path /etc/vitae/config.toml invalid".into());
        assert!(err.public_message(true).contains("/etc/vitae/config.toml"));
        assert!(!err.public_message(false).contains("/etc/vitae/config.toml"));
    }
}
