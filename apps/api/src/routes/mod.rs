pub mod health;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::dispatch::DispatchOutcome;
use crate::errors::AppError;
use crate::rpc::{RpcRequest, RpcResponse};
use crate::state::AppState;

/// Primary credential header, with fallbacks in priority order.
const CREDENTIAL_HEADERS: &[&str] = &["x-api-key", "x-vitae-key"];

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/rpc", post(rpc_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize, Default)]
pub struct RpcQuery {
    /// Query-parameter credential fallback. Lowest priority, discouraged;
    /// query strings end up in access logs.
    pub api_key: Option<String>,
}

/// POST /api/v1/rpc, the single method-dispatch endpoint.
async fn rpc_handler(
    State(state): State<AppState>,
    Query(query): Query<RpcQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            let err = AppError::ParseError(e.to_string());
            let response = RpcResponse::failure(&err, state.config.dev_mode, None, None);
            return (err.http_status(), Json(response)).into_response();
        }
    };

    let credential = extract_credential(&headers, query.api_key);
    let outcome = state.dispatcher.handle(request, credential).await;
    render(outcome)
}

fn render(outcome: DispatchOutcome) -> Response {
    let mut response = (outcome.status, Json(outcome.response)).into_response();
    for (name, value) in outcome.headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(&value) else {
            continue;
        };
        response.headers_mut().insert(name, value);
    }
    response
}

/// Resolves the opaque credential: dedicated headers first, then a bearer
/// token, then the query parameter.
fn extract_credential(headers: &HeaderMap, query_key: Option<String>) -> Option<String> {
    for name in CREDENTIAL_HEADERS {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    query_key.filter(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_primary_header_wins() {
        let h = headers(&[
            ("x-api-key", "vk_primary"),
            ("authorization", "Bearer vk_bearer"),
        ]);
        assert_eq!(
            extract_credential(&h, Some("vk_query".into())),
            Some("vk_primary".to_string())
        );
    }

    #[test]
    fn test_bearer_fallback() {
        let h = headers(&[("authorization", "Bearer vk_bearer")]);
        assert_eq!(
            extract_credential(&h, None),
            Some("vk_bearer".to_string())
        );
    }

    #[test]
    fn test_query_param_is_last_resort() {
        let h = headers(&[]);
        assert_eq!(
            extract_credential(&h, Some("vk_query".into())),
            Some("vk_query".to_string())
        );
    }

    #[test]
    fn test_empty_values_ignored() {
        let h = headers(&[("x-api-key", "")]);
        assert_eq!(extract_credential(&h, Some(String::new())), None);
    }
}
