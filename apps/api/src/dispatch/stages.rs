//! The five concrete pipeline stages, composed strictly in this order:
//! logging → authentication → sanitization → error-normalization → analytics.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::auth::AuthService;
use crate::errors::AppError;
use crate::store::{Store, UsageRecord};

use super::context::ExecutionContext;
use super::middleware::{Middleware, Next};

/// Parameter keys with this prefix are reserved for the runtime and are
/// stripped before any handler sees them.
const RESERVED_PARAM_PREFIX: &str = "_";

/// Outermost stage: one log line in, one out, tagged with the request id.
pub struct LoggingStage;

#[async_trait]
impl Middleware for LoggingStage {
    async fn handle(
        &self,
        params: Map<String, Value>,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<Value, AppError> {
        info!(request_id = %ctx.request_id, method = %ctx.method, "dispatch start");
        let result = next.run(params, ctx).await;
        match &result {
            Ok(_) => debug!(request_id = %ctx.request_id, "dispatch ok"),
            Err(e) => debug!(request_id = %ctx.request_id, code = e.code(), "dispatch failed"),
        }
        result
    }
}

/// Resolves the transport credential into identity + expanded permissions.
/// Anonymous-allowed methods pass through without a credential; everything
/// else aborts the pipeline with `UNAUTHORIZED` here, before any business
/// logic runs.
pub struct AuthStage {
    auth: Arc<AuthService>,
}

impl AuthStage {
    pub fn new(auth: Arc<AuthService>) -> Self {
        Self { auth }
    }
}

#[async_trait]
impl Middleware for AuthStage {
    async fn handle(
        &self,
        params: Map<String, Value>,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<Value, AppError> {
        match ctx.credential.take() {
            Some(credential) => {
                let fragment = self.auth.authenticate(&credential).await?;
                ctx.credential_id = Some(fragment.credential_id);
                ctx.user_id = Some(fragment.user_id);
                ctx.scope_id = fragment.scope_id;
                ctx.rate_limit = fragment.rate_limit;
                ctx.permissions = Some(fragment.permissions);
            }
            None if ctx.is_anonymous_allowed() => {}
            None => return Err(AppError::Unauthorized),
        }
        next.run(params, ctx).await
    }
}

/// Strips reserved-prefix parameter keys and trims string values before the
/// handler sees them.
pub struct SanitizeStage;

#[async_trait]
impl Middleware for SanitizeStage {
    async fn handle(
        &self,
        params: Map<String, Value>,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<Value, AppError> {
        let sanitized = params
            .into_iter()
            .filter(|(key, _)| !key.starts_with(RESERVED_PARAM_PREFIX))
            .map(|(key, value)| match value {
                Value::String(s) => (key, Value::String(s.trim().to_string())),
                other => (key, other),
            })
            .collect();
        next.run(sanitized, ctx).await
    }
}

/// Classifies anything raised downstream into the closed taxonomy. Errors
/// arrive as typed `AppError` values; the single fallback arm catches
/// wrapped external failures and logs them before they reach the caller.
pub struct NormalizeStage;

#[async_trait]
impl Middleware for NormalizeStage {
    async fn handle(
        &self,
        params: Map<String, Value>,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<Value, AppError> {
        next.run(params, ctx).await.map_err(|err| match err {
            typed @ (AppError::InvalidRequest(_)
            | AppError::ParseError(_)
            | AppError::MethodNotFound(_)
            | AppError::InvalidParams(_)
            | AppError::Unauthorized
            | AppError::InvalidCredential
            | AppError::Forbidden(_)
            | AppError::NotFound(_)
            | AppError::Conflict(_)
            | AppError::RateLimited
            | AppError::QuotaExceeded
            | AppError::Validation(_)
            | AppError::Upstream(_)
            | AppError::Timeout(_)
            | AppError::Database(_)
            | AppError::Cache(_)) => typed,
            fallback => {
                tracing::error!(code = fallback.code(), "unclassified error normalized");
                fallback
            }
        })
    }
}

/// Innermost stage: measures wall-clock duration and emits a structured
/// usage record on both the success and failure paths. The store write is
/// fire-and-forget.
pub struct AnalyticsStage {
    store: Store,
}

impl AnalyticsStage {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Middleware for AnalyticsStage {
    async fn handle(
        &self,
        params: Map<String, Value>,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<Value, AppError> {
        let started = Instant::now();
        let result = next.run(params, ctx).await;

        let record = UsageRecord {
            request_id: ctx.request_id,
            method: ctx.method.clone(),
            credential_id: ctx.credential_id,
            duration_ms: started.elapsed().as_millis() as i64,
            success: result.is_ok(),
            error_code: result.as_ref().err().map(|e| e.code().to_string()),
        };
        debug!(
            method = %record.method,
            duration_ms = record.duration_ms,
            success = record.success,
            "usage"
        );
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.insert_usage_log(&record).await {
                tracing::warn!("usage log not persisted: {e}");
            }
        });

        result
    }
}
