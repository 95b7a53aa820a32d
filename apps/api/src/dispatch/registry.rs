//! Tool registry: maps method names to handler functions.
//!
//! The registry knows nothing about middleware, caching, or transport.
//! Duplicate registration fails fast; `register_replace` exists for the rare
//! caller that genuinely wants overwrite semantics.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::permissions::parse_requirement;
use crate::errors::AppError;

use super::context::ExecutionContext;

/// Owned snapshot of the execution context handed to handlers, so handler
/// futures can be `'static`.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub request_id: Uuid,
    pub method: String,
    pub credential_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub scope_id: Option<Uuid>,
}

impl ToolCall {
    pub fn from_context(ctx: &ExecutionContext) -> Self {
        Self {
            request_id: ctx.request_id,
            method: ctx.method.clone(),
            credential_id: ctx.credential_id,
            user_id: ctx.user_id,
            scope_id: ctx.scope_id,
        }
    }

    /// The user the call operates on behalf of. CRUD handlers require an
    /// authenticated identity even when the method itself was registered.
    pub fn require_user(&self) -> Result<Uuid, AppError> {
        self.user_id.ok_or(AppError::Unauthorized)
    }
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, AppError>> + Send>>;
pub type ToolHandlerFn = Arc<dyn Fn(Map<String, Value>, ToolCall) -> ToolFuture + Send + Sync>;

/// Adapts a plain async fn/closure into the boxed handler shape.
pub fn handler<F, Fut>(f: F) -> ToolHandlerFn
where
    F: Fn(Map<String, Value>, ToolCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, AppError>> + Send + 'static,
{
    Arc::new(move |params, call| Box::pin(f(params, call)))
}

struct RegisteredTool {
    requirements: Vec<(String, String)>,
    handler: ToolHandlerFn,
}

/// Method-name → handler map. Built once at startup, then read-only.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler with its `resource:action` requirements.
    /// Fails with a conflict if the method is already present.
    pub fn register(
        &mut self,
        method: &str,
        requirements: &[&str],
        handler: ToolHandlerFn,
    ) -> Result<(), AppError> {
        if self.tools.contains_key(method) {
            return Err(AppError::Conflict(format!(
                "method '{method}' is already registered"
            )));
        }
        self.insert(method, requirements, handler);
        Ok(())
    }

    /// Explicit overwrite semantics, for callers that mean it.
    pub fn register_replace(
        &mut self,
        method: &str,
        requirements: &[&str],
        handler: ToolHandlerFn,
    ) {
        if self.tools.contains_key(method) {
            tracing::warn!("replacing handler for method '{method}'");
        }
        self.insert(method, requirements, handler);
    }

    fn insert(&mut self, method: &str, requirements: &[&str], handler: ToolHandlerFn) {
        self.tools.insert(
            method.to_string(),
            RegisteredTool {
                requirements: requirements.iter().map(|r| parse_requirement(r)).collect(),
                handler,
            },
        );
    }

    pub fn is_registered(&self, method: &str) -> bool {
        self.tools.contains_key(method)
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Permission requirements declared for a method; empty when the method
    /// is unknown (dispatch will fail anyway).
    pub fn requirements(&self, method: &str) -> &[(String, String)] {
        self.tools
            .get(method)
            .map(|t| t.requirements.as_slice())
            .unwrap_or(&[])
    }

    /// Invokes the handler for `method`, propagating its result or error
    /// unchanged. Fails when no handler is registered.
    pub async fn dispatch(
        &self,
        method: &str,
        params: Map<String, Value>,
        call: ToolCall,
    ) -> Result<Value, AppError> {
        let tool = self
            .tools
            .get(method)
            .ok_or_else(|| AppError::MethodNotFound(method.to_string()))?;
        (tool.handler)(params, call).await
    }
}
