//! Per-call execution context.
//!
//! Created once at ingress, populated by the auth stage, destroyed at the
//! end of the call. No stage may run business logic before `permissions`
//! is set, except the anonymous-allowed methods.

use std::sync::Mutex;
use uuid::Uuid;

use crate::auth::permissions::PermissionSet;

/// Methods that may run without a resolved identity.
pub const ANONYMOUS_METHODS: &[&str] = &["ping", "server_info"];

/// Write-only channel for transport headers. Middleware attaches headers
/// (e.g. cache status) without knowing the transport; the route layer
/// drains them after dispatch.
#[derive(Debug, Default)]
pub struct HeaderSink {
    headers: Mutex<Vec<(String, String)>>,
}

impl HeaderSink {
    pub fn set(&self, name: &str, value: String) {
        if let Ok(mut headers) = self.headers.lock() {
            headers.push((name.to_string(), value));
        }
    }

    pub fn drain(&self) -> Vec<(String, String)> {
        self.headers
            .lock()
            .map(|mut h| std::mem::take(&mut *h))
            .unwrap_or_default()
    }
}

/// State carried through the middleware pipeline for one inbound call.
#[derive(Debug)]
pub struct ExecutionContext {
    pub request_id: Uuid,
    pub method: String,
    /// Opaque credential string from the transport, consumed by the auth
    /// stage. Never logged.
    pub credential: Option<String>,
    /// Identity fields, absent until the auth stage runs.
    pub credential_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    /// Resume scope the call operates on.
    pub scope_id: Option<Uuid>,
    /// Immutable once resolved for the call.
    pub permissions: Option<PermissionSet>,
    /// Opaque pass-through fields for later stages.
    pub rate_limit: Option<i64>,
    pub metadata: serde_json::Value,
    pub headers: HeaderSink,
}

impl ExecutionContext {
    pub fn new(method: &str) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method: method.to_string(),
            credential: None,
            credential_id: None,
            user_id: None,
            scope_id: None,
            permissions: None,
            rate_limit: None,
            metadata: serde_json::Value::Null,
            headers: HeaderSink::default(),
        }
    }

    pub fn is_anonymous_allowed(&self) -> bool {
        ANONYMOUS_METHODS.contains(&self.method.as_str())
    }

    /// Scope id as the string form used in cache keys; falls back to the
    /// user id for account-level methods, then to a fixed anonymous scope.
    pub fn cache_scope(&self) -> String {
        self.scope_id
            .or(self.user_id)
            .map(|id| id.to_string())
            .unwrap_or_else(|| "anonymous".to_string())
    }
}
