//! JSON-RPC-shaped method-dispatch envelope.
//!
//! The wire format tolerates optional fields: `jsonrpc` is validated only
//! when present, `id` may be a string, number, or null, and `params`
//! defaults to an empty object. Responses carry either `result` or `error`,
//! never both.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::AppError;

/// Inbound method-dispatch request.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub jsonrpc: Option<String>,
}

impl RpcRequest {
    /// Validates the envelope shape: non-empty method, object-typed params,
    /// and `jsonrpc: "2.0"` iff the field is present.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.method.trim().is_empty() {
            return Err(AppError::InvalidRequest("method must be non-empty".into()));
        }
        if let Some(version) = &self.jsonrpc {
            if version != "2.0" {
                return Err(AppError::InvalidRequest(format!(
                    "unsupported jsonrpc version '{version}'"
                )));
            }
        }
        if let Some(params) = &self.params {
            if !params.is_object() && !params.is_null() {
                return Err(AppError::InvalidParams("params must be an object".into()));
            }
        }
        Ok(())
    }

    /// Params as an owned object map; absent or null params become empty.
    pub fn params_object(&self) -> Map<String, Value> {
        match &self.params {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }
}

/// Outbound response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcErrorBody {
    pub code: Value,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    pub fn success(result: Value, id: Option<Value>, jsonrpc: Option<String>) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
            jsonrpc,
        }
    }

    pub fn failure(
        err: &AppError,
        dev_mode: bool,
        id: Option<Value>,
        jsonrpc: Option<String>,
    ) -> Self {
        Self {
            result: None,
            error: Some(RpcErrorBody {
                code: err.rpc_code(),
                message: err.public_message(dev_mode),
                data: None,
            }),
            id,
            jsonrpc,
        }
    }
}
