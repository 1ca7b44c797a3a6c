//! Wire frames for the WebSocket RPC protocol.
//!
//! Requests and responses are JSON text frames correlated by a numeric id.
//! Frames without an id are server-initiated notifications; the driver
//! currently ignores them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An outgoing RPC request.
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    /// Correlation id, unique per session.
    pub id: u64,
    /// Method name (`signin`, `use`, `query`, `ping`).
    pub method: &'a str,
    /// Positional parameters.
    pub params: Value,
}

/// An incoming RPC response.
#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    /// Correlation id; absent on notifications.
    pub id: Option<u64>,
    /// Successful payload.
    #[serde(default)]
    pub result: Option<Value>,
    /// Application-level failure.
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

/// The error object carried by a failed response.
#[derive(Debug, Deserialize)]
pub struct RpcErrorBody {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}
