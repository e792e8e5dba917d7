//! HTTP RPC and WebSocket wire shapes (spec section 6).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `POST /transmission/rpc` request body.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
    pub tag: Option<i64>,
}

/// `POST /transmission/rpc` response body.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub result: &'static str,
    pub arguments: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<i64>,
}

impl RpcResponse {
    pub fn success(arguments: Value, tag: Option<i64>) -> Self {
        Self {
            result: "success",
            arguments,
            tag,
        }
    }
}

/// Server -> client WebSocket frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WsServerMessage {
    SyncSnapshot {
        sequence: u64,
        data: Value,
    },
    SyncPatch {
        sequence: u64,
        data: Value,
    },
    Event {
        name: &'static str,
        data: Value,
    },
}
