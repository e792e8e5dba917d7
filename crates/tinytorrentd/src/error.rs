//! Typed error taxonomy (spec section 7).
//!
//! Mirrors the split `librqbit::error::Error` / `librqbit::api_error::ApiError`
//! use: an internal `thiserror` enum, plus a thin wrapper that knows how to
//! turn itself into the wire-shaped `{result:"error", ...}` JSON body or an
//! HTTP status code, depending on which layer is doing the talking.

use http::StatusCode;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    InvalidArgument,
    EmptyPayload,
    InvalidJson,
    UnsupportedMethod,
    EngineUnavailable,
    EngineBusy,
    Cancelled,
    NotFound,
    Duplicate,
    PathUnreachable,
    PermissionDenied,
    MetainfoReadFailure,
    InvalidSequence,
    Internal,
}

impl Kind {
    /// Extended numeric error codes from spec section 6.
    pub fn code(self) -> Option<u32> {
        match self {
            Kind::PathUnreachable => Some(4001),
            Kind::MetainfoReadFailure => Some(4002),
            Kind::PermissionDenied => Some(4003),
            Kind::InvalidSequence => Some(4004),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("{message}")]
pub struct DaemonError {
    pub kind: Kind,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl DaemonError {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(kind: Kind, message: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn engine_unavailable() -> Self {
        Self::new(Kind::EngineUnavailable, "engine unavailable")
    }

    pub fn engine_busy() -> Self {
        Self::new(Kind::EngineBusy, "engine-busy")
    }

    pub fn cancelled() -> Self {
        Self::new(Kind::Cancelled, "cancelled")
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(Kind::NotFound, format!("{what} not found"))
    }

    /// Transport errors (auth, host, transport framing) get a real HTTP status.
    /// Validation errors stay 200 with `{result:"error"}` per spec section 7.
    pub fn http_status(&self) -> StatusCode {
        match self.kind {
            Kind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::OK,
        }
    }

    /// The RPC-shaped body: `{result:"error", arguments:{message, code?}}`.
    pub fn to_rpc_body(&self, tag: Option<i64>) -> serde_json::Value {
        let mut arguments = serde_json::json!({ "message": self.message });
        if let Some(code) = self.kind.code() {
            arguments["code"] = serde_json::json!(code);
        }
        let mut body = serde_json::json!({
            "result": "error",
            "arguments": arguments,
        });
        if let Some(tag) = tag {
            body["tag"] = serde_json::json!(tag);
        }
        body
    }
}

impl From<anyhow::Error> for DaemonError {
    fn from(value: anyhow::Error) -> Self {
        Self::with_source(Kind::Internal, format!("{value:#}"), value)
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
