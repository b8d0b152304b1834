use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Actions the host sends to the worker, plus the one callback action the
/// worker sends back.
pub mod actions {
    pub const START: &str = "start";
    pub const SHUTDOWN: &str = "shutdown";
    pub const SEND_TO_TARGET: &str = "sendToTarget";
    pub const SEND_TO_PANE: &str = "sendToPane";
    pub const BROADCAST: &str = "broadcast";
    pub const GET_CLIENTS: &str = "getClients";
    pub const ON_MESSAGE: &str = "onMessage";
}

/// Stable error codes carried in the `code` field of error responses.
pub mod codes {
    pub const WORKER_ERROR: &str = "WORKER_ERROR";
    pub const HANDLER_ERROR: &str = "HANDLER_ERROR";
    pub const NOT_STARTED: &str = "NOT_STARTED";
    pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";
    pub const BAD_PAYLOAD: &str = "BAD_PAYLOAD";
}

/// One frame on the host/worker channel. The union is closed: an unknown
/// `kind` fails to parse instead of flowing through half-typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WireFrame {
    /// Host-initiated RPC.
    Request {
        req_id: String,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Worker's answer to a `Request` with the same `req_id`.
    Response {
        req_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// Worker-initiated call that the host must answer.
    Callback {
        req_id: String,
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Host's answer to a `Callback` with the same `req_id`.
    CallbackResponse {
        req_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl WireFrame {
    pub fn request(req_id: impl Into<String>, action: impl Into<String>, payload: Option<Value>) -> Self {
        Self::Request {
            req_id: req_id.into(),
            action: action.into(),
            payload,
        }
    }

    pub fn ok_response(req_id: impl Into<String>, result: Option<Value>) -> Self {
        Self::Response {
            req_id: req_id.into(),
            ok: true,
            result,
            error: None,
            code: None,
        }
    }

    pub fn error_response(
        req_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Response {
            req_id: req_id.into(),
            ok: false,
            result: None,
            error: Some(message.into()),
            code: Some(code.into()),
        }
    }

    pub fn callback(req_id: impl Into<String>, action: impl Into<String>, payload: Option<Value>) -> Self {
        Self::Callback {
            req_id: req_id.into(),
            action: action.into(),
            payload,
        }
    }

    pub fn callback_ok(req_id: impl Into<String>, result: Option<Value>) -> Self {
        Self::CallbackResponse {
            req_id: req_id.into(),
            ok: true,
            result,
            error: None,
            code: None,
        }
    }

    pub fn callback_error(
        req_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::CallbackResponse {
            req_id: req_id.into(),
            ok: false,
            result: None,
            error: Some(message.into()),
            code: Some(code.into()),
        }
    }

    pub fn req_id(&self) -> &str {
        match self {
            Self::Request { req_id, .. }
            | Self::Response { req_id, .. }
            | Self::Callback { req_id, .. }
            | Self::CallbackResponse { req_id, .. } => req_id,
        }
    }

    /// The wire value of `kind`, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Callback { .. } => "callback",
            Self::CallbackResponse { .. } => "callback-response",
        }
    }
}

/// Options carried by the `start` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    /// Requested listen port; 0 asks the worker for an ephemeral one.
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_scope_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StartPayload {
    #[serde(default)]
    pub options: StartOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResult {
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownResult {
    pub shutdown: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendToTargetPayload {
    pub target: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendToPanePayload {
    pub pane_id: String,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub content: Value,
    #[serde(default)]
    pub options: BroadcastOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_target: Option<String>,
}

/// Payload of the `onMessage` callback: the client frame being surfaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnMessagePayload {
    pub data: Value,
}

/// One connected broker client, as reported by `getClients`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}
