//! Wire message types.
//!
//! Requests go out as `{"reqId", "method", "args"}`. Everything that comes back
//! is decoded once, at the boundary, into [`Inbound`]: a response when the
//! message carries `reqId`, a push message when it carries `type`.
//!
//! ```text
//! -> {"reqId": 3, "method": "openDoc", "args": ["doc1"]}
//! <- {"reqId": 3, "data": {...}}
//! <- {"reqId": 4, "error": "bad args", "errorCode": "E_ARGS"}
//! <- {"type": "docUserAction", "docFD": 0, "data": {...}}
//! ```

use crate::destination::DestinationKey;
use crate::error::{CommError, Result, ServerFailure};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub req_id: u64,
    pub method: String,
    pub args: Vec<Value>,
}

impl Request {
    pub fn new(req_id: u64, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            req_id,
            method: method.into(),
            args,
        }
    }

    /// Serialize to the JSON text handed to the transport.
    pub fn to_message(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Response as it appears on the wire, before classification.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResponse {
    req_id: u64,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    should_fork: Option<bool>,
    #[serde(default)]
    details: Option<Value>,
}

/// Response to a request, tagged with the request id it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub req_id: u64,
    /// Machine code sent with the response, even when `error` is empty.
    pub error_code: Option<String>,
    pub outcome: std::result::Result<Value, ServerFailure>,
}

impl Response {
    /// Whether the server reported that view access was lost.
    pub fn is_access_lost(&self) -> bool {
        self.error_code.as_deref() == Some(crate::config::ProtocolConfig::AUTH_NO_VIEW)
    }
}

impl From<RawResponse> for Response {
    fn from(raw: RawResponse) -> Self {
        // An empty or null error string still counts as success.
        let outcome = match raw.error {
            Some(message) if !message.is_empty() => Err(ServerFailure {
                message,
                code: raw.error_code.clone(),
                details: raw.details,
                should_fork: raw.should_fork,
            }),
            _ => Ok(raw.data.unwrap_or(Value::Null)),
        };
        Self {
            req_id: raw.req_id,
            error_code: raw.error_code,
            outcome,
        }
    }
}

/// Recognized push message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PushKind {
    /// The connection is (re)established; carries the session id.
    ClientConnect,
    DocListAction,
    DocUserAction,
    DocShutdown,
    ClientLogout,
    ProfileFetch,
    UserSettings,
    ReceiveInvites,
}

impl PushKind {
    pub const ALL: [PushKind; 8] = [
        PushKind::ClientConnect,
        PushKind::DocListAction,
        PushKind::DocUserAction,
        PushKind::DocShutdown,
        PushKind::ClientLogout,
        PushKind::ProfileFetch,
        PushKind::UserSettings,
        PushKind::ReceiveInvites,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PushKind::ClientConnect => "clientConnect",
            PushKind::DocListAction => "docListAction",
            PushKind::DocUserAction => "docUserAction",
            PushKind::DocShutdown => "docShutdown",
            PushKind::ClientLogout => "clientLogout",
            PushKind::ProfileFetch => "profileFetch",
            PushKind::UserSettings => "userSettings",
            PushKind::ReceiveInvites => "receiveInvites",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        PushKind::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl std::fmt::Display for PushKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Push message as it appears on the wire.
#[derive(Debug, Deserialize)]
struct RawPush {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "docFD", default)]
    doc_fd: Option<Value>,
    #[serde(default)]
    data: Value,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// A server-initiated message not tied to any request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: PushKind,
    /// Destination of the connection the message arrived on.
    #[serde(skip)]
    pub destination: DestinationKey,
    /// Per-client handle of the open document the message is scoped to.
    #[serde(rename = "docFD", skip_serializing_if = "Option::is_none")]
    pub doc_fd: Option<Value>,
    pub data: Value,
    /// Any other top-level fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PushMessage {
    /// Session id announced by a connection-established message.
    pub fn session_id(&self) -> Option<String> {
        match self.data.get(crate::config::ProtocolConfig::SESSION_ID_FIELD)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Inbound message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(Response),
    Push(PushMessage),
    /// Push message whose type tag is not in the recognized set.
    UnknownPush(String),
}

impl Inbound {
    /// Decode a raw text message received on the connection for `destination`.
    pub fn decode(raw: &str, destination: &DestinationKey) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(ref object) = value else {
            return Err(CommError::Protocol {
                message: "message is not a JSON object".to_string(),
            });
        };

        if object.contains_key("reqId") {
            let response: RawResponse = serde_json::from_value(value)?;
            return Ok(Inbound::Response(response.into()));
        }

        if object.contains_key("type") {
            let push: RawPush = serde_json::from_value(value)?;
            return Ok(match PushKind::from_wire(&push.kind) {
                Some(kind) => Inbound::Push(PushMessage {
                    kind,
                    destination: destination.clone(),
                    doc_fd: push.doc_fd,
                    data: push.data,
                    extra: push.extra,
                }),
                None => Inbound::UnknownPush(push.kind),
            });
        }

        Err(CommError::Protocol {
            message: "message has neither reqId nor type".to_string(),
        })
    }
}
