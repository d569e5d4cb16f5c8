//! Wire message types for the yues pipe protocol.
//!
//! Every record is a JSON object with a `type` discriminant. Requests and
//! their results carry an `id` correlation field; `INIT` and `POSTMESSAGE`
//! are unsolicited.
//!
//! ```text
//! client → server   {"type":"CALL","id":"…","ref":"h1","args":[1,2]}
//! server → client   {"type":"CALL_R","id":"…","res":3}
//! server → client   {"type":"CALL_R","id":"…","err":"boom"}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, Result};

// =============================================================================
// Function Handles
// =============================================================================

/// Server-issued reference naming a registered function.
///
/// The client only round-trips it in later `CALL`/`REMOVE` requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionHandle(String);

impl FunctionHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Client → Server
// =============================================================================

/// A request record as written to the server's inbound pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "CREATE")]
    CreateFunction {
        id: String,
        body: String,
        args: Vec<String>,
    },
    #[serde(rename = "CALL")]
    CallFunction {
        id: String,
        #[serde(rename = "ref")]
        function: FunctionHandle,
        args: Vec<Value>,
    },
    #[serde(rename = "REMOVE")]
    RemoveFunction {
        id: String,
        #[serde(rename = "ref")]
        function: FunctionHandle,
    },
    #[serde(rename = "IIFE")]
    Iife {
        id: String,
        body: String,
        #[serde(rename = "argNames")]
        arg_names: Vec<String>,
        args: Vec<Value>,
    },
}

impl ClientMessage {
    pub fn id(&self) -> &str {
        match self {
            ClientMessage::CreateFunction { id, .. }
            | ClientMessage::CallFunction { id, .. }
            | ClientMessage::RemoveFunction { id, .. }
            | ClientMessage::Iife { id, .. } => id,
        }
    }

    /// Kind of the result record the server answers this request with.
    pub fn response_kind(&self) -> ResponseKind {
        match self {
            ClientMessage::CreateFunction { .. } => ResponseKind::CreateFunction,
            ClientMessage::CallFunction { .. } => ResponseKind::CallFunction,
            ClientMessage::RemoveFunction { .. } => ResponseKind::RemoveFunction,
            ClientMessage::Iife { .. } => ResponseKind::Iife,
        }
    }
}

/// A request before a correlation id has been assigned.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    CreateFunction {
        body: String,
        args: Vec<String>,
    },
    CallFunction {
        function: FunctionHandle,
        args: Vec<Value>,
    },
    RemoveFunction {
        function: FunctionHandle,
    },
    Iife {
        body: String,
        arg_names: Vec<String>,
        args: Vec<Value>,
    },
}

impl Request {
    pub fn into_message(self, id: String) -> ClientMessage {
        match self {
            Request::CreateFunction { body, args } => ClientMessage::CreateFunction { id, body, args },
            Request::CallFunction { function, args } => {
                ClientMessage::CallFunction { id, function, args }
            }
            Request::RemoveFunction { function } => ClientMessage::RemoveFunction { id, function },
            Request::Iife {
                body,
                arg_names,
                args,
            } => ClientMessage::Iife {
                id,
                body,
                arg_names,
                args,
            },
        }
    }
}

// =============================================================================
// Server → Client
// =============================================================================

/// Success or failure payload of a `*_R` record.
///
/// `err` takes precedence: a record carrying it, with any value, is a
/// failure whatever else it contains. A record with neither key succeeds
/// with `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outcome {
    Failure {
        #[serde(deserialize_with = "error_text")]
        err: String,
    },
    Success {
        #[serde(default)]
        res: Value,
    },
}

/// Non-string error values are kept as their JSON text.
fn error_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => text,
        other => other.to_string(),
    })
}

impl Outcome {
    pub fn into_result(self) -> Result<Value> {
        match self {
            Outcome::Success { res } => Ok(res),
            Outcome::Failure { err } => Err(BridgeError::Application(err)),
        }
    }
}

/// A record read from the server's outbound pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "INIT")]
    Init,
    #[serde(rename = "CREATE_R")]
    CreateFunctionResult {
        id: String,
        #[serde(flatten)]
        outcome: Outcome,
    },
    #[serde(rename = "CALL_R")]
    CallFunctionResult {
        id: String,
        #[serde(flatten)]
        outcome: Outcome,
    },
    #[serde(rename = "REMOVE_R")]
    RemoveFunctionResult {
        id: String,
        #[serde(flatten)]
        outcome: Outcome,
    },
    #[serde(rename = "IIFE_R")]
    IifeResult {
        id: String,
        #[serde(flatten)]
        outcome: Outcome,
    },
    #[serde(rename = "POSTMESSAGE")]
    PostedMessage { val: Value },
}

/// Discriminant of a correlated result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    CreateFunction,
    CallFunction,
    RemoveFunction,
    Iife,
}

impl ResponseKind {
    pub fn wire_tag(&self) -> &'static str {
        match self {
            ResponseKind::CreateFunction => "CREATE_R",
            ResponseKind::CallFunction => "CALL_R",
            ResponseKind::RemoveFunction => "REMOVE_R",
            ResponseKind::Iife => "IIFE_R",
        }
    }
}

/// Composite key of the correlation table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub kind: ResponseKind,
    pub id: String,
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.wire_tag(), self.id)
    }
}

/// A result record split into its correlation key and outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub key: CorrelationKey,
    pub outcome: Outcome,
}

/// Classification of an inbound record for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ready,
    Notification(Value),
    Response(Response),
}

impl From<ServerMessage> for Inbound {
    fn from(message: ServerMessage) -> Self {
        let (kind, id, outcome) = match message {
            ServerMessage::Init => return Inbound::Ready,
            ServerMessage::PostedMessage { val } => return Inbound::Notification(val),
            ServerMessage::CreateFunctionResult { id, outcome } => {
                (ResponseKind::CreateFunction, id, outcome)
            }
            ServerMessage::CallFunctionResult { id, outcome } => {
                (ResponseKind::CallFunction, id, outcome)
            }
            ServerMessage::RemoveFunctionResult { id, outcome } => {
                (ResponseKind::RemoveFunction, id, outcome)
            }
            ServerMessage::IifeResult { id, outcome } => (ResponseKind::Iife, id, outcome),
        };
        Inbound::Response(Response {
            key: CorrelationKey { kind, id },
            outcome,
        })
    }
}
