//! Wire envelopes exchanged with provider subprocesses.
//!
//! Every message is one JSON object on one line. Requests flow gateway →
//! provider on stdin, replies flow back on stdout:
//!
//! ```json
//! {"protocolVersion":"2.0","id":7,"method":"tools/echo","params":{"x":1}}
//! {"protocolVersion":"2.0","id":7,"result":{"x":1}}
//! {"protocolVersion":"2.0","id":8,"error":{"code":-32601,"message":"unknown method"}}
//! ```
//!
//! Replies are validated here, at the JSON boundary, into the tagged
//! [`ReplyPayload`] so nothing downstream handles raw `Value`s of unknown shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PROTOCOL_VERSION: &str = "2.0";

/// Standard error codes used by the gateway and the reference provider.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// A request written to a provider's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub protocol_version: String,
    pub id: u64,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Map::new())
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Serializes to a single line without the terminator.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Structured error carried by a failed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPayload {
    Result(Value),
    Error(RpcError),
}

/// A validated reply read from a provider's stdout.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: u64,
    pub payload: ReplyPayload,
}

/// Why a line could not be accepted as a reply.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplyParseError {
    #[error("not valid JSON: {0}")]
    InvalidJson(String),
    #[error("reply is not a JSON object")]
    NotAnObject,
    #[error("reply has no integer id")]
    MissingId,
    #[error("reply has neither result nor error")]
    MissingPayload,
    #[error("reply carries both result and error")]
    AmbiguousPayload,
    #[error("malformed error object: {0}")]
    InvalidError(String),
}

impl Reply {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            payload: ReplyPayload::Result(result),
        }
    }

    pub fn failure(id: u64, error: RpcError) -> Self {
        Self {
            id,
            payload: ReplyPayload::Error(error),
        }
    }

    /// Validates one line of provider output.
    pub fn parse(line: &str) -> Result<Self, ReplyParseError> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| ReplyParseError::InvalidJson(e.to_string()))?;
        let Value::Object(mut object) = value else {
            return Err(ReplyParseError::NotAnObject);
        };

        let id = object
            .get("id")
            .and_then(Value::as_u64)
            .ok_or(ReplyParseError::MissingId)?;

        let payload = match (object.remove("result"), object.remove("error")) {
            (Some(_), Some(_)) => return Err(ReplyParseError::AmbiguousPayload),
            (Some(result), None) => ReplyPayload::Result(result),
            (None, Some(error)) => ReplyPayload::Error(
                serde_json::from_value(error)
                    .map_err(|e| ReplyParseError::InvalidError(e.to_string()))?,
            ),
            (None, None) => return Err(ReplyParseError::MissingPayload),
        };

        Ok(Self { id, payload })
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.payload {
            ReplyPayload::Result(value) => Ok(value),
            ReplyPayload::Error(error) => Err(error),
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut object = Map::new();
        object.insert(
            "protocolVersion".into(),
            Value::String(PROTOCOL_VERSION.into()),
        );
        object.insert("id".into(), Value::from(self.id));
        match &self.payload {
            ReplyPayload::Result(result) => {
                object.insert("result".into(), result.clone());
            }
            ReplyPayload::Error(error) => {
                object.insert("error".into(), serde_json::to_value(error)?);
            }
        }
        serde_json::to_string(&Value::Object(object))
    }
}
