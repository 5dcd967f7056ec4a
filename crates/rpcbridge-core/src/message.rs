//! JSON-RPC 2.0 message model.
//!
//! [`RpcMessage`] is the tagged union every transport moves around. The wire
//! form is classified by the presence of `id` and `method`:
//!
//! | `id` | `method` | kind          |
//! |------|----------|---------------|
//! | yes  | yes      | Request       |
//! | yes  | no       | Response      |
//! | no   | yes      | Notification  |

use crate::error::{BridgeError, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

const JSONRPC_VERSION: &str = "2.0";

/// Identifier correlating a request with its response.
///
/// `Unset` is the wire `null` id. A request carrying it expects no correlated
/// response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    Number(i64),
    String(String),
    Unset,
}

impl RequestId {
    pub fn is_unset(&self) -> bool {
        matches!(self, RequestId::Unset)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
            RequestId::Unset => write!(f, "null"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            RequestId::Number(n) => serializer.serialize_i64(*n),
            RequestId::String(s) => serializer.serialize_str(s),
            RequestId::Unset => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = RequestId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer, a string, or null")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<RequestId, E> {
                Ok(RequestId::Number(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<RequestId, E> {
                i64::try_from(v)
                    .map(RequestId::Number)
                    .map_err(|_| E::custom("request id out of range"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<RequestId, E> {
                Ok(RequestId::String(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<RequestId, E> {
                Ok(RequestId::String(v))
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<RequestId, E> {
                Ok(RequestId::Unset)
            }

            fn visit_none<E: de::Error>(self) -> std::result::Result<RequestId, E> {
                Ok(RequestId::Unset)
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }
}

impl From<&BridgeError> for RpcError {
    fn from(err: &BridgeError) -> Self {
        RpcError::new(err.to_rpc_error_code(), err.to_string())
    }
}

/// A JSON-RPC request, response, or notification.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: std::result::Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl RpcMessage {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        RpcMessage::Request {
            id: id.into(),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        RpcMessage::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn success(id: RequestId, result: Value) -> Self {
        RpcMessage::Response {
            id,
            result: Ok(result),
        }
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        RpcMessage::Response {
            id,
            result: Err(error),
        }
    }

    /// The correlation id, if this kind of message carries one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            RpcMessage::Request { id, .. } | RpcMessage::Response { id, .. } => Some(id),
            RpcMessage::Notification { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            RpcMessage::Request { method, .. } | RpcMessage::Notification { method, .. } => {
                Some(method)
            }
            RpcMessage::Response { .. } => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, RpcMessage::Request { .. })
    }

    /// Parse exactly one message from a JSON document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Serialize for RpcMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            RpcMessage::Request { id, method, params } => {
                let mut s = serializer.serialize_struct("RpcMessage", 4)?;
                s.serialize_field("jsonrpc", JSONRPC_VERSION)?;
                s.serialize_field("id", id)?;
                s.serialize_field("method", method)?;
                if let Some(params) = params {
                    s.serialize_field("params", params)?;
                }
                s.end()
            }
            RpcMessage::Response { id, result } => {
                let mut s = serializer.serialize_struct("RpcMessage", 3)?;
                s.serialize_field("jsonrpc", JSONRPC_VERSION)?;
                s.serialize_field("id", id)?;
                match result {
                    Ok(value) => s.serialize_field("result", value)?,
                    Err(error) => s.serialize_field("error", error)?,
                }
                s.end()
            }
            RpcMessage::Notification { method, params } => {
                let mut s = serializer.serialize_struct("RpcMessage", 3)?;
                s.serialize_field("jsonrpc", JSONRPC_VERSION)?;
                s.serialize_field("method", method)?;
                if let Some(params) = params {
                    s.serialize_field("params", params)?;
                }
                s.end()
            }
        }
    }
}

/// Flat wire shape used to classify an incoming document.
#[derive(Deserialize)]
struct WireMessage {
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "present")]
    id: Option<RequestId>,
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Treats a present-but-null field as `Some`, so `"id": null` and
/// `"result": null` survive classification.
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl TryFrom<WireMessage> for RpcMessage {
    type Error = String;

    fn try_from(wire: WireMessage) -> std::result::Result<Self, Self::Error> {
        match wire.jsonrpc.as_deref() {
            Some(JSONRPC_VERSION) => {}
            Some(other) => return Err(format!("unsupported jsonrpc version {:?}", other)),
            None => return Err("missing jsonrpc version".to_string()),
        }

        match (wire.id, wire.method) {
            (Some(id), Some(method)) => Ok(RpcMessage::Request {
                id,
                method,
                params: wire.params,
            }),
            (None, Some(method)) => Ok(RpcMessage::Notification {
                method,
                params: wire.params,
            }),
            (Some(id), None) => match (wire.result, wire.error) {
                (Some(result), None) => Ok(RpcMessage::Response {
                    id,
                    result: Ok(result),
                }),
                (None, Some(error)) => Ok(RpcMessage::Response {
                    id,
                    result: Err(error),
                }),
                (Some(_), Some(_)) => Err("response has both result and error".to_string()),
                (None, None) => Err("response has neither result nor error".to_string()),
            },
            (None, None) => Err("message has neither id nor method".to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for RpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = WireMessage::deserialize(deserializer)?;
        RpcMessage::try_from(wire).map_err(de::Error::custom)
    }
}
