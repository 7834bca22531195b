//! JSON frame codec for the WebSocket wire protocol.
//!
//! Every WebSocket message is exactly one JSON object, tagged by `type` and
//! carrying an opaque client-chosen `callId`. Clients send
//! `start`/`write`/`end`/`cancel`; the bridge answers with
//! `headers`/`data`/`status`/`error`.

use crate::error::Error;
use crate::metadata::metadata_to_json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tonic::Code;

/// JSON representation of a metadata map: key to scalar or ordered list.
pub type JsonMetadata = serde_json::Map<String, Value>;

/// Client-to-bridge frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Start {
        #[serde(rename = "callId")]
        call_id: String,
        method: String,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        metadata: Option<Value>,
        #[serde(default)]
        payload: Option<Value>,
    },
    Write {
        #[serde(rename = "callId")]
        call_id: String,
        payload: Value,
    },
    End {
        #[serde(rename = "callId")]
        call_id: String,
    },
    Cancel {
        #[serde(rename = "callId")]
        call_id: String,
    },
}

/// Bridge-to-client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Headers {
        #[serde(rename = "callId")]
        call_id: String,
        metadata: JsonMetadata,
    },
    Data {
        #[serde(rename = "callId")]
        call_id: String,
        payload: Value,
    },
    Status {
        #[serde(rename = "callId")]
        call_id: String,
        status: StatusBody,
    },
    Error {
        #[serde(rename = "callId", skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        error: StatusBody,
    },
}

/// Terminal outcome of a call: numeric gRPC code, detail string, trailers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBody {
    pub code: i32,
    pub details: String,
    pub metadata: JsonMetadata,
}

impl StatusBody {
    /// An OK status with the given trailer metadata.
    pub fn ok(metadata: JsonMetadata) -> Self {
        Self {
            code: Code::Ok as i32,
            details: "OK".to_string(),
            metadata,
        }
    }

    /// Pass-through of a backend status, trailers included.
    pub fn from_status(status: &tonic::Status) -> Self {
        Self {
            code: status.code() as i32,
            details: status.message().to_string(),
            metadata: metadata_to_json(status.metadata()),
        }
    }

    /// A bridge-local error, stringified.
    pub fn from_error(err: &Error) -> Self {
        if let Error::Grpc(status) = err {
            return Self::from_status(status);
        }
        Self {
            code: err.code() as i32,
            details: err.to_string(),
            metadata: JsonMetadata::new(),
        }
    }
}

impl ServerFrame {
    pub fn headers(call_id: impl Into<String>, metadata: JsonMetadata) -> Self {
        ServerFrame::Headers {
            call_id: call_id.into(),
            metadata,
        }
    }

    pub fn data(call_id: impl Into<String>, payload: Value) -> Self {
        ServerFrame::Data {
            call_id: call_id.into(),
            payload,
        }
    }

    pub fn status(call_id: impl Into<String>, status: StatusBody) -> Self {
        ServerFrame::Status {
            call_id: call_id.into(),
            status,
        }
    }

    pub fn error(call_id: Option<String>, error: StatusBody) -> Self {
        ServerFrame::Error { call_id, error }
    }

    /// Serialize to one complete JSON object for a single WebSocket message.
    pub fn to_json(&self) -> crate::error::Result<String> {
        serde_json::to_string(self).map_err(Error::Serialization)
    }
}

/// A rejected inbound frame: the code and details for the `error` frame,
/// addressed to the `callId` when one was parseable.
#[derive(Debug)]
pub struct FrameError {
    pub call_id: Option<String>,
    pub code: Code,
    pub details: String,
}

impl From<FrameError> for ServerFrame {
    fn from(err: FrameError) -> Self {
        ServerFrame::Error {
            call_id: err.call_id,
            error: StatusBody {
                code: err.code as i32,
                details: err.details,
                metadata: JsonMetadata::new(),
            },
        }
    }
}

/// Decode one inbound WebSocket text message into a [`ClientFrame`].
///
/// Malformed JSON or a missing/invalid `type` is `INVALID_ARGUMENT`; an
/// unrecognized `type` is `UNIMPLEMENTED` with the offending type in the
/// details. The `callId` is recovered on a best-effort basis so the error
/// frame can be addressed.
pub fn decode_frame(text: &str) -> std::result::Result<ClientFrame, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|e| FrameError {
        call_id: None,
        code: Code::InvalidArgument,
        details: format!("malformed JSON frame: {e}"),
    })?;

    let obj = value.as_object().ok_or_else(|| FrameError {
        call_id: None,
        code: Code::InvalidArgument,
        details: "frame is not a JSON object".to_string(),
    })?;

    let call_id = obj
        .get("callId")
        .and_then(Value::as_str)
        .map(str::to_string);

    let frame_type = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| FrameError {
            call_id: call_id.clone(),
            code: Code::InvalidArgument,
            details: "frame missing \"type\"".to_string(),
        })?;

    match frame_type {
        "start" | "write" | "end" | "cancel" => {
            serde_json::from_value::<ClientFrame>(value.clone()).map_err(|e| FrameError {
                call_id: call_id.clone(),
                code: Code::InvalidArgument,
                details: format!("invalid {frame_type} frame: {e}"),
            })
        }
        other => Err(FrameError {
            call_id,
            code: Code::Unimplemented,
            details: format!("unsupported frame type \"{other}\""),
        }),
    }
}
