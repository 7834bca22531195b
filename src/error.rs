//! Error types for the WebSocket-gRPC bridge

use thiserror::Error;
use tonic::Code;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the bridge
///
/// Covers frame-level protocol violations, descriptor resolution failures,
/// per-call dispatch errors, and backend gRPC failures. Every variant maps
/// to a gRPC status code via [`Error::code`] so it can be surfaced to the
/// WebSocket peer as an `error` frame.
#[derive(Error, Debug)]
pub enum Error {
    /// Backend gRPC status (pass-through)
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// gRPC transport errors (channel construction, TLS, connectivity)
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Malformed inbound frame
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Inbound frame with an unsupported `type`
    #[error("unsupported frame type: {0}")]
    UnknownFrameType(String),

    /// `start` with a callId that is already live
    #[error("call {0} already exists")]
    DuplicateCall(String),

    /// `write`/`end`/`cancel` for a callId not in the table
    #[error("call {0} not found")]
    UnknownCall(String),

    /// `write`/`end` on a call shape or state that does not accept them
    #[error("{0}")]
    NotWritable(String),

    /// Per-connection call table is full
    #[error("too many concurrent calls (limit {0})")]
    TooManyCalls(usize),

    /// Malformed fully-qualified method name
    #[error("invalid method name: {0}")]
    InvalidMethod(String),

    /// Unknown package, service, or method
    #[error("{0}")]
    MethodNotFound(String),

    /// Proto compilation or descriptor set loading failure
    #[error("descriptor error: {0}")]
    DescriptorLoad(String),

    /// Payload could not be marshalled to or from a protobuf message
    #[error("marshalling error: {0}")]
    Marshal(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    /// Any other error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// The gRPC status code carried by `error` frames for this error.
    ///
    /// Backend statuses pass through verbatim; bridge-local protocol
    /// violations use the codes from the dispatch precondition table, and
    /// everything unclassified is `UNKNOWN`.
    pub fn code(&self) -> Code {
        match self {
            Error::Grpc(status) => status.code(),
            Error::InvalidFrame(_) | Error::InvalidMethod(_) => Code::InvalidArgument,
            Error::UnknownFrameType(_) => Code::Unimplemented,
            Error::DuplicateCall(_) => Code::AlreadyExists,
            Error::UnknownCall(_) | Error::MethodNotFound(_) => Code::NotFound,
            Error::NotWritable(_) => Code::FailedPrecondition,
            Error::TooManyCalls(_) => Code::ResourceExhausted,
            Error::DescriptorLoad(_) | Error::Internal(_) => Code::Internal,
            Error::Transport(_)
            | Error::Marshal(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Other(_) => Code::Unknown,
        }
    }
}
