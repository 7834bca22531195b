//! # grpc-websocket-bridge
//!
//! A bidirectional protocol bridge between browser-friendly WebSocket
//! clients and backend gRPC services. Browsers speak a compact JSON framing
//! over a single WebSocket connection; the bridge translates those frames
//! into gRPC calls against dynamically loaded Protocol Buffer service
//! definitions, multiplexing many concurrent calls onto one socket.
//!
//! ## Features
//!
//! - **Dynamic dispatch**: methods are resolved at runtime against proto
//!   files compiled in-process (or precompiled descriptor sets), streaming
//!   direction included
//! - **All four RPC shapes**: unary, server-streaming, client-streaming,
//!   and bidirectional calls, each multiplexed by an opaque `callId`
//! - **Ordered relay**: per call, `headers? → data* → status|error`, with
//!   one complete JSON object per WebSocket message
//! - **Metadata passthrough**: headers and trailers forwarded verbatim,
//!   `-bin` keys carried as base64
//! - **Cancellation both ways**: client `cancel` and connection teardown
//!   reset the backend call; backend failures surface as terminal frames
//!
//! ## Main Components
//!
//! - [`Bridge`]: the main entry point for creating and running the bridge.
//! - [`BridgeBuilder`]: configuration builder.
//! - [`DescriptorRegistry`]: loaded proto descriptors and method resolution.
//! - [`CallManager`]: the per-connection call multiplexer.
//! - [`ClientPool`]: cached backend channels.
//!
//! ## Example
//!
//! ```rust,no_run
//! use grpc_websocket_bridge::{Bridge, DescriptorRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = DescriptorRegistry::new();
//!     registry.load_protos(&["greeter.proto".into()], &[])?;
//!
//!     let bridge = Bridge::builder()
//!         .registry(registry)
//!         .default_target("localhost:50051")
//!         .build()?;
//!
//!     bridge.serve(([0, 0, 0, 0], 8080).into()).await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod call;
pub mod client_pool;
mod connection;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod metadata;
pub mod reflect;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{Bridge, BridgeBuilder};
pub use call::{CallEntry, CallKind, CallManager, CallState, CallTable};
pub use client_pool::{backend_tls_config, ClientPool};
pub use descriptor::{parse_fq_method, DescriptorRegistry, FqMethod, MethodSpec};
pub use error::{Error, Result};
pub use frame::{decode_frame, ClientFrame, FrameError, JsonMetadata, ServerFrame, StatusBody};
pub use metadata::{metadata_from_json, metadata_to_json};
pub use reflect::{message_from_json, message_to_json, DynamicCodec};
