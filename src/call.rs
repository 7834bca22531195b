//! Call manager: the per-connection multiplexer and gRPC call pump.
//!
//! Every WebSocket connection owns one [`CallManager`] holding a table of
//! in-flight calls keyed by the client-chosen `callId`. A valid `start`
//! inserts a [`CallEntry`] and spawns one pump task that owns the gRPC call
//! end to end; the pump is the only emitter of `headers`/`data`/terminal
//! frames for its call, which yields the per-call ordering contract
//! (`headers? → data* → status|error`) without any extra coordination.
//!
//! Cancellation flows through a per-call channel: client `cancel` (or
//! connection teardown) removes the entry and signals the pump, which stops
//! without emitting; dropping the in-flight tonic call resets the
//! underlying HTTP/2 stream.

use crate::client_pool::ClientPool;
use crate::descriptor::{DescriptorRegistry, MethodSpec};
use crate::error::Error;
use crate::frame::{ClientFrame, JsonMetadata, ServerFrame, StatusBody};
use crate::metadata::{metadata_from_json, metadata_to_json};
use crate::reflect::{message_from_json, message_to_json, DynamicCodec};
use prost_reflect::{DynamicMessage, MessageDescriptor};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

/// The four RPC shapes, inferred from the method descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidi,
}

impl CallKind {
    pub fn from_spec(spec: &MethodSpec) -> Self {
        match (spec.client_streaming, spec.server_streaming) {
            (false, false) => CallKind::Unary,
            (false, true) => CallKind::ServerStreaming,
            (true, false) => CallKind::ClientStreaming,
            (true, true) => CallKind::Bidi,
        }
    }

    /// Whether the request side streams, i.e. `write`/`end` are legal.
    pub fn writable(self) -> bool {
        matches!(self, CallKind::ClientStreaming | CallKind::Bidi)
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallKind::Unary => "unary",
            CallKind::ServerStreaming => "server-streaming",
            CallKind::ClientStreaming => "client-streaming",
            CallKind::Bidi => "bidi",
        };
        f.write_str(label)
    }
}

/// Request-side lifecycle of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Active,
    HalfClosed,
}

/// One in-flight call.
pub struct CallEntry {
    pub kind: CallKind,
    pub state: CallState,
    pub method: String,
    /// Request-stream handle; present on writable shapes until `end`.
    pub writer: Option<mpsc::Sender<DynamicMessage>>,
    /// Request message descriptor, for marshalling `write` payloads.
    pub input: MessageDescriptor,
    /// Signals the pump to stop without emitting further frames.
    pub cancel_tx: mpsc::Sender<()>,
}

/// The per-connection call table.
#[derive(Default)]
pub struct CallTable {
    calls: HashMap<String, CallEntry>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, call_id: String, entry: CallEntry) {
        self.calls.insert(call_id, entry);
    }

    pub fn remove(&mut self, call_id: &str) -> Option<CallEntry> {
        self.calls.remove(call_id)
    }

    pub fn get(&self, call_id: &str) -> Option<&CallEntry> {
        self.calls.get(call_id)
    }

    pub fn get_mut(&mut self, call_id: &str) -> Option<&mut CallEntry> {
        self.calls.get_mut(call_id)
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.calls.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Remove one call and signal its pump. Returns false for unknown ids.
    pub async fn cancel(&mut self, call_id: &str) -> bool {
        if let Some(entry) = self.calls.remove(call_id) {
            let _ = entry.cancel_tx.send(()).await;
            true
        } else {
            false
        }
    }

    /// Drain the table, signalling every pump. Used on connection teardown.
    pub async fn cancel_all(&mut self) {
        for (_, entry) in self.calls.drain() {
            let _ = entry.cancel_tx.send(()).await;
        }
    }
}

enum CallRequest {
    Single(DynamicMessage),
    Streamed(ReceiverStream<DynamicMessage>),
}

/// Dispatches inbound frames for one connection and pumps gRPC events back.
pub struct CallManager {
    registry: Arc<DescriptorRegistry>,
    pool: ClientPool,
    default_target: String,
    max_calls: usize,
    table: Arc<RwLock<CallTable>>,
    outbound: mpsc::Sender<ServerFrame>,
}

impl CallManager {
    pub fn new(
        registry: Arc<DescriptorRegistry>,
        pool: ClientPool,
        default_target: String,
        max_calls: usize,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Self {
        Self {
            registry,
            pool,
            default_target,
            max_calls,
            table: Arc::new(RwLock::new(CallTable::new())),
            outbound,
        }
    }

    /// Route one decoded inbound frame.
    pub async fn dispatch(&self, frame: ClientFrame) {
        match frame {
            ClientFrame::Start {
                call_id,
                method,
                target,
                metadata,
                payload,
            } => self.handle_start(call_id, method, target, metadata, payload).await,
            ClientFrame::Write { call_id, payload } => self.handle_write(call_id, payload).await,
            ClientFrame::End { call_id } => self.handle_end(call_id).await,
            ClientFrame::Cancel { call_id } => self.handle_cancel(call_id).await,
        }
    }

    /// Cancel every live call. Emits nothing; the peer is gone.
    pub async fn shutdown(&self) {
        self.table.write().await.cancel_all().await;
    }

    /// Number of live calls.
    pub async fn active_calls(&self) -> usize {
        self.table.read().await.len()
    }

    #[cfg(test)]
    pub(crate) fn table(&self) -> Arc<RwLock<CallTable>> {
        self.table.clone()
    }

    async fn reject(&self, call_id: Option<String>, err: Error) {
        debug!(call_id = call_id.as_deref().unwrap_or("-"), error = %err, "rejecting frame");
        let frame = ServerFrame::error(call_id, StatusBody::from_error(&err));
        let _ = self.outbound.send(frame).await;
    }

    async fn handle_start(
        &self,
        call_id: String,
        method: String,
        target: Option<String>,
        metadata: Option<Value>,
        payload: Option<Value>,
    ) {
        // Inbound frames for one connection dispatch sequentially and pumps
        // only ever remove entries, so this check cannot go stale before the
        // insert below.
        {
            let table = self.table.read().await;
            if table.contains(&call_id) {
                drop(table);
                let err = Error::DuplicateCall(call_id.clone());
                return self.reject(Some(call_id), err).await;
            }
            if table.len() >= self.max_calls {
                drop(table);
                return self.reject(Some(call_id), Error::TooManyCalls(self.max_calls)).await;
            }
        }

        let spec = match self.registry.method_spec(&method) {
            Ok(spec) => spec,
            Err(e) => return self.reject(Some(call_id), e).await,
        };
        let path: PathAndQuery = match spec.path.parse() {
            Ok(path) => path,
            Err(e) => {
                let err = Error::Internal(format!("invalid request path {}: {e}", spec.path));
                return self.reject(Some(call_id), err).await;
            }
        };
        let target = target.unwrap_or_else(|| self.default_target.clone());
        let channel = match self.pool.channel(&target, &spec.service_fqn) {
            Ok(channel) => channel,
            Err(e) => return self.reject(Some(call_id), e).await,
        };
        let request_metadata = metadata_from_json(metadata.as_ref());
        let kind = CallKind::from_spec(&spec);

        // Marshal the start payload before touching the table so failures
        // leave no entry behind. On writable shapes it is the first write.
        let mut writer = None;
        let request = match kind {
            CallKind::Unary | CallKind::ServerStreaming => {
                match message_from_json(&spec.input, payload.as_ref()) {
                    Ok(message) => CallRequest::Single(message),
                    Err(e) => return self.reject(Some(call_id), e).await,
                }
            }
            CallKind::ClientStreaming | CallKind::Bidi => {
                let (tx, rx) = mpsc::channel::<DynamicMessage>(16);
                if let Some(first) = payload.as_ref() {
                    match message_from_json(&spec.input, Some(first)) {
                        Ok(message) => {
                            let _ = tx.try_send(message);
                        }
                        Err(e) => return self.reject(Some(call_id), e).await,
                    }
                }
                writer = Some(tx);
                CallRequest::Streamed(ReceiverStream::new(rx))
            }
        };

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        {
            let mut table = self.table.write().await;
            table.insert(
                call_id.clone(),
                CallEntry {
                    kind,
                    state: CallState::Active,
                    method: method.clone(),
                    writer,
                    input: spec.input.clone(),
                    cancel_tx,
                },
            );
        }

        info!(call_id = %call_id, method = %method, kind = %kind, target = %target, "call started");

        let pump = CallPump {
            call_id,
            outbound: self.outbound.clone(),
            table: self.table.clone(),
        };
        let server_streaming = spec.server_streaming;
        let codec = DynamicCodec::new(spec.output.clone());
        tokio::spawn(async move {
            let grpc = Grpc::new(channel);
            match request {
                CallRequest::Single(message) if server_streaming => {
                    run_server_streaming(pump, grpc, path, codec, message, request_metadata, cancel_rx)
                        .await;
                }
                CallRequest::Single(message) => {
                    run_unary(pump, grpc, path, codec, message, request_metadata, cancel_rx).await;
                }
                CallRequest::Streamed(requests) if server_streaming => {
                    run_bidi(pump, grpc, path, codec, requests, request_metadata, cancel_rx).await;
                }
                CallRequest::Streamed(requests) => {
                    run_client_streaming(pump, grpc, path, codec, requests, request_metadata, cancel_rx)
                        .await;
                }
            }
        });
    }

    async fn handle_write(&self, call_id: String, payload: Value) {
        let prepared = {
            let table = self.table.read().await;
            match table.get(&call_id) {
                None => Err(Error::UnknownCall(call_id.clone())),
                Some(entry) if !entry.kind.writable() => Err(Error::NotWritable(format!(
                    "call {call_id} is {} and does not accept write frames",
                    entry.kind
                ))),
                Some(entry) => match (entry.state, &entry.writer) {
                    (CallState::Active, Some(writer)) => Ok((writer.clone(), entry.input.clone())),
                    _ => Err(Error::NotWritable(format!(
                        "call {call_id} is already half-closed"
                    ))),
                },
            }
        };
        let (writer, input) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.reject(Some(call_id), e).await,
        };

        let message = match message_from_json(&input, Some(&payload)) {
            Ok(message) => message,
            // A payload the descriptor cannot marshal poisons the stream;
            // terminate the call so the client sees exactly one terminal.
            Err(e) => return self.abort_call(call_id, e).await,
        };

        if writer.send(message).await.is_err() {
            debug!(call_id = %call_id, "request stream closed before write was forwarded");
        }
    }

    async fn handle_end(&self, call_id: String) {
        let rejection = {
            let mut table = self.table.write().await;
            match table.get_mut(&call_id) {
                None => Some(Error::UnknownCall(call_id.clone())),
                Some(entry) if !entry.kind.writable() => Some(Error::NotWritable(format!(
                    "call {call_id} is {} and does not accept end frames",
                    entry.kind
                ))),
                Some(entry) => {
                    // Dropping the sender half-closes the request stream once
                    // queued writes drain. A second end is a no-op.
                    entry.writer = None;
                    entry.state = CallState::HalfClosed;
                    None
                }
            }
        };
        if let Some(err) = rejection {
            self.reject(Some(call_id), err).await;
        }
    }

    async fn handle_cancel(&self, call_id: String) {
        let cancelled = self.table.write().await.cancel(&call_id).await;
        if cancelled {
            debug!(call_id = %call_id, "call cancelled by client");
        } else {
            self.reject(Some(call_id.clone()), Error::UnknownCall(call_id)).await;
        }
    }

    /// Terminate a live call on a bridge-local failure: remove the entry,
    /// stop the pump, emit the single terminal `error` frame.
    async fn abort_call(&self, call_id: String, err: Error) {
        let entry = self.table.write().await.remove(&call_id);
        if let Some(entry) = entry {
            let _ = entry.cancel_tx.send(()).await;
        }
        let frame = ServerFrame::error(Some(call_id), StatusBody::from_error(&err));
        let _ = self.outbound.send(frame).await;
    }
}

/// Everything a pump task needs to relay one call's events.
struct CallPump {
    call_id: String,
    outbound: mpsc::Sender<ServerFrame>,
    table: Arc<RwLock<CallTable>>,
}

impl CallPump {
    /// Returns false when the connection is gone.
    async fn emit(&self, frame: ServerFrame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    /// At most one `headers` frame per call, and only when non-empty.
    async fn emit_headers(&self, metadata: &MetadataMap) -> bool {
        if metadata.is_empty() {
            return true;
        }
        self.emit(ServerFrame::headers(
            self.call_id.clone(),
            metadata_to_json(metadata),
        ))
        .await
    }

    /// Emit the terminal frame, then drop the call from the table.
    async fn finish(&self, frame: ServerFrame) {
        let _ = self.outbound.send(frame).await;
        self.remove().await;
    }

    /// Stop silently (cancelled, or connection gone).
    async fn remove(&self) {
        self.table.write().await.remove(&self.call_id);
    }

    async fn finish_error(&self, status: &Status) {
        debug!(call_id = %self.call_id, code = ?status.code(), "call failed");
        self.finish(ServerFrame::error(
            Some(self.call_id.clone()),
            StatusBody::from_status(status),
        ))
        .await;
    }
}

fn with_metadata<T>(mut request: Request<T>, metadata: MetadataMap) -> Request<T> {
    *request.metadata_mut() = metadata;
    request
}

async fn run_unary(
    pump: CallPump,
    mut grpc: Grpc<Channel>,
    path: PathAndQuery,
    codec: DynamicCodec,
    message: DynamicMessage,
    metadata: MetadataMap,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    let request = with_metadata(Request::new(message), metadata);

    let outcome = tokio::select! {
        _ = cancel_rx.recv() => None,
        response = async {
            grpc.ready()
                .await
                .map_err(|e| Status::unknown(format!("transport error: {e}")))?;
            grpc.unary(request, path, codec).await
        } => Some(response),
    };

    match outcome {
        None => {
            debug!(call_id = %pump.call_id, "unary call stopped");
            pump.remove().await;
        }
        Some(Ok(response)) => deliver_single_response(&pump, response).await,
        Some(Err(status)) => pump.finish_error(&status).await,
    }
}

async fn run_client_streaming(
    pump: CallPump,
    mut grpc: Grpc<Channel>,
    path: PathAndQuery,
    codec: DynamicCodec,
    requests: ReceiverStream<DynamicMessage>,
    metadata: MetadataMap,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    let request = with_metadata(Request::new(requests), metadata);

    let outcome = tokio::select! {
        _ = cancel_rx.recv() => None,
        response = async {
            grpc.ready()
                .await
                .map_err(|e| Status::unknown(format!("transport error: {e}")))?;
            grpc.client_streaming(request, path, codec).await
        } => Some(response),
    };

    match outcome {
        None => {
            debug!(call_id = %pump.call_id, "client-streaming call stopped");
            pump.remove().await;
        }
        Some(Ok(response)) => deliver_single_response(&pump, response).await,
        Some(Err(status)) => pump.finish_error(&status).await,
    }
}

async fn run_server_streaming(
    pump: CallPump,
    mut grpc: Grpc<Channel>,
    path: PathAndQuery,
    codec: DynamicCodec,
    message: DynamicMessage,
    metadata: MetadataMap,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    let request = with_metadata(Request::new(message), metadata);

    let outcome = tokio::select! {
        _ = cancel_rx.recv() => None,
        response = async {
            grpc.ready()
                .await
                .map_err(|e| Status::unknown(format!("transport error: {e}")))?;
            grpc.server_streaming(request, path, codec).await
        } => Some(response),
    };

    match outcome {
        None => {
            debug!(call_id = %pump.call_id, "server-streaming call stopped");
            pump.remove().await;
        }
        Some(Ok(response)) => relay_response_stream(pump, response, cancel_rx).await,
        Some(Err(status)) => pump.finish_error(&status).await,
    }
}

async fn run_bidi(
    pump: CallPump,
    mut grpc: Grpc<Channel>,
    path: PathAndQuery,
    codec: DynamicCodec,
    requests: ReceiverStream<DynamicMessage>,
    metadata: MetadataMap,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    let request = with_metadata(Request::new(requests), metadata);

    let outcome = tokio::select! {
        _ = cancel_rx.recv() => None,
        response = async {
            grpc.ready()
                .await
                .map_err(|e| Status::unknown(format!("transport error: {e}")))?;
            grpc.streaming(request, path, codec).await
        } => Some(response),
    };

    match outcome {
        None => {
            debug!(call_id = %pump.call_id, "bidi call stopped");
            pump.remove().await;
        }
        Some(Ok(response)) => relay_response_stream(pump, response, cancel_rx).await,
        Some(Err(status)) => pump.finish_error(&status).await,
    }
}

/// Shared tail for unary and client-streaming: one response message, then OK.
async fn deliver_single_response(pump: &CallPump, response: Response<DynamicMessage>) {
    let (head, message, _extensions) = response.into_parts();
    if !pump.emit_headers(&head).await {
        pump.remove().await;
        return;
    }
    let data = ServerFrame::data(pump.call_id.clone(), message_to_json(&message));
    if !pump.emit(data).await {
        pump.remove().await;
        return;
    }
    pump.finish(ServerFrame::status(
        pump.call_id.clone(),
        StatusBody::ok(JsonMetadata::new()),
    ))
    .await;
}

/// Shared response side for server-streaming and bidi: relay messages in
/// arrival order, then the trailing status.
async fn relay_response_stream(
    pump: CallPump,
    response: Response<Streaming<DynamicMessage>>,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    let (head, mut stream, _extensions) = response.into_parts();
    if !pump.emit_headers(&head).await {
        pump.remove().await;
        return;
    }

    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(call_id = %pump.call_id, "response stream stopped");
                pump.remove().await;
                return;
            }
            item = stream.message() => match item {
                Ok(Some(message)) => {
                    let data = ServerFrame::data(pump.call_id.clone(), message_to_json(&message));
                    if !pump.emit(data).await {
                        pump.remove().await;
                        return;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    pump.finish_error(&status).await;
                    return;
                }
            }
        }
    }

    let trailers = stream.trailers().await.ok().flatten().unwrap_or_default();
    pump.finish(ServerFrame::status(
        pump.call_id.clone(),
        StatusBody::ok(metadata_to_json(&trailers)),
    ))
    .await;
}
