//! Connection supervisor: WebSocket lifecycle around one call manager.
//!
//! Each accepted socket gets a fresh [`CallManager`] with an empty call
//! table, a read loop that routes frames through the codec into the
//! dispatcher, and a single writer task that serializes outbound frames so
//! every WebSocket message is one complete JSON object. When the socket
//! closes or errors, every live call is cancelled and the table cleared; no
//! frames are emitted to a peer that is gone.

use crate::bridge::BridgeState;
use crate::call::CallManager;
use crate::frame::{decode_frame, ServerFrame};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::Code;
use tracing::{debug, error};

/// Size of the per-connection outbound frame queue.
const OUTBOUND_BUFFER: usize = 100;

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BridgeState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one WebSocket connection to completion.
async fn handle_socket(socket: WebSocket, state: Arc<BridgeState>) {
    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);
    let manager = CallManager::new(
        state.registry.clone(),
        state.pool.clone(),
        state.default_target.clone(),
        state.max_calls_per_connection,
        outbound_tx.clone(),
    );

    let write_handle = tokio::spawn(write_frames(sink, outbound_rx));

    read_frames(stream, &outbound_tx, &manager).await;

    // The peer is gone: cancel every live call and let the writer drain.
    manager.shutdown().await;
    drop(outbound_tx);
    let _ = write_handle.await;
    debug!("connection closed");
}

/// Read loop: frames are processed strictly in arrival order, so a `write`
/// can never be reordered past an `end` for the same call.
async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    outbound: &mpsc::Sender<ServerFrame>,
    manager: &CallManager,
) {
    while let Some(received) = stream.next().await {
        match received {
            Ok(Message::Text(text)) => handle_payload(&text, outbound, manager).await,
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_payload(text, outbound, manager).await,
                Err(_) => {
                    let frame = ServerFrame::from(crate::frame::FrameError {
                        call_id: None,
                        code: Code::InvalidArgument,
                        details: "frame is not valid UTF-8".to_string(),
                    });
                    let _ = outbound.send(frame).await;
                }
            },
            Ok(Message::Close(_)) => {
                debug!("client closed connection");
                break;
            }
            Ok(_) => {} // ping/pong handled by the transport
            Err(e) => {
                error!(error = %e, "WebSocket error");
                break;
            }
        }
    }
}

async fn handle_payload(text: &str, outbound: &mpsc::Sender<ServerFrame>, manager: &CallManager) {
    match decode_frame(text) {
        Ok(frame) => manager.dispatch(frame).await,
        Err(frame_error) => {
            debug!(details = %frame_error.details, "rejecting malformed frame");
            let _ = outbound.send(ServerFrame::from(frame_error)).await;
        }
    }
}

/// Writer task: the only place that touches the sink, so frames are never
/// interleaved. A closed socket drops frames silently; the connection is
/// being torn down anyway.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<ServerFrame>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        match frame.to_json() {
            Ok(json) => {
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "failed to serialize outbound frame");
            }
        }
    }
}
