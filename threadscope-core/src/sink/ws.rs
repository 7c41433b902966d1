//! WebSocket transport for the fan-out sink.
//!
//! Routes:
//! - `GET /ws` - event stream with subscribe/unsubscribe/ping control frames
//! - `GET /health` - sink counters and tracked file count
//! - `GET /files` - processing state of every tracked file

use super::{ClientFrame, FanoutSink, ServerFrame};
use crate::error::{Error, Result};
use crate::pipeline::FileRegistry;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct ServerState {
    pub sink: FanoutSink,
    pub files: FileRegistry,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/files", get(files))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: ServerState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "Sink listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Sink(format!("server error: {}", e)))
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sink": state.sink.stats(),
        "files": state.files.len(),
    }))
}

async fn files(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.files.snapshot())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state.sink))
}

async fn handle_socket(socket: WebSocket, sink: FanoutSink) {
    let (id, mut queue) = sink.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Queue → socket. Ends when the subscriber is dropped or evicted.
    let forward = tokio::spawn(async move {
        while let Some(item) = queue.recv().await {
            let text = match item.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(subscriber = %id, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        if !sink.heartbeat(id) {
            break;
        }
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(ClientFrame::Subscribe { scope, since }) => {
                    if let Err(e) = sink.subscribe(id, scope, since).await {
                        tracing::debug!(subscriber = %id, error = %e, "Subscribe failed");
                        break;
                    }
                }
                Ok(ClientFrame::Unsubscribe { scope }) => {
                    sink.unsubscribe(id, &scope);
                    sink.send_frame(id, ServerFrame::Unsubscribed { scope });
                }
                Ok(ClientFrame::Ping) => {
                    sink.send_frame(id, ServerFrame::Pong { head: sink.head() });
                }
                Err(e) => {
                    sink.send_frame(
                        id,
                        ServerFrame::Error {
                            message: format!("invalid frame: {}", e),
                        },
                    );
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    sink.disconnect(id);
    forward.abort();
}
