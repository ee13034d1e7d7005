use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures_util::StreamExt;
use lib_common::{ChannelBridge, TransportError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Clone)]
pub struct AppState {
    bridge: Arc<ChannelBridge>,
    channel: String,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(bridge: Arc<ChannelBridge>, channel: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            bridge,
            channel: channel.into(),
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serves the relay until the state's shutdown token fires.
pub async fn run(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    log::info!("Relay for channel '{}' listening on {}", state.channel, listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Relay server shutting down.");
        })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

/// Broker bytes go out as text when they are UTF-8, as binary otherwise.
fn outbound_message(bytes: Bytes) -> Message {
    match String::from_utf8(bytes.to_vec()) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(bytes),
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let client_id = format!("ws-{}", NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));

    let relay = match state.bridge.relay(&state.channel).await {
        Ok(relay) => relay,
        Err(e) => {
            log::error!("Client {} refused: relay for '{}' unavailable: {}", client_id, state.channel, e);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let mut link = relay.connect(client_id.clone());
    log::info!("Client {} connected", client_id);

    let ended: Option<TransportError> = loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break None;
            }
            // Handle incoming messages from the client
            incoming = socket.next() => {
                let bytes = match incoming {
                    Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break Some(TransportError::Closed(client_id.clone())),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(TransportError::Io { id: client_id.clone(), reason: e.to_string() }),
                };
                if let Err(e) = link.send(bytes).await {
                    log::warn!("Client {} message not published to '{}': {}", client_id, state.channel, e);
                }
            }
            // Handle broker messages for this client
            outgoing = link.recv() => match outgoing {
                Some(bytes) => {
                    if let Err(e) = socket.send(outbound_message(bytes)).await {
                        break Some(TransportError::Io { id: client_id.clone(), reason: e.to_string() });
                    }
                }
                None => {
                    log::warn!("Relay for '{}' ended; closing client {}", state.channel, client_id);
                    let _ = socket.send(Message::Close(None)).await;
                    break None;
                }
            },
        }
    };

    match ended {
        Some(TransportError::Closed(_)) | None => log::info!("Client {} disconnected", client_id),
        Some(e) => log::warn!("Client {} dropped: {}", client_id, e),
    }
}
