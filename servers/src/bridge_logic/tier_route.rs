use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, future};
use lib_common::secondary::hub::TierHub;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct HubState {
    hub: Arc<TierHub>,
    shutdown: CancellationToken,
}

impl HubState {
    pub fn new(hub: Arc<TierHub>, shutdown: CancellationToken) -> Self {
        Self { hub, shutdown }
    }
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/tier", get(tier_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serves the tier until the state's shutdown token fires.
pub async fn run(listener: TcpListener, state: HubState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    log::info!("Topic hub listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            log::info!("Topic hub shutting down.");
        })
        .await?;
    Ok(())
}

async fn tier_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<HubState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, peer, state))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: HubState) {
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Text frames until the peer closes or errors; pings and binary frames are skipped.
    let inbound = stream
        .take_while(|frame| future::ready(matches!(frame, Ok(message) if !matches!(message, Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        });

    state
        .hub
        .handle_connection(&peer.to_string(), Box::pin(inbound), tx, state.shutdown.child_token())
        .await;
    let _ = writer.await;
}
