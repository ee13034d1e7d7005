//! # WebSocket Tier Client
//!
//! Speaks the `protocol` frames to a remote tier. One connection per session:
//!
//! - a **writer task** drains an mpsc queue into the socket,
//! - a **reader task** routes `ack`/`error` frames to the oneshot responder
//!   of the pending request with that id, and `update` frames to every local
//!   stream subscribed to the path.
//!
//! When the socket goes away the reader clears both tables, so pending
//! requests fail with `Disconnected` and every `TopicStream` ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::payload::Payload;
use crate::errors::{ConnectError, TierError, TopicError};
use crate::secondary::protocol::{decode_update, ClientFrame, ErrorKind, ServerFrame};
use crate::secondary::{Credentials, TierConnector, TierSession, TopicSpec, TopicStream, TopicUpdate};

type Responder = oneshot::Sender<Result<(), (ErrorKind, String)>>;

/// Connects to a tier hub over WebSocket.
#[derive(Debug, Clone)]
pub struct WsTierConnector {
    path: String,
    handshake_timeout: Duration,
}

impl Default for WsTierConnector {
    fn default() -> Self {
        Self {
            path: "/tier".to_string(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl WsTierConnector {
    /// Connector for the default `/tier` endpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a different URL path on the tier host.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Bounds the time from TCP connect to the `connected` frame.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    async fn handshake(&self, credentials: &Credentials) -> Result<WsSession, ConnectError> {
        let url = Url::parse(&credentials.endpoint_url(&self.path))
            .map_err(|e| ConnectError::Unreachable(format!("bad tier address {}: {}", credentials.endpoint(), e)))?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ConnectError::Unreachable(format!("{}: {}", url, e)))?;
        let (mut write, mut read) = ws_stream.split();

        let hello = ClientFrame::Connect {
            principal: credentials.principal.clone(),
            credential: credentials.credential.clone(),
        };
        let text = serde_json::to_string(&hello).map_err(|e| ConnectError::Protocol(e.to_string()))?;
        write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        let session_id = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Connected { session_id }) => break session_id,
                    Ok(ServerFrame::Error { kind: ErrorKind::Rejected, .. }) => {
                        return Err(ConnectError::Rejected(credentials.principal.clone()))
                    }
                    Ok(other) => return Err(ConnectError::Protocol(format!("unexpected frame {:?}", other))),
                    Err(e) => return Err(ConnectError::Protocol(e.to_string())),
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(other)) => return Err(ConnectError::Protocol(format!("unexpected message {:?}", other))),
                Some(Err(e)) => return Err(ConnectError::Unreachable(e.to_string())),
                None => return Err(ConnectError::Unreachable("closed during handshake".to_string())),
            }
        };

        let shared = Arc::new(Shared::default());
        let closed = CancellationToken::new();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        // --- Writer ---
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    next = out_rx.recv() => match next {
                        Some(message) => {
                            let closing = matches!(message, Message::Close(_));
                            if write.send(message).await.is_err() {
                                writer_closed.cancel();
                                break;
                            }
                            if closing {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_closed.cancelled() => break,
                }
            }
            let _ = write.close().await;
        });

        // --- Reader ---
        let reader_shared = Arc::clone(&shared);
        let reader_closed = closed.clone();
        let reader_id = session_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    next = read.next() => match next {
                        Some(Ok(Message::Text(text))) => reader_shared.route(&text),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("Tier session {} read error: {}", reader_id, e);
                            break;
                        }
                    }
                }
            }
            reader_closed.cancel();
            reader_shared.clear();
            log::info!("Tier session {} disconnected", reader_id);
        });

        log::info!("Tier session {} established with {}", session_id, url);
        Ok(WsSession {
            session_id,
            shared,
            outbound: out_tx,
            closed,
        })
    }
}

#[async_trait]
impl TierConnector for WsTierConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn TierSession>, ConnectError> {
        match tokio::time::timeout(self.handshake_timeout, self.handshake(credentials)).await {
            Ok(result) => Ok(Arc::new(result?)),
            Err(_) => Err(ConnectError::Unreachable(format!(
                "handshake with {} timed out",
                credentials.endpoint()
            ))),
        }
    }
}

#[derive(Default)]
struct Shared {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Responder>>,
    streams: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<TopicUpdate>>>>,
}

impl Shared {
    fn route(&self, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Ignoring undecodable tier frame: {}", e);
                return;
            }
        };
        match frame {
            ServerFrame::Ack { id } => self.respond(id, Ok(())),
            ServerFrame::Error { id: Some(id), kind, message } => self.respond(id, Err((kind, message))),
            ServerFrame::Error { id: None, kind, message } => {
                log::warn!("Tier reported {:?}: {}", kind, message);
            }
            ServerFrame::Update { path, spec, new_value, old_value } => {
                let update = decode_update(path, spec, new_value, old_value);
                let mut streams = self.streams.lock().expect("Tier stream table lock poisoned");
                if let Some(list) = streams.get_mut(&update.path) {
                    list.retain(|tx| tx.send(update.clone()).is_ok());
                }
            }
            ServerFrame::Connected { .. } => log::debug!("Ignoring repeated connected frame"),
        }
    }

    fn respond(&self, id: u64, result: Result<(), (ErrorKind, String)>) {
        let responder = self.pending.lock().expect("Tier pending table lock poisoned").remove(&id);
        match responder {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => log::debug!("Reply for unknown request {}", id),
        }
    }

    fn clear(&self) {
        self.pending.lock().expect("Tier pending table lock poisoned").clear();
        self.streams.lock().expect("Tier stream table lock poisoned").clear();
    }
}

/// A session on a remote tier.
pub struct WsSession {
    session_id: String,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
}

enum Failure {
    Remote(ErrorKind, String),
    Disconnected,
}

impl WsSession {
    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame) -> Result<(), Failure> {
        if self.closed.is_cancelled() {
            return Err(Failure::Disconnected);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let text = serde_json::to_string(&build(id)).map_err(|e| Failure::Remote(ErrorKind::Protocol, e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("Tier pending table lock poisoned")
            .insert(id, tx);

        if self.outbound.send(Message::Text(text.into())).is_err() {
            self.shared.pending.lock().expect("Tier pending table lock poisoned").remove(&id);
            return Err(Failure::Disconnected);
        }

        tokio::select! {
            reply = rx => match reply {
                Ok(Ok(())) => Ok(()),
                Ok(Err((kind, message))) => Err(Failure::Remote(kind, message)),
                Err(_) => Err(Failure::Disconnected),
            },
            _ = self.closed.cancelled() => Err(Failure::Disconnected),
        }
    }
}

#[async_trait]
impl TierSession for WsSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn ensure_topic(&self, path: &str, spec: TopicSpec) -> Result<(), TopicError> {
        let outcome = self
            .request(|id| ClientFrame::EnsureTopic {
                id,
                path: path.to_string(),
                value_type: spec.value_type,
            })
            .await;
        match outcome {
            Ok(()) => Ok(()),
            Err(Failure::Disconnected) => Err(TopicError::Disconnected),
            Err(Failure::Remote(kind, message)) => Err(kind.into_topic_error(path, Some(spec.value_type), message)),
        }
    }

    async fn publish(&self, path: &str, value: &Payload) -> Result<(), TierError> {
        let text = value.as_str().ok_or_else(|| TierError::InvalidValue {
            path: path.to_string(),
            reason: "payload is not UTF-8".to_string(),
        })?;
        let outcome = self
            .request(|id| ClientFrame::Publish {
                id,
                path: path.to_string(),
                value: text.to_string(),
            })
            .await;
        match outcome {
            Ok(()) => Ok(()),
            Err(Failure::Disconnected) => Err(TierError::Disconnected),
            Err(Failure::Remote(kind, message)) => Err(kind.into_tier_error(path, message)),
        }
    }

    async fn subscribe(&self, path: &str) -> Result<TopicStream, TierError> {
        // Registered before the request so the current value sent right after
        // the ack is not missed.
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .streams
            .lock()
            .expect("Tier stream table lock poisoned")
            .entry(path.to_string())
            .or_default()
            .push(tx);

        let outcome = self
            .request(|id| ClientFrame::Subscribe {
                id,
                path: path.to_string(),
            })
            .await;
        match outcome {
            Ok(()) => Ok(rx),
            Err(Failure::Disconnected) => Err(TierError::Disconnected),
            Err(Failure::Remote(kind, message)) => Err(kind.into_tier_error(path, message)),
        }
    }

    async fn create_topic_view(&self, name: &str, spec: &str) -> Result<(), TopicError> {
        let outcome = self
            .request(|id| ClientFrame::CreateTopicView {
                id,
                name: name.to_string(),
                spec: spec.to_string(),
            })
            .await;
        match outcome {
            Ok(()) => Ok(()),
            Err(Failure::Disconnected) => Err(TopicError::Disconnected),
            Err(Failure::Remote(kind, message)) => Err(kind.into_topic_error(name, None, message)),
        }
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            // Queued ahead of the cancel; the writer drains its queue first.
            let _ = self.outbound.send(Message::Close(None));
            self.closed.cancel();
            self.shared.clear();
            log::info!("Tier session {} closed", self.session_id);
        }
    }
}
