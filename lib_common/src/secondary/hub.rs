//! # Tier Hub
//!
//! Serves a [`MemoryTier`] to remote clients using the `protocol` frames.
//! `handle_connection` works on plain text frames in and out, so any
//! WebSocket stack can sit in front of it; `serve` is a ready-made
//! tokio-tungstenite accept loop.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::{future, SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;

use crate::core::payload::Payload;
use crate::secondary::memory_tier::{MemorySession, MemoryTier};
use crate::secondary::protocol::{ClientFrame, ErrorKind, ServerFrame};
use crate::secondary::{TierSession, TopicSpec};

/// Hosts one tier for any number of connections.
#[derive(Clone)]
pub struct TierHub {
    tier: MemoryTier,
}

fn send(outbound: &mpsc::UnboundedSender<String>, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => outbound.send(text).is_ok(),
        Err(e) => {
            log::error!("Failed to encode tier frame: {}", e);
            false
        }
    }
}

impl TierHub {
    /// Wraps a tier.
    pub fn new(tier: MemoryTier) -> Self {
        Self { tier }
    }

    /// The hosted tier.
    pub fn tier(&self) -> &MemoryTier {
        &self.tier
    }

    /// # Handle Connection
    ///
    /// Runs one client connection to completion.
    ///
    /// ## Workflow:
    /// 1.  The first frame must be `connect`; a rejected login gets an
    ///     `error` frame and the connection ends.
    /// 2.  Each request is applied to the client's session and answered with
    ///     `ack` or `error` carrying the request id.
    /// 3.  Each new subscription spawns a forwarder that turns topic updates
    ///     into `update` frames.
    /// 4.  When `inbound` ends or `shutdown` fires, the session is closed,
    ///     which also ends the forwarders.
    pub async fn handle_connection<S>(
        &self,
        peer: &str,
        mut inbound: S,
        outbound: mpsc::UnboundedSender<String>,
        shutdown: CancellationToken,
    ) where
        S: Stream<Item = String> + Unpin + Send,
    {
        let first = tokio::select! {
            _ = shutdown.cancelled() => return,
            first = inbound.next() => first,
        };
        let Some(first) = first else { return };

        let session = match serde_json::from_str::<ClientFrame>(&first) {
            Ok(ClientFrame::Connect { principal, credential }) => match self.tier.open_session(&principal, &credential) {
                Ok(session) => session,
                Err(e) => {
                    send(&outbound, &ServerFrame::error(None, ErrorKind::Rejected, e.to_string()));
                    return;
                }
            },
            _ => {
                send(&outbound, &ServerFrame::error(None, ErrorKind::Protocol, "expected a connect frame"));
                return;
            }
        };

        log::info!("Peer {} opened tier session {}", peer, session.session_id());
        send(
            &outbound,
            &ServerFrame::Connected {
                session_id: session.session_id().to_string(),
            },
        );

        let session_token = shutdown.child_token();
        let mut subscribed = HashSet::new();

        loop {
            let next = tokio::select! {
                _ = session_token.cancelled() => break,
                next = inbound.next() => next,
            };
            let Some(text) = next else { break };

            let reply = match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => apply(&session, frame, &outbound, &session_token, &mut subscribed).await,
                Err(e) => ServerFrame::error(None, ErrorKind::Protocol, e.to_string()),
            };
            if !send(&outbound, &reply) {
                break;
            }
        }

        session_token.cancel();
        session.close().await;
        log::info!("Peer {} disconnected", peer);
    }

    /// Accepts WebSocket connections until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let (socket, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("Tier hub accept failed: {}", e);
                        continue;
                    }
                },
            };

            let hub = Arc::clone(&self);
            let token = shutdown.child_token();
            tokio::spawn(async move {
                let ws_stream = match accept_async(socket).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        log::warn!("WebSocket handshake with {} failed: {}", addr, e);
                        return;
                    }
                };
                let (mut write, read) = ws_stream.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();

                let writer = tokio::spawn(async move {
                    while let Some(text) = rx.recv().await {
                        if write.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = write.close().await;
                });

                let inbound = read
                    .take_while(|message| future::ready(message.is_ok()))
                    .filter_map(|message| {
                        future::ready(match message {
                            Ok(Message::Text(text)) => Some(text.to_string()),
                            _ => None,
                        })
                    });

                hub.handle_connection(&addr.to_string(), Box::pin(inbound), tx, token).await;
                let _ = writer.await;
            });
        }
        log::info!("Tier hub stopped accepting connections");
    }
}

async fn apply(
    session: &MemorySession,
    frame: ClientFrame,
    outbound: &mpsc::UnboundedSender<String>,
    token: &CancellationToken,
    subscribed: &mut HashSet<String>,
) -> ServerFrame {
    match frame {
        ClientFrame::Connect { .. } => ServerFrame::error(None, ErrorKind::Protocol, "session already connected"),

        ClientFrame::EnsureTopic { id, path, value_type } => {
            match session.ensure_topic(&path, TopicSpec::new(value_type)).await {
                Ok(()) => ServerFrame::Ack { id },
                Err(e) => ServerFrame::error(Some(id), ErrorKind::of_topic(&e), e.to_string()),
            }
        }

        ClientFrame::Publish { id, path, value } => match session.publish(&path, &Payload::from(value)).await {
            Ok(()) => ServerFrame::Ack { id },
            Err(e) => ServerFrame::error(Some(id), ErrorKind::of_tier(&e), e.to_string()),
        },

        ClientFrame::Subscribe { id, path } => {
            // One forwarder per path; a repeat subscribe is acknowledged as is.
            if subscribed.contains(&path) {
                return ServerFrame::Ack { id };
            }
            match session.subscribe(&path).await {
                Ok(mut updates) => {
                    subscribed.insert(path);
                    let outbound = outbound.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        loop {
                            let update = tokio::select! {
                                _ = token.cancelled() => break,
                                update = updates.recv() => update,
                            };
                            let Some(update) = update else { break };
                            match ServerFrame::update(&update) {
                                Some(frame) => {
                                    if !send(&outbound, &frame) {
                                        break;
                                    }
                                }
                                None => log::warn!("Dropping non-UTF-8 update on '{}'", update.path),
                            }
                        }
                    });
                    ServerFrame::Ack { id }
                }
                Err(e) => ServerFrame::error(Some(id), ErrorKind::of_tier(&e), e.to_string()),
            }
        }

        ClientFrame::CreateTopicView { id, name, spec } => match session.create_topic_view(&name, &spec).await {
            Ok(()) => ServerFrame::Ack { id },
            Err(e) => ServerFrame::error(Some(id), ErrorKind::of_topic(&e), e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secondary::ValueType;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Client {
        to_hub: mpsc::UnboundedSender<String>,
        from_hub: mpsc::UnboundedReceiver<String>,
    }

    impl Client {
        fn send(&self, frame: &ClientFrame) {
            self.to_hub.send(serde_json::to_string(frame).unwrap()).unwrap();
        }

        async fn recv(&mut self) -> ServerFrame {
            let text = timeout(Duration::from_secs(2), self.from_hub.recv()).await.unwrap().unwrap();
            serde_json::from_str(&text).unwrap()
        }
    }

    fn spawn_connection(hub: &TierHub) -> (Client, tokio::task::JoinHandle<()>) {
        let (to_hub, hub_in) = mpsc::unbounded_channel::<String>();
        let (hub_out, from_hub) = mpsc::unbounded_channel::<String>();
        let hub = hub.clone();
        let inbound = futures_util::stream::unfold(hub_in, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) });
        let handle = tokio::spawn(async move {
            hub.handle_connection("test", Box::pin(inbound), hub_out, CancellationToken::new()).await;
        });
        (Client { to_hub, from_hub }, handle)
    }

    #[tokio::test]
    async fn test_rejected_login_ends_connection() {
        let hub = TierHub::new(MemoryTier::new().with_login("admin", "password"));
        let (mut client, handle) = spawn_connection(&hub);
        client.send(&ClientFrame::Connect { principal: "admin".into(), credential: "nope".into() });

        assert!(matches!(client.recv().await, ServerFrame::Error { id: None, kind: ErrorKind::Rejected, .. }));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_are_acknowledged_and_updates_forwarded() {
        let hub = TierHub::new(MemoryTier::new());
        let (mut client, _handle) = spawn_connection(&hub);

        client.send(&ClientFrame::Connect { principal: "admin".into(), credential: "password".into() });
        assert!(matches!(client.recv().await, ServerFrame::Connected { .. }));

        client.send(&ClientFrame::EnsureTopic { id: 1, path: "redis/bitcoin".into(), value_type: ValueType::Json });
        assert_eq!(client.recv().await, ServerFrame::Ack { id: 1 });

        client.send(&ClientFrame::Subscribe { id: 2, path: "redis/bitcoin".into() });
        assert_eq!(client.recv().await, ServerFrame::Ack { id: 2 });

        client.send(&ClientFrame::Publish { id: 3, path: "redis/bitcoin".into(), value: r#"{"v":1}"#.into() });
        let mut saw_ack = false;
        let mut saw_update = false;
        for _ in 0..2 {
            match client.recv().await {
                ServerFrame::Ack { id: 3 } => saw_ack = true,
                ServerFrame::Update { path, new_value, .. } => {
                    assert_eq!(path, "redis/bitcoin");
                    assert_eq!(new_value, r#"{"v":1}"#);
                    saw_update = true;
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert!(saw_ack && saw_update);
        assert_eq!(hub.tier().publish_count(), 1);
    }

    #[tokio::test]
    async fn test_request_errors_carry_id_and_kind() {
        let hub = TierHub::new(MemoryTier::new());
        let (mut client, _handle) = spawn_connection(&hub);
        client.send(&ClientFrame::Connect { principal: "a".into(), credential: "b".into() });
        client.recv().await;

        client.send(&ClientFrame::Publish { id: 9, path: "missing".into(), value: "1".into() });
        assert!(matches!(
            client.recv().await,
            ServerFrame::Error { id: Some(9), kind: ErrorKind::NoSuchTopic, .. }
        ));

        client.to_hub.send("not a frame".into()).unwrap();
        assert!(matches!(client.recv().await, ServerFrame::Error { id: None, kind: ErrorKind::Protocol, .. }));
    }

    #[tokio::test]
    async fn test_disconnect_closes_session() {
        let hub = TierHub::new(MemoryTier::new());
        let (mut client, handle) = spawn_connection(&hub);
        client.send(&ClientFrame::Connect { principal: "a".into(), credential: "b".into() });
        client.recv().await;
        assert_eq!(hub.tier().session_count(), 1);

        drop(client.to_hub);
        handle.await.unwrap();
        assert_eq!(hub.tier().session_count(), 0);
    }
}
