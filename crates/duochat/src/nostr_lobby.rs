//! Nostr relay lobby transport
//!
//! Beacons travel as ephemeral events of kind [`LOBBY_KIND`] tagged
//! `["l", <topic>]`, with the JSON beacon as content. Every configured relay
//! gets its own websocket; events seen on more than one relay are delivered
//! once.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use nostr::{
    Alphabet, ClientMessage, Event, EventBuilder, EventId, Filter, JsonUtil, Keys, Kind,
    RelayMessage, SingleLetterTag, SubscriptionId, Tag, Timestamp,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::lobby::{LobbyTransport, TransportError};

/// Ephemeral event kind carrying lobby beacons
pub const LOBBY_KIND: u16 = 25_051;

const RELAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_SEEN_EVENTS: usize = 4096;

struct Connection {
    topic: String,
    outbound: broadcast::Sender<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Lobby broker backed by a set of Nostr relays
pub struct NostrLobbyTransport {
    relays: Vec<String>,
    keys: Keys,
    connection: Mutex<Option<Connection>>,
    inbound: tokio::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl NostrLobbyTransport {
    /// Transport with a throwaway signing key
    pub fn new(relays: Vec<String>) -> Self {
        Self::with_keys(relays, Keys::generate())
    }

    pub fn with_keys(relays: Vec<String>, keys: Keys) -> Self {
        Self {
            relays,
            keys,
            connection: Mutex::new(None),
            inbound: tokio::sync::Mutex::new(None),
        }
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn beacon_event(&self, topic: &str, payload: Vec<u8>) -> Result<Event, TransportError> {
        let content = String::from_utf8(payload)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let tag = Tag::parse(["l", topic]).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        EventBuilder::new(Kind::from(LOBBY_KIND), content)
            .tags(vec![tag])
            .sign(&self.keys)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl LobbyTransport for NostrLobbyTransport {
    async fn connect(&self, topic: &str) -> Result<(), TransportError> {
        self.disconnect().await;

        let attempts = self.relays.iter().map(|url| async move {
            match tokio::time::timeout(RELAY_CONNECT_TIMEOUT, connect_async(url.as_str())).await {
                Ok(Ok((ws, _))) => Some((url.clone(), ws)),
                Ok(Err(e)) => {
                    warn!(relay = %url, error = %e, "relay connect failed");
                    None
                }
                Err(_) => {
                    warn!(relay = %url, "relay connect timed out");
                    None
                }
            }
        });
        let streams: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .flatten()
            .collect();

        if streams.is_empty() {
            return Err(TransportError::ConnectionFailed(
                "no relay reachable".to_string(),
            ));
        }

        let filter = Filter::new()
            .kind(Kind::from(LOBBY_KIND))
            .custom_tag(SingleLetterTag::lowercase(Alphabet::L), vec![topic.to_string()])
            .since(Timestamp::now());
        let sub_id = SubscriptionId::generate();
        let subscribe = ClientMessage::req(sub_id, vec![filter]).as_json();

        let (outbound, _) = broadcast::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let tasks = streams
            .into_iter()
            .map(|(url, ws)| {
                let relay = RelayLink {
                    url,
                    topic: topic.to_string(),
                    subscribe: subscribe.clone(),
                    outbound: outbound.subscribe(),
                    inbound: inbound_tx.clone(),
                    seen: seen.clone(),
                };
                tokio::spawn(relay.run(ws))
            })
            .collect::<Vec<_>>();

        info!(relays = tasks.len(), topic, "lobby subscribed");
        *self.inbound.lock().await = Some(inbound_rx);
        *self.connection() = Some(Connection {
            topic: topic.to_string(),
            outbound,
            tasks,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        let had = self.connection().take().is_some();
        self.inbound.lock().await.take();
        if had {
            debug!("lobby relays disconnected");
        }
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let topic = self
            .connection()
            .as_ref()
            .map(|c| c.topic.clone())
            .ok_or(TransportError::NotConnected)?;
        let event = self.beacon_event(&topic, payload).await?;
        let message = ClientMessage::event(event).as_json();

        let guard = self.connection();
        let connection = guard.as_ref().ok_or(TransportError::NotConnected)?;
        connection
            .outbound
            .send(message)
            .map(|_| ())
            .map_err(|_| TransportError::Disconnected)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        let rx = inbound.as_mut().ok_or(TransportError::NotConnected)?;
        rx.recv().await.ok_or(TransportError::Disconnected)
    }
}

/// One relay websocket
struct RelayLink {
    url: String,
    topic: String,
    subscribe: String,
    outbound: broadcast::Receiver<String>,
    inbound: mpsc::Sender<Vec<u8>>,
    seen: Arc<Mutex<HashSet<EventId>>>,
}

impl RelayLink {
    async fn run<S>(mut self, ws: S)
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut write, mut read) = ws.split();

        if let Err(e) = write.send(Message::Text(self.subscribe.clone().into())).await {
            warn!(relay = %self.url, error = %e, "relay subscribe failed");
            return;
        }

        loop {
            tokio::select! {
                outgoing = self.outbound.recv() => {
                    match outgoing {
                        Ok(json) => {
                            if let Err(e) = write.send(Message::Text(json.into())).await {
                                warn!(relay = %self.url, error = %e, "relay publish failed");
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(relay = %self.url, skipped = n, "relay writer lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(payload) = self.accept(&text) {
                                if self.inbound.send(payload).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!(relay = %self.url, "relay closed connection");
                            return;
                        }
                        Some(Err(e)) => {
                            warn!(relay = %self.url, error = %e, "relay websocket error");
                            return;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    /// Beacon content of a relay frame, once per event id
    fn accept(&self, text: &str) -> Option<Vec<u8>> {
        let RelayMessage::Event { event, .. } = RelayMessage::from_json(text).ok()? else {
            return None;
        };
        if event.kind != Kind::from(LOBBY_KIND) || !has_topic_tag(&event, &self.topic) {
            trace!(relay = %self.url, "dropping off-topic event");
            return None;
        }

        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.len() >= MAX_SEEN_EVENTS {
            seen.clear();
        }
        if !seen.insert(event.id) {
            return None;
        }
        Some(event.content.as_bytes().to_vec())
    }
}

fn has_topic_tag(event: &Event, topic: &str) -> bool {
    event.tags.iter().any(|tag| {
        let values: Vec<String> = tag.clone().to_vec();
        values.len() >= 2 && values[0] == "l" && values[1] == topic
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_beacon_event_shape() {
        let transport = NostrLobbyTransport::new(vec![]);
        let event = transport
            .beacon_event("lobby-x", br#"{"peerId":"a","timestamp":1}"#.to_vec())
            .await
            .unwrap();
        assert_eq!(event.kind, Kind::from(LOBBY_KIND));
        assert_eq!(event.content, r#"{"peerId":"a","timestamp":1}"#);
        assert!(has_topic_tag(&event, "lobby-x"));
        assert!(!has_topic_tag(&event, "lobby-y"));
    }

    #[tokio::test]
    async fn test_no_relays_fails_to_connect() {
        let transport = NostrLobbyTransport::new(vec![]);
        assert!(matches!(
            transport.connect("lobby").await,
            Err(TransportError::ConnectionFailed(_))
        ));
        assert_eq!(
            transport.publish(b"{}".to_vec()).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(transport.recv().await, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_duplicate_events_delivered_once() {
        let transport = NostrLobbyTransport::new(vec![]);
        let event = transport
            .beacon_event("lobby-x", br#"{"peerId":"a","timestamp":1}"#.to_vec())
            .await
            .unwrap();
        let frame = RelayMessage::event(SubscriptionId::new("s"), event).as_json();

        let (_tx, outbound) = broadcast::channel(1);
        let (inbound, _rx) = mpsc::channel(1);
        let link = RelayLink {
            url: "wss://relay.test".to_string(),
            topic: "lobby-x".to_string(),
            subscribe: String::new(),
            outbound,
            inbound,
            seen: Arc::new(Mutex::new(HashSet::new())),
        };
        assert!(link.accept(&frame).is_some());
        assert!(link.accept(&frame).is_none());
        assert!(link.accept("[\"NOTICE\",\"hi\"]").is_none());
    }
}
