//! Rendezvous client
//!
//! Publishes presence beacons to the lobby topic while searching and reports
//! beacons from other searching clients. Which side of a pair places the call
//! is decided by [`should_initiate`], a pure function of both IDs, so the two
//! sides agree without exchanging anything.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::types::{now_ms, PresenceBeacon};

/// Lobby broker errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
    #[error("Disconnected")]
    Disconnected,
    #[error("Not connected")]
    NotConnected,
}

/// Pub/sub broker carrying the lobby topic
///
/// Abstracts the broker connection (Nostr relays or in-memory) so the
/// rendezvous logic is shared between real and simulated runs.
#[async_trait]
pub trait LobbyTransport: Send + Sync {
    /// Connect and subscribe to `topic`
    async fn connect(&self, topic: &str) -> Result<(), TransportError>;

    /// Unsubscribe and drop the connection
    async fn disconnect(&self);

    /// Publish one payload to the subscribed topic, at most once
    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Next payload from the topic; an error means the connection is gone
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;
}

/// `true` if the local side places the call for this pair
pub fn should_initiate(local_id: &str, remote_id: &str) -> bool {
    local_id > remote_id
}

/// Rendezvous timing
#[derive(Debug, Clone)]
pub struct LobbySettings {
    pub topic: String,
    pub heartbeat_interval: Duration,
    pub staleness_window_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

impl From<&duochat_config::LobbyConfig> for LobbySettings {
    fn from(config: &duochat_config::LobbyConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            staleness_window_ms: config.staleness_window_ms,
            reconnect_attempts: config.reconnect_attempts.max(1),
            reconnect_backoff: Duration::from_millis(config.reconnect_backoff_ms),
        }
    }
}

/// Events tagged with the join generation that produced them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyEvent {
    PeerSeen {
        generation: u64,
        peer_id: String,
        /// Sender clock at publish time, in ms
        timestamp: i64,
    },
    /// Reconnect budget exhausted
    Unavailable { generation: u64 },
}

/// Lobby membership for one client
pub struct RendezvousClient {
    transport: Arc<dyn LobbyTransport>,
    settings: LobbySettings,
    ignore: Arc<Mutex<HashSet<String>>>,
    events_tx: mpsc::UnboundedSender<LobbyEvent>,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl RendezvousClient {
    pub fn new(
        transport: Arc<dyn LobbyTransport>,
        settings: LobbySettings,
    ) -> (Self, mpsc::UnboundedReceiver<LobbyEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            transport,
            settings,
            ignore: Arc::new(Mutex::new(HashSet::new())),
            events_tx,
            generation: 0,
            task: None,
        };
        (client, events_rx)
    }

    /// Generation of the current membership; events from older ones are stale
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_joined(&self) -> bool {
        self.task.is_some()
    }

    fn ignored(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.ignore.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Never report `peer_id` again during this episode
    pub fn ignore(&self, peer_id: &str) {
        self.ignored().insert(peer_id.to_string());
    }

    pub fn is_ignored(&self, peer_id: &str) -> bool {
        self.ignored().contains(peer_id)
    }

    pub fn clear_ignored(&self) {
        self.ignored().clear();
    }

    /// Start announcing `local_id`; replaces any current membership
    pub async fn join(&mut self, local_id: &str) {
        self.leave().await;
        self.generation += 1;
        // The local ID never enters the ignore set
        self.ignored().remove(local_id);

        let worker = LobbyWorker {
            transport: self.transport.clone(),
            settings: self.settings.clone(),
            local_id: local_id.to_string(),
            ignore: self.ignore.clone(),
            events_tx: self.events_tx.clone(),
            generation: self.generation,
        };
        info!(topic = %self.settings.topic, generation = self.generation, "joining lobby");
        self.task = Some(tokio::spawn(worker.run()));
    }

    /// Stop announcing and unsubscribe; no-op when not joined
    pub async fn leave(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.generation += 1;
            self.transport.disconnect().await;
            info!(topic = %self.settings.topic, "left lobby");
        }
    }
}

impl Drop for RendezvousClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct LobbyWorker {
    transport: Arc<dyn LobbyTransport>,
    settings: LobbySettings,
    local_id: String,
    ignore: Arc<Mutex<HashSet<String>>>,
    events_tx: mpsc::UnboundedSender<LobbyEvent>,
    generation: u64,
}

impl LobbyWorker {
    async fn run(self) {
        let mut failures = 0u32;
        loop {
            match self.transport.connect(&self.settings.topic).await {
                Ok(()) => {
                    failures = 0;
                    debug!(topic = %self.settings.topic, "lobby connected");
                    if let Err(e) = self.serve().await {
                        warn!(error = %e, "lobby connection lost");
                    }
                    self.transport.disconnect().await;
                }
                Err(e) => warn!(error = %e, "lobby connect failed"),
            }

            failures += 1;
            if failures >= self.settings.reconnect_attempts {
                warn!(failures, "matchmaking unavailable");
                let _ = self.events_tx.send(LobbyEvent::Unavailable {
                    generation: self.generation,
                });
                return;
            }
            debug!(
                attempt = failures + 1,
                backoff_ms = self.settings.reconnect_backoff.as_millis() as u64,
                "retrying lobby connection"
            );
            tokio::time::sleep(self.settings.reconnect_backoff).await;
        }
    }

    /// Heartbeat and receive until the connection fails
    async fn serve(&self) -> Result<(), TransportError> {
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let beacon = PresenceBeacon::new(self.local_id.clone());
                    self.transport.publish(beacon.encode()).await?;
                    trace!("beacon published");
                }
                payload = self.transport.recv() => {
                    if let Some(beacon) = self.admit(&payload?) {
                        if self.events_tx.send(LobbyEvent::PeerSeen {
                            generation: self.generation,
                            peer_id: beacon.peer_id,
                            timestamp: beacon.timestamp,
                        }).is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn admit(&self, payload: &[u8]) -> Option<PresenceBeacon> {
        let ignore = self.ignore.lock().unwrap_or_else(|e| e.into_inner());
        admit_beacon(
            payload,
            &self.local_id,
            now_ms(),
            self.settings.staleness_window_ms,
            &ignore,
        )
    }
}

/// Decoded beacon of a lobby payload worth acting on
///
/// Drops malformed payloads, our own beacons, stale beacons and ignored
/// senders.
pub fn admit_beacon(
    payload: &[u8],
    local_id: &str,
    now: i64,
    staleness_window_ms: u64,
    ignore: &HashSet<String>,
) -> Option<PresenceBeacon> {
    let Some(beacon) = PresenceBeacon::decode(payload) else {
        trace!(len = payload.len(), "dropping malformed beacon");
        return None;
    };
    if beacon.peer_id == local_id {
        return None;
    }
    if beacon.is_stale(now, staleness_window_ms) {
        debug!(peer = %beacon.peer_id, age_ms = now - beacon.timestamp, "dropping stale beacon");
        return None;
    }
    if ignore.contains(&beacon.peer_id) {
        trace!(peer = %beacon.peer_id, "dropping beacon from ignored peer");
        return None;
    }
    Some(beacon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBroker;

    fn settings() -> LobbySettings {
        LobbySettings {
            topic: "test-lobby".to_string(),
            heartbeat_interval: Duration::from_millis(1500),
            staleness_window_ms: 3000,
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(2),
        }
    }

    fn beacon(peer: &str, timestamp: i64) -> Vec<u8> {
        PresenceBeacon {
            peer_id: peer.to_string(),
            timestamp,
        }
        .encode()
    }

    #[test]
    fn test_pairing_rule_is_antisymmetric() {
        assert!(should_initiate("b", "a"));
        assert!(!should_initiate("a", "b"));
        for (x, y) in [("peer-1", "peer-2"), ("Z", "a"), ("abc", "abcd")] {
            assert_ne!(should_initiate(x, y), should_initiate(y, x));
        }
    }

    #[test]
    fn test_admit_filters() {
        let now = 100_000;
        let mut ignore = HashSet::new();
        ignore.insert("ignored".to_string());

        assert_eq!(
            admit_beacon(&beacon("other", now - 100), "me", now, 3000, &ignore),
            Some(PresenceBeacon {
                peer_id: "other".to_string(),
                timestamp: now - 100,
            })
        );
        assert_eq!(admit_beacon(&beacon("me", now), "me", now, 3000, &ignore), None);
        assert_eq!(admit_beacon(&beacon("other", now - 3001), "me", now, 3000, &ignore), None);
        assert_eq!(
            admit_beacon(&beacon("other", now - 3000), "me", now, 3000, &ignore)
                .map(|b| b.peer_id),
            Some("other".to_string())
        );
        assert_eq!(admit_beacon(&beacon("ignored", now), "me", now, 3000, &ignore), None);
        assert_eq!(admit_beacon(b"{}", "me", now, 3000, &ignore), None);
    }

    #[tokio::test]
    async fn test_two_clients_see_each_other() {
        let broker = MockBroker::new();
        let (mut alice, mut alice_events) =
            RendezvousClient::new(Arc::new(broker.transport()), settings());
        let (mut bob, mut bob_events) =
            RendezvousClient::new(Arc::new(broker.transport()), settings());

        alice.join("alice").await;
        bob.join("bob").await;

        // bob's first beacon may predate alice's subscription; wait for a later one
        let seen = tokio::time::timeout(Duration::from_secs(5), alice_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            seen,
            LobbyEvent::PeerSeen { generation, ref peer_id, .. }
                if generation == alice.generation() && peer_id == "bob"
        ));
        let seen = tokio::time::timeout(Duration::from_secs(5), bob_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(seen, LobbyEvent::PeerSeen { ref peer_id, .. } if peer_id == "alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_peer_is_not_reported() {
        let broker = MockBroker::new();
        let (mut alice, mut alice_events) =
            RendezvousClient::new(Arc::new(broker.transport()), settings());
        alice.ignore("bob");
        alice.join("alice").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        broker.inject("test-lobby", beacon("bob", now_ms()));
        broker.inject("test-lobby", beacon("carol", now_ms()));

        let seen = alice_events.recv().await.unwrap();
        assert!(matches!(seen, LobbyEvent::PeerSeen { ref peer_id, .. } if peer_id == "carol"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sighting_carries_beacon_timestamp() {
        let broker = MockBroker::new();
        let (mut alice, mut alice_events) =
            RendezvousClient::new(Arc::new(broker.transport()), settings());
        alice.join("alice").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sent_at = now_ms() - 1200;
        broker.inject("test-lobby", beacon("bob", sent_at));

        let seen = alice_events.recv().await.unwrap();
        assert_eq!(
            seen,
            LobbyEvent::PeerSeen {
                generation: alice.generation(),
                peer_id: "bob".to_string(),
                timestamp: sent_at,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_reports_unavailable() {
        let broker = MockBroker::new();
        broker.set_available(false);
        let (mut client, mut events) =
            RendezvousClient::new(Arc::new(broker.transport()), settings());

        let started = tokio::time::Instant::now();
        client.join("alice").await;
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            LobbyEvent::Unavailable {
                generation: client.generation()
            }
        );
        // initial attempt plus two retries, 2s apart
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget() {
        let broker = MockBroker::new();
        broker.set_available(false);
        let (mut client, mut events) =
            RendezvousClient::new(Arc::new(broker.transport()), settings());
        client.join("alice").await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        broker.set_available(true);
        tokio::time::sleep(Duration::from_secs(2)).await;

        broker.inject("test-lobby", beacon("bob", now_ms()));
        let event = events.recv().await.unwrap();
        assert!(matches!(event, LobbyEvent::PeerSeen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_is_idempotent_and_invalidates_generation() {
        let broker = MockBroker::new();
        let (mut client, _events) =
            RendezvousClient::new(Arc::new(broker.transport()), settings());
        client.join("alice").await;
        let joined = client.generation();

        client.leave().await;
        let left = client.generation();
        assert!(left > joined);
        assert!(!client.is_joined());

        client.leave().await;
        assert_eq!(client.generation(), left);
    }
}
