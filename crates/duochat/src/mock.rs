//! Mock implementations for testing and simulation
//!
//! In-memory stand-ins for the session provider, the lobby broker and the
//! capture device, so complete clients can be paired inside one process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc};

use crate::lobby::{LobbyTransport, TransportError};
use crate::media::{CaptureDevice, CaptureHandle, CaptureSource, MediaConstraints, MediaError};
use crate::provider::{
    CallEvent, DataEvent, DataLink, IdentityError, MediaCall, ProviderConfig, ProviderErrorKind,
    ProviderEvent, SessionError, SessionProvider,
};
use crate::types::RemoteMedia;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Mock Session Network
// ============================================================================

struct NetworkInner {
    peers: Mutex<HashMap<String, mpsc::UnboundedSender<ProviderEvent>>>,
    deliver_media: AtomicBool,
}

/// Registry connecting mock providers by ID
#[derive(Clone)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                peers: Mutex::new(HashMap::new()),
                deliver_media: AtomicBool::new(true),
            }),
        }
    }

    /// When off, answered calls never produce remote media
    pub fn set_media_delivery(&self, enabled: bool) {
        self.inner.deliver_media.store(enabled, Ordering::SeqCst);
    }

    pub fn is_registered(&self, id: &str) -> bool {
        lock(&self.inner.peers).contains_key(id)
    }

    fn deliver(&self, id: &str, event: ProviderEvent) -> bool {
        match lock(&self.inner.peers).get(id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Mock Provider
// ============================================================================

/// Session provider on a [`MockNetwork`]
pub struct MockProvider {
    id: String,
    network: MockNetwork,
    events_tx: mpsc::UnboundedSender<ProviderEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ProviderEvent>>>,
    open_error: Mutex<Option<IdentityError>>,
    last_config: Mutex<Option<ProviderConfig>>,
    opens: AtomicUsize,
    reconnects: AtomicUsize,
}

impl MockProvider {
    /// Provider that will be assigned a random ID
    pub fn new(network: &MockNetwork) -> Self {
        Self::with_id(network, &uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(network: &MockNetwork, id: &str) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id: id.to_string(),
            network: network.clone(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            open_error: Mutex::new(None),
            last_config: Mutex::new(None),
            opens: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Make the next `open` calls fail
    pub fn fail_open(&self, error: IdentityError) {
        *lock(&self.open_error) = Some(error);
    }

    pub fn last_config(&self) -> Option<ProviderConfig> {
        lock(&self.last_config).clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Inject an identity-level event
    pub fn emit(&self, event: ProviderEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl SessionProvider for MockProvider {
    async fn open(&self, config: ProviderConfig) -> Result<String, IdentityError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_config) = Some(config);
        if let Some(error) = lock(&self.open_error).clone() {
            return Err(error);
        }
        lock(&self.network.inner.peers).insert(self.id.clone(), self.events_tx.clone());
        Ok(self.id.clone())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ProviderEvent>> {
        lock(&self.events_rx).take()
    }

    async fn call(
        &self,
        remote_id: &str,
        capture: &CaptureHandle,
    ) -> Result<Arc<dyn MediaCall>, SessionError> {
        let (ours, theirs) = MockCall::pair(
            &self.id,
            remote_id,
            capture.stream_id(),
            self.network.inner.clone(),
        );
        if !self
            .network
            .deliver(remote_id, ProviderEvent::IncomingCall(theirs))
        {
            self.emit(ProviderEvent::Error(ProviderErrorKind::PeerUnavailable(
                remote_id.to_string(),
            )));
        }
        Ok(ours)
    }

    async fn connect_data(&self, remote_id: &str) -> Result<Arc<dyn DataLink>, SessionError> {
        let (ours, theirs) = MockDataLink::pair(&self.id, remote_id);
        let theirs_handle: Arc<dyn DataLink> = theirs.clone();
        if self
            .network
            .deliver(remote_id, ProviderEvent::IncomingData(theirs_handle))
        {
            ours.set_open();
            theirs.set_open();
        } else {
            self.emit(ProviderEvent::Error(ProviderErrorKind::PeerUnavailable(
                remote_id.to_string(),
            )));
        }
        Ok(ours)
    }

    async fn reconnect(&self) -> Result<(), IdentityError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) {
        lock(&self.network.inner.peers).remove(&self.id);
        let _ = self.events_tx.send(ProviderEvent::Closed);
    }
}

// ============================================================================
// Mock Media Call
// ============================================================================

/// One end of an in-memory media call
pub struct MockCall {
    remote_id: String,
    local_stream: Mutex<Option<String>>,
    open: AtomicBool,
    closed: AtomicBool,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<CallEvent>>>,
    peer: Mutex<Weak<MockCall>>,
    network: Arc<NetworkInner>,
}

impl MockCall {
    fn new(remote_id: &str, local_stream: Option<String>, network: Arc<NetworkInner>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            remote_id: remote_id.to_string(),
            local_stream: Mutex::new(local_stream),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            peer: Mutex::new(Weak::new()),
            network,
        })
    }

    /// Caller end and callee end of a new call
    fn pair(
        caller_id: &str,
        callee_id: &str,
        caller_stream: &str,
        network: Arc<NetworkInner>,
    ) -> (Arc<Self>, Arc<Self>) {
        let caller = Self::new(callee_id, Some(caller_stream.to_string()), network.clone());
        let callee = Self::new(caller_id, None, network);
        *lock(&caller.peer) = Arc::downgrade(&callee);
        *lock(&callee.peer) = Arc::downgrade(&caller);
        (caller, callee)
    }

    fn peer(&self) -> Option<Arc<MockCall>> {
        lock(&self.peer).upgrade()
    }

    fn stream(&self) -> Option<String> {
        lock(&self.local_stream).clone()
    }

    fn shut(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(CallEvent::Close);
        true
    }

    /// Fail this end with an error
    pub fn fail(&self, message: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open.store(false, Ordering::SeqCst);
            let _ = self.events_tx.send(CallEvent::Error(message.to_string()));
        }
    }
}

#[async_trait]
impl MediaCall for MockCall {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn answer(&self, capture: &CaptureHandle) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::ChannelClosed);
        }
        let peer = self.peer().ok_or(SessionError::ChannelClosed)?;
        *lock(&self.local_stream) = Some(capture.stream_id().to_string());
        self.open.store(true, Ordering::SeqCst);
        peer.open.store(true, Ordering::SeqCst);

        if self.network.deliver_media.load(Ordering::SeqCst) {
            if let Some(theirs) = peer.stream() {
                let _ = self
                    .events_tx
                    .send(CallEvent::RemoteStream(RemoteMedia::new(theirs)));
            }
            let _ = peer
                .events_tx
                .send(CallEvent::RemoteStream(RemoteMedia::new(capture.stream_id())));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.shut() {
            if let Some(peer) = self.peer() {
                peer.shut();
            }
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        lock(&self.events_rx).take()
    }
}

// ============================================================================
// Mock Data Link
// ============================================================================

/// One end of an in-memory data channel
pub struct MockDataLink {
    remote_id: String,
    open: AtomicBool,
    closed: AtomicBool,
    events_tx: mpsc::UnboundedSender<DataEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DataEvent>>>,
    peer: Mutex<Weak<MockDataLink>>,
}

impl MockDataLink {
    fn new(remote_id: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            remote_id: remote_id.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            peer: Mutex::new(Weak::new()),
        })
    }

    fn pair(local_id: &str, remote_id: &str) -> (Arc<Self>, Arc<Self>) {
        let ours = Self::new(remote_id);
        let theirs = Self::new(local_id);
        *lock(&ours.peer) = Arc::downgrade(&theirs);
        *lock(&theirs.peer) = Arc::downgrade(&ours);
        (ours, theirs)
    }

    fn set_open(&self) {
        if !self.closed.load(Ordering::SeqCst) && !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(DataEvent::Open);
        }
    }

    fn shut(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(DataEvent::Close);
        true
    }

    /// Deliver raw bytes to this end as if the remote sent them
    pub fn inject(&self, data: Vec<u8>) {
        let _ = self.events_tx.send(DataEvent::Message(data));
    }
}

#[async_trait]
impl DataLink for MockDataLink {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::NotOpen);
        }
        let peer = lock(&self.peer)
            .upgrade()
            .ok_or(SessionError::ChannelClosed)?;
        peer.events_tx
            .send(DataEvent::Message(data))
            .map_err(|e| SessionError::SendFailed(e.to_string()))
    }

    async fn close(&self) {
        if self.shut() {
            if let Some(peer) = lock(&self.peer).upgrade() {
                peer.shut();
            }
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataEvent>> {
        lock(&self.events_rx).take()
    }
}

// ============================================================================
// Mock Lobby Broker
// ============================================================================

struct BrokerInner {
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    available: AtomicBool,
    connects: AtomicUsize,
}

/// In-memory pub/sub broker
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<BrokerInner>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a client transport connected to this broker
    pub fn transport(&self) -> MockLobbyTransport {
        MockLobbyTransport {
            broker: self.inner.clone(),
            subscription: tokio::sync::Mutex::new(None),
            topic: Mutex::new(None),
        }
    }

    /// When unavailable, connects fail
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Sever every live subscription
    pub fn drop_connections(&self) {
        lock(&self.inner.topics).clear();
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Publish a raw payload as if from another client
    pub fn inject(&self, topic: &str, payload: Vec<u8>) {
        if let Some(tx) = lock(&self.inner.topics).get(topic) {
            let _ = tx.send(payload);
        }
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerInner {
    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        lock(&self.topics)
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(1000).0)
            .clone()
    }
}

/// Broker client using broadcast channels
pub struct MockLobbyTransport {
    broker: Arc<BrokerInner>,
    subscription: tokio::sync::Mutex<Option<broadcast::Receiver<Vec<u8>>>>,
    topic: Mutex<Option<String>>,
}

#[async_trait]
impl LobbyTransport for MockLobbyTransport {
    async fn connect(&self, topic: &str) -> Result<(), TransportError> {
        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        if !self.broker.available.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "broker unavailable".to_string(),
            ));
        }
        let rx = self.broker.sender(topic).subscribe();
        *self.subscription.lock().await = Some(rx);
        *lock(&self.topic) = Some(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) {
        self.subscription.lock().await.take();
        lock(&self.topic).take();
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let topic = lock(&self.topic)
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let tx = lock(&self.broker.topics)
            .get(&topic)
            .cloned()
            .ok_or(TransportError::Disconnected)?;
        // No subscribers is not an error at most once
        let _ = tx.send(payload);
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut subscription = self.subscription.lock().await;
        let rx = subscription.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            match rx.recv().await {
                Ok(payload) => return Ok(payload),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(TransportError::Disconnected)
                }
            }
        }
    }
}

// ============================================================================
// Mock Capture Device
// ============================================================================

/// Captured tracks with observable enable flags
pub struct MockCapture {
    stream_id: String,
    video: AtomicBool,
    audio: AtomicBool,
    stopped: AtomicBool,
}

impl MockCapture {
    pub fn video_enabled(&self) -> bool {
        self.video.load(Ordering::SeqCst)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl CaptureSource for MockCapture {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video.store(enabled, Ordering::SeqCst);
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Capture device that grants or refuses every prompt
pub struct MockCaptureDevice {
    failure: Option<MediaError>,
    prompts: AtomicUsize,
    captures: Mutex<Vec<Arc<MockCapture>>>,
}

impl MockCaptureDevice {
    pub fn new() -> Self {
        Self {
            failure: None,
            prompts: AtomicUsize::new(0),
            captures: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Some(error),
            ..Self::new()
        }
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn last_capture(&self) -> Option<Arc<MockCapture>> {
        lock(&self.captures).last().cloned()
    }
}

impl Default for MockCaptureDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureDevice for MockCaptureDevice {
    async fn acquire(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<Arc<dyn CaptureSource>, MediaError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let capture = Arc::new(MockCapture {
            stream_id: format!("capture-{}", uuid::Uuid::new_v4()),
            video: AtomicBool::new(true),
            audio: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        });
        lock(&self.captures).push(capture.clone());
        Ok(capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaGate;

    async fn capture() -> CaptureHandle {
        MediaGate::new(Arc::new(MockCaptureDevice::new()), MediaConstraints::default())
            .acquire()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_call_to_unknown_peer_reports_unavailable() {
        let network = MockNetwork::new();
        let alice = MockProvider::with_id(&network, "alice");
        let mut events = alice.take_events().unwrap();
        alice.open(ProviderConfig::default()).await.unwrap();

        alice.call("nobody", &capture().await).await.unwrap();
        match events.recv().await {
            Some(ProviderEvent::Error(ProviderErrorKind::PeerUnavailable(id))) => {
                assert_eq!(id, "nobody")
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_data_link_roundtrip() {
        let network = MockNetwork::new();
        let alice = MockProvider::with_id(&network, "alice");
        let bob = MockProvider::with_id(&network, "bob");
        let mut bob_events = bob.take_events().unwrap();
        alice.open(ProviderConfig::default()).await.unwrap();
        bob.open(ProviderConfig::default()).await.unwrap();

        let ours = alice.connect_data("bob").await.unwrap();
        let theirs = match bob_events.recv().await {
            Some(ProviderEvent::IncomingData(link)) => link,
            other => panic!("unexpected event: {:?}", other),
        };
        let mut their_events = theirs.take_events().unwrap();
        assert_eq!(their_events.recv().await, Some(DataEvent::Open));

        ours.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(
            their_events.recv().await,
            Some(DataEvent::Message(b"hello".to_vec()))
        );

        ours.close().await;
        assert_eq!(their_events.recv().await, Some(DataEvent::Close));
        assert_eq!(ours.send(b"late".to_vec()).await, Err(SessionError::NotOpen));
    }

    #[tokio::test]
    async fn test_withheld_media_never_streams() {
        let network = MockNetwork::new();
        network.set_media_delivery(false);
        let alice = MockProvider::with_id(&network, "alice");
        let bob = MockProvider::with_id(&network, "bob");
        let mut bob_events = bob.take_events().unwrap();
        alice.open(ProviderConfig::default()).await.unwrap();
        bob.open(ProviderConfig::default()).await.unwrap();

        let ours = alice.call("bob", &capture().await).await.unwrap();
        let mut our_events = ours.take_events().unwrap();
        if let Some(ProviderEvent::IncomingCall(theirs)) = bob_events.recv().await {
            theirs.answer(&capture().await).await.unwrap();
        }
        assert!(ours.is_open());
        assert!(our_events.try_recv().is_err());
    }
}
