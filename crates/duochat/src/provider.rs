//! Session provider adapter
//!
//! The provider is the WebRTC-capable negotiation library (offer/answer,
//! ICE, NAT traversal). This module defines the contract it must satisfy and
//! wraps it so that:
//! - only one identity init is pending at a time
//! - each handle reports its terminal outcome exactly once and nothing after
//!   it is discarded

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::ice::{resolve_ice_servers, CredentialSource, IceServer};
use crate::media::CaptureHandle;
use crate::types::{LocalIdentity, RemoteMedia};

/// Identity establishment failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("Connection initialization timed out. Please check your network connection.")]
    Timeout,
    #[error("Connection transport error: {0}")]
    Transport(String),
    #[error("Connection server error: {0}")]
    Server(String),
    #[error("Connection identity was closed")]
    Closed,
}

/// Failures on a single call or data channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("peer {0} is unavailable")]
    PeerUnavailable(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("channel not open")]
    NotOpen,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("no local identity")]
    NoIdentity,
}

/// Configuration handed to the provider when establishing an identity
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub ice_servers: Vec<IceServer>,
}

/// Events from a media call handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    RemoteStream(RemoteMedia),
    Close,
    Error(String),
}

/// Events from a data channel handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataEvent {
    Open,
    Message(Vec<u8>),
    Close,
    Error(String),
}

/// Runtime failures reported by the provider itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The remote a call was addressed to does not exist (anymore)
    PeerUnavailable(String),
    Network,
    Server,
    /// Platform lacks peer-connection support
    Incompatible,
    Other(String),
}

/// Identity-level events
pub enum ProviderEvent {
    IncomingCall(Arc<dyn MediaCall>),
    IncomingData(Arc<dyn DataLink>),
    /// Lost the negotiation infrastructure; peer sessions may survive
    Disconnected,
    /// Identity destroyed
    Closed,
    Error(ProviderErrorKind),
}

impl std::fmt::Debug for ProviderEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderEvent::IncomingCall(call) => {
                write!(f, "IncomingCall({})", call.remote_id())
            }
            ProviderEvent::IncomingData(link) => {
                write!(f, "IncomingData({})", link.remote_id())
            }
            ProviderEvent::Disconnected => write!(f, "Disconnected"),
            ProviderEvent::Closed => write!(f, "Closed"),
            ProviderEvent::Error(kind) => write!(f, "Error({:?})", kind),
        }
    }
}

/// One media call
#[async_trait]
pub trait MediaCall: Send + Sync {
    fn remote_id(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Answer an incoming call with the local capture
    async fn answer(&self, capture: &CaptureHandle) -> Result<(), SessionError>;

    async fn close(&self);

    /// Event stream; can be taken once
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CallEvent>>;
}

/// One reliable data channel
#[async_trait]
pub trait DataLink: Send + Sync {
    fn remote_id(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send(&self, data: Vec<u8>) -> Result<(), SessionError>;

    async fn close(&self);

    /// Event stream; can be taken once
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataEvent>>;
}

/// WebRTC-capable negotiation library
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Register with the negotiation infrastructure and return the assigned ID
    async fn open(&self, config: ProviderConfig) -> Result<String, IdentityError>;

    /// Identity-level event stream; can be taken once
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ProviderEvent>>;

    async fn call(
        &self,
        remote_id: &str,
        capture: &CaptureHandle,
    ) -> Result<Arc<dyn MediaCall>, SessionError>;

    async fn connect_data(&self, remote_id: &str) -> Result<Arc<dyn DataLink>, SessionError>;

    /// Resume after `ProviderEvent::Disconnected`
    async fn reconnect(&self) -> Result<(), IdentityError>;

    async fn destroy(&self);
}

/// Call events with the handle contract enforced
///
/// The remote stream is reported at most once, exactly one of close/error
/// ends the stream, and a handle that vanishes without either reads as
/// closed. Dropping the watch discards the handle's remaining events.
pub struct CallWatch {
    rx: mpsc::UnboundedReceiver<CallEvent>,
    streamed: bool,
    done: bool,
}

impl CallWatch {
    /// `None` if the handle's events were already taken
    pub fn new(call: &dyn MediaCall) -> Option<Self> {
        Some(Self {
            rx: call.take_events()?,
            streamed: false,
            done: false,
        })
    }

    /// Next event; `None` once the terminal event has been reported
    pub async fn next(&mut self) -> Option<CallEvent> {
        if self.done {
            return None;
        }
        loop {
            let Some(event) = self.rx.recv().await else {
                self.done = true;
                return Some(CallEvent::Close);
            };
            match event {
                CallEvent::RemoteStream(_) if self.streamed => continue,
                CallEvent::RemoteStream(_) => self.streamed = true,
                CallEvent::Close | CallEvent::Error(_) => self.done = true,
            }
            return Some(event);
        }
    }
}

/// Data channel events with the handle contract enforced
pub struct DataWatch {
    rx: mpsc::UnboundedReceiver<DataEvent>,
    opened: bool,
    done: bool,
}

impl DataWatch {
    pub fn new(link: &dyn DataLink) -> Option<Self> {
        Some(Self {
            rx: link.take_events()?,
            opened: false,
            done: false,
        })
    }

    pub async fn next(&mut self) -> Option<DataEvent> {
        if self.done {
            return None;
        }
        loop {
            let Some(event) = self.rx.recv().await else {
                self.done = true;
                return Some(DataEvent::Close);
            };
            match event {
                DataEvent::Open if self.opened => continue,
                DataEvent::Open => self.opened = true,
                DataEvent::Message(_) => {}
                DataEvent::Close | DataEvent::Error(_) => self.done = true,
            }
            return Some(event);
        }
    }
}

type PendingInit = Shared<BoxFuture<'static, Result<LocalIdentity, IdentityError>>>;

/// Adapter settings
#[derive(Clone)]
pub struct AdapterConfig {
    pub identity_timeout: Duration,
    pub fallback_ice_servers: Vec<IceServer>,
}

/// Thin facade over a [`SessionProvider`]
pub struct SessionAdapter {
    provider: Arc<dyn SessionProvider>,
    credentials: Option<Arc<dyn CredentialSource>>,
    config: AdapterConfig,
    pending: Mutex<Option<PendingInit>>,
    events_tx: mpsc::UnboundedSender<ProviderEvent>,
    provider_forward: Mutex<Option<AbortHandle>>,
}

impl SessionAdapter {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        credentials: Option<Arc<dyn CredentialSource>>,
        config: AdapterConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let adapter = Self {
            provider,
            credentials,
            config,
            pending: Mutex::new(None),
            events_tx,
            provider_forward: Mutex::new(None),
        };
        (adapter, events_rx)
    }

    /// Establish the local identity
    ///
    /// Concurrent callers share the pending attempt and its result.
    pub async fn init_identity(&self) -> Result<LocalIdentity, IdentityError> {
        self.forward_provider_events();

        let attempt = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let attempt = Self::establish(
                        self.provider.clone(),
                        self.credentials.clone(),
                        self.config.clone(),
                    )
                    .boxed()
                    .shared();
                    *pending = Some(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.clone().await;
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.as_ref().is_some_and(|p| p.ptr_eq(&attempt)) {
            pending.take();
        }
        result
    }

    async fn establish(
        provider: Arc<dyn SessionProvider>,
        credentials: Option<Arc<dyn CredentialSource>>,
        config: AdapterConfig,
    ) -> Result<LocalIdentity, IdentityError> {
        let ice_servers =
            resolve_ice_servers(credentials.as_deref(), &config.fallback_ice_servers).await;
        let provider_config = ProviderConfig { ice_servers };

        match tokio::time::timeout(config.identity_timeout, provider.open(provider_config)).await
        {
            Ok(Ok(id)) => {
                let identity = LocalIdentity::new(id);
                info!(id = %identity, "session identity established");
                Ok(identity)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "session identity failed");
                Err(e)
            }
            Err(_) => {
                warn!(
                    timeout_ms = config.identity_timeout.as_millis() as u64,
                    "session identity timed out"
                );
                Err(IdentityError::Timeout)
            }
        }
    }

    fn forward_provider_events(&self) {
        let mut forward = self
            .provider_forward
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if forward.is_some() {
            return;
        }
        let Some(mut rx) = self.provider.take_events() else {
            return;
        };
        let tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                debug!(?event, "provider event");
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        *forward = Some(task.abort_handle());
    }

    /// Initiate an outbound media call
    pub async fn call(
        &self,
        remote_id: &str,
        capture: &CaptureHandle,
    ) -> Result<Arc<dyn MediaCall>, SessionError> {
        debug!(peer = remote_id, "placing call");
        self.provider.call(remote_id, capture).await
    }

    /// Initiate an outbound data channel
    pub async fn connect_data(&self, remote_id: &str) -> Result<Arc<dyn DataLink>, SessionError> {
        debug!(peer = remote_id, "opening data channel");
        self.provider.connect_data(remote_id).await
    }

    /// Best-effort resume after the identity lost its infrastructure
    pub async fn reconnect_identity(&self) {
        info!("reconnecting session identity");
        if let Err(e) = self.provider.reconnect().await {
            warn!(error = %e, "identity reconnect failed");
        }
    }

    pub async fn destroy(&self) {
        self.provider.destroy().await;
    }
}

impl Drop for SessionAdapter {
    fn drop(&mut self) {
        if let Some(forward) = self
            .provider_forward
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            forward.abort();
        }
    }
}
