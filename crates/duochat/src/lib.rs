//! Coordinator-free random one-to-one video chat pairing
//!
//! Clients announce themselves on a shared lobby topic, pair up without any
//! server-side matchmaking, and run a media call plus a chat/control data
//! channel through a pluggable session provider.
//!
//! # Overview
//!
//! - **Lobby**: presence beacons on a pub/sub topic ([`lobby`], [`nostr_lobby`])
//! - **Pairing**: the lexicographically greater ID initiates ([`should_initiate`])
//! - **Session**: one media call and one data channel per pairing ([`provider`])
//! - **Lifecycle**: a single-task state machine driving everything ([`controller`])
//!
//! # Example
//!
//! ```rust,no_run
//! use duochat::mock::{MockBroker, MockCaptureDevice, MockNetwork, MockProvider};
//! use duochat::{Collaborators, Controller, ControllerConfig, LifecycleState};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let network = MockNetwork::new();
//!     let broker = MockBroker::new();
//!
//!     let handle = Controller::spawn(
//!         ControllerConfig::default(),
//!         Collaborators {
//!             provider: Arc::new(MockProvider::new(&network)),
//!             lobby: Arc::new(broker.transport()),
//!             capture: Arc::new(MockCaptureDevice::new()),
//!             credentials: None,
//!         },
//!     );
//!
//!     handle.start_search();
//!     handle.wait_for(|s| s.state == LifecycleState::Connected).await;
//!     handle.send_chat("hi");
//! }
//! ```

pub mod controller;
pub mod ice;
pub mod lobby;
pub mod media;
pub mod mock;
pub mod nostr_lobby;
pub mod protocol;
pub mod provider;
pub mod timer;
pub mod types;

pub use controller::{
    on_close, CloseCause, CloseOutcome, ClosePolicy, Collaborators, Controller, ControllerConfig,
    ControllerError, ControllerHandle, Snapshot,
};
pub use ice::{resolve_ice_servers, CredentialError, CredentialSource, HttpCredentialSource};
pub use lobby::{
    admit_beacon, should_initiate, LobbyEvent, LobbySettings, LobbyTransport, RendezvousClient,
    TransportError,
};
pub use media::{
    CaptureDevice, CaptureHandle, CaptureSource, MediaConstraints, MediaError, MediaGate,
};
pub use nostr_lobby::{NostrLobbyTransport, LOBBY_KIND};
pub use protocol::{rtt_sample, truncate_chars, ChatRateLimiter, Frame, SignalKind};
pub use provider::{
    AdapterConfig, CallEvent, CallWatch, DataEvent, DataLink, DataWatch, IdentityError,
    MediaCall, ProviderConfig, ProviderErrorKind, ProviderEvent, SessionAdapter, SessionError,
    SessionProvider,
};
pub use types::{
    now_ms, ChatMessage, LifecycleState, LocalIdentity, Origin, PresenceBeacon, RemoteMedia,
};

pub use duochat_config::{Config, IceServer};
