//! Lifecycle controller
//!
//! A single task owns the lifecycle state, the local identity, the ignore
//! set, the current Session and every timer. Commands from the UI, lobby
//! events, provider events, handle events, timer firings and background
//! preparation results are all funnelled into that task and handled one at
//! a time, so no state is shared with the collaborators.
//!
//! How a Session ends is decided in [`machine`]; this module performs the
//! side effects.

mod machine;

pub use machine::{on_close, CloseCause, CloseOutcome, ClosePolicy};
pub use machine::{
    NOTICE_CONNECT_FAILED, NOTICE_CONNECT_FAILED_RESUMING, NOTICE_REMOTE_DISCONNECTED,
    NOTICE_REMOTE_ENDED, NOTICE_REMOTE_SKIPPED, NOTICE_SKIPPED,
};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use duochat_config::Config;

use crate::ice::{CredentialSource, IceServer};
use crate::lobby::{should_initiate, LobbyEvent, LobbySettings, LobbyTransport, RendezvousClient};
use crate::media::{CaptureDevice, MediaConstraints, MediaError, MediaGate};
use crate::protocol::{rtt_sample, truncate_chars, ChatRateLimiter, Frame, SignalKind};
use crate::provider::{
    AdapterConfig, CallEvent, CallWatch, DataEvent, DataLink, DataWatch, IdentityError,
    MediaCall, ProviderErrorKind, ProviderEvent, SessionAdapter, SessionError, SessionProvider,
};
use crate::timer::{TimerFired, TimerKind, TimerSet};
use crate::types::{
    now_ms, ChatMessage, LifecycleState, LocalIdentity, Origin, PresenceBeacon, RemoteMedia,
};

/// User-visible failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("Could not connect to matchmaking server. Please try again later.")]
    MatchmakingUnavailable,
    #[error("Call connection failed. Trying next peer...")]
    CallFailed,
    #[error("Failed to connect to peer. Trying next...")]
    PeerUnreachable,
    #[error("Network connection lost. Please try again.")]
    NetworkLost,
    #[error("This platform is not fully compatible with WebRTC.")]
    Incompatible,
    #[error("Slow down! Too many messages.")]
    RateLimited,
    #[error("Failed to send message. Connection may be lost.")]
    SendFailed,
}

/// Runtime settings with durations resolved
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub lobby: LobbySettings,
    pub identity_timeout: Duration,
    pub stream_handshake_timeout: Duration,
    pub connection_attempt_timeout: Duration,
    pub settle_delay: Duration,
    pub close_policy: ClosePolicy,
    pub accept_calls_while_idle: bool,
    pub max_message_chars: usize,
    pub rate_limit_per_sec: usize,
    pub ping_interval: Duration,
    pub max_rtt_ms: u64,
    pub error_display: Duration,
    pub fallback_ice_servers: Vec<IceServer>,
    pub media: MediaConstraints,
}

impl From<&Config> for ControllerConfig {
    fn from(config: &Config) -> Self {
        let session = &config.session;
        let chat = &config.chat;
        Self {
            lobby: LobbySettings::from(&config.lobby),
            identity_timeout: Duration::from_millis(session.identity_timeout_ms),
            stream_handshake_timeout: Duration::from_millis(session.stream_handshake_timeout_ms),
            connection_attempt_timeout: Duration::from_millis(
                session.connection_attempt_timeout_ms,
            ),
            settle_delay: Duration::from_millis(session.settle_delay_ms),
            close_policy: ClosePolicy {
                handshake_timeout: session.handshake_timeout_policy,
                auto_resume_on_drop: session.auto_resume_on_drop,
            },
            accept_calls_while_idle: session.accept_calls_while_idle,
            max_message_chars: chat.max_message_chars,
            rate_limit_per_sec: chat.rate_limit_per_sec,
            ping_interval: Duration::from_millis(chat.ping_interval_ms),
            max_rtt_ms: chat.max_rtt_ms,
            error_display: Duration::from_millis(chat.error_display_ms),
            fallback_ice_servers: config.ice.fallback_servers.clone(),
            media: MediaConstraints::from(&config.media),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// External systems the controller drives
pub struct Collaborators {
    pub provider: Arc<dyn SessionProvider>,
    pub lobby: Arc<dyn LobbyTransport>,
    pub capture: Arc<dyn CaptureDevice>,
    pub credentials: Option<Arc<dyn CredentialSource>>,
}

/// Everything the UI can observe
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub state: LifecycleState,
    pub local_id: Option<String>,
    /// Stream ID of the held capture handle
    pub local_media: Option<String>,
    pub remote_media: Option<RemoteMedia>,
    pub remote_peer: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub latency_ms: Option<u64>,
    pub call_started_at: Option<i64>,
    pub last_error: Option<String>,
    /// Device or identity acquisition in progress
    pub initializing: bool,
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub remote_audio_enabled: bool,
}

#[derive(Debug)]
enum Command {
    StartSearch,
    StopSearch,
    SkipToNext,
    EndCall,
    SendChat(String),
    ToggleVideo,
    ToggleAudio,
    ToggleRemoteAudioMute,
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running controller
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
}

impl ControllerHandle {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("controller already stopped");
        }
    }

    pub fn start_search(&self) {
        self.send(Command::StartSearch);
    }

    pub fn stop_search(&self) {
        self.send(Command::StopSearch);
    }

    pub fn skip_to_next(&self) {
        self.send(Command::SkipToNext);
    }

    pub fn end_call(&self) {
        self.send(Command::EndCall);
    }

    pub fn send_chat(&self, text: impl Into<String>) {
        self.send(Command::SendChat(text.into()));
    }

    pub fn toggle_video(&self) {
        self.send(Command::ToggleVideo);
    }

    pub fn toggle_audio(&self) {
        self.send(Command::ToggleAudio);
    }

    pub fn toggle_remote_audio_mute(&self) {
        self.send(Command::ToggleRemoteAudioMute);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Wait until the observed state satisfies `predicate`
    pub async fn wait_for(&self, mut predicate: impl FnMut(&Snapshot) -> bool) -> Snapshot {
        let mut rx = self.snapshot.clone();
        if let Ok(snapshot) = rx.wait_for(|snapshot| predicate(snapshot)).await {
            return snapshot.clone();
        }
        // controller stopped; report the last state it published
        let last = rx.borrow().clone();
        last
    }

    /// Stop searching, release capture and identity, and end the controller
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Outcome of the media + identity preparation for one search episode
struct Prepared {
    episode: u64,
    result: Result<LocalIdentity, ControllerError>,
}

/// One active or attempted pairing
struct Session {
    remote_id: String,
    call: Option<Arc<dyn MediaCall>>,
    call_events: Option<CallWatch>,
    data: Option<Arc<dyn DataLink>>,
    data_events: Option<DataWatch>,
    data_open: bool,
    remote_media: Option<RemoteMedia>,
    started_at: Option<i64>,
    latency_ms: Option<u64>,
}

impl Session {
    fn new(remote_id: &str) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            call: None,
            call_events: None,
            data: None,
            data_events: None,
            data_open: false,
            remote_media: None,
            started_at: None,
            latency_ms: None,
        }
    }
}

enum SessionInput {
    Call(CallEvent),
    Data(DataEvent),
}

/// Next event from the current Session's handles
///
/// Data events are preferred so a control signal is seen before the close
/// of the call it describes.
async fn next_session_event(session: &mut Option<Session>) -> SessionInput {
    let Some(session) = session.as_mut() else {
        return futures::future::pending().await;
    };
    tokio::select! {
        biased;
        Some(event) = next_data(&mut session.data_events) => SessionInput::Data(event),
        Some(event) = next_call(&mut session.call_events) => SessionInput::Call(event),
        else => futures::future::pending().await,
    }
}

async fn next_data(watch: &mut Option<DataWatch>) -> Option<DataEvent> {
    match watch {
        Some(watch) => watch.next().await,
        None => None,
    }
}

async fn next_call(watch: &mut Option<CallWatch>) -> Option<CallEvent> {
    match watch {
        Some(watch) => watch.next().await,
        None => None,
    }
}

async fn prepare(
    media: Arc<MediaGate>,
    adapter: Arc<SessionAdapter>,
    known: Option<LocalIdentity>,
) -> Result<LocalIdentity, ControllerError> {
    media.acquire().await?;
    match known {
        Some(identity) => Ok(identity),
        None => Ok(adapter.init_identity().await?),
    }
}

enum Input {
    Command(Command),
    Session(SessionInput),
    Lobby(LobbyEvent),
    Provider(ProviderEvent),
    Timer(TimerFired),
    Prepared(Prepared),
    /// Every handle was dropped
    Detached,
}

struct Inputs {
    commands: mpsc::UnboundedReceiver<Command>,
    lobby: mpsc::UnboundedReceiver<LobbyEvent>,
    provider: mpsc::UnboundedReceiver<ProviderEvent>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    prepared: mpsc::UnboundedReceiver<Prepared>,
}

/// The lifecycle state machine
pub struct Controller {
    config: ControllerConfig,
    media: Arc<MediaGate>,
    adapter: Arc<SessionAdapter>,
    lobby: RendezvousClient,
    timers: TimerSet,
    state: LifecycleState,
    identity: Option<LocalIdentity>,
    session: Option<Session>,
    /// Inbound data channel that arrived ahead of its call
    parked_data: Option<Arc<dyn DataLink>>,
    episode: u64,
    preparing: bool,
    messages: Vec<ChatMessage>,
    last_error: Option<String>,
    remote_audio_enabled: bool,
    limiter: ChatRateLimiter,
    prepared_tx: mpsc::UnboundedSender<Prepared>,
    snapshot_tx: watch::Sender<Snapshot>,
}

impl Controller {
    /// Start a controller task and return its handle
    pub fn spawn(config: ControllerConfig, collaborators: Collaborators) -> ControllerHandle {
        let (controller, inputs, handle) = Self::new(config, collaborators);
        tokio::spawn(controller.run(inputs));
        handle
    }

    fn new(
        config: ControllerConfig,
        collaborators: Collaborators,
    ) -> (Self, Inputs, ControllerHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let media = Arc::new(MediaGate::new(
            collaborators.capture,
            config.media.clone(),
        ));
        let (adapter, provider_rx) = SessionAdapter::new(
            collaborators.provider,
            collaborators.credentials,
            AdapterConfig {
                identity_timeout: config.identity_timeout,
                fallback_ice_servers: config.fallback_ice_servers.clone(),
            },
        );
        let (lobby, lobby_rx) = RendezvousClient::new(collaborators.lobby, config.lobby.clone());
        let (timers, timers_rx) = TimerSet::new();
        let (prepared_tx, prepared_rx) = mpsc::unbounded_channel();
        let limiter = ChatRateLimiter::new(config.rate_limit_per_sec, Duration::from_secs(1));

        let controller = Controller {
            config,
            media,
            adapter: Arc::new(adapter),
            lobby,
            timers,
            state: LifecycleState::Idle,
            identity: None,
            session: None,
            parked_data: None,
            episode: 0,
            preparing: false,
            messages: Vec::new(),
            last_error: None,
            remote_audio_enabled: true,
            limiter,
            prepared_tx,
            snapshot_tx: watch::channel(Snapshot::default()).0,
        };
        let snapshot_rx = controller.snapshot_tx.subscribe();
        controller.publish();

        let inputs = Inputs {
            commands: commands_rx,
            lobby: lobby_rx,
            provider: provider_rx,
            timers: timers_rx,
            prepared: prepared_rx,
        };
        let handle = ControllerHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
        };
        (controller, inputs, handle)
    }

    async fn run(mut self, mut inputs: Inputs) {
        loop {
            let input = tokio::select! {
                biased;
                command = inputs.commands.recv() => match command {
                    Some(command) => Input::Command(command),
                    None => Input::Detached,
                },
                event = next_session_event(&mut self.session) => Input::Session(event),
                Some(event) = inputs.provider.recv() => Input::Provider(event),
                Some(event) = inputs.lobby.recv() => Input::Lobby(event),
                Some(fired) = inputs.timers.recv() => Input::Timer(fired),
                Some(prepared) = inputs.prepared.recv() => Input::Prepared(prepared),
            };

            match input {
                Input::Command(Command::Shutdown(done)) => {
                    self.teardown().await;
                    self.publish();
                    let _ = done.send(());
                    break;
                }
                Input::Detached => {
                    debug!("all handles dropped");
                    self.teardown().await;
                    break;
                }
                input => self.dispatch(input).await,
            }
            self.publish();
        }
        debug!("controller stopped");
    }

    async fn dispatch(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.on_command(command).await,
            Input::Session(SessionInput::Call(event)) => self.on_call_event(event).await,
            Input::Session(SessionInput::Data(event)) => self.on_data_event(event).await,
            Input::Provider(event) => self.on_provider_event(event).await,
            Input::Lobby(event) => self.on_lobby_event(event).await,
            Input::Timer(fired) => self.on_timer(fired).await,
            Input::Prepared(prepared) => self.on_prepared(prepared).await,
            Input::Detached => {}
        }
    }

    fn publish(&self) {
        let session = self.session.as_ref();
        let next = Snapshot {
            state: self.state,
            local_id: self.identity.as_ref().map(|id| id.to_string()),
            local_media: self.media.handle().map(|h| h.stream_id().to_string()),
            remote_media: session.and_then(|s| s.remote_media.clone()),
            remote_peer: session.map(|s| s.remote_id.clone()),
            messages: self.messages.clone(),
            latency_ms: session.and_then(|s| s.latency_ms),
            call_started_at: session.and_then(|s| s.started_at),
            last_error: self.last_error.clone(),
            initializing: self.preparing,
            video_enabled: self.media.video_enabled(),
            audio_enabled: self.media.audio_enabled(),
            remote_audio_enabled: self.remote_audio_enabled,
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state != next {
            info!("{} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn notice(&mut self, text: &str) {
        self.messages.push(ChatMessage::system(text));
    }

    fn set_error(&mut self, error: ControllerError) {
        debug!(error = %error, "showing error");
        self.last_error = Some(error.to_string());
        self.timers.arm(TimerKind::ErrorClear, self.config.error_display);
    }

    fn clear_error(&mut self) {
        self.last_error = None;
        self.timers.cancel(TimerKind::ErrorClear);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::StartSearch => self.start_search().await,
            Command::StopSearch => self.stop_search().await,
            Command::SkipToNext => self.skip_to_next().await,
            Command::EndCall => self.end_call().await,
            Command::SendChat(text) => self.send_chat(&text).await,
            Command::ToggleVideo => {
                self.media.toggle_video();
            }
            Command::ToggleAudio => {
                self.media.toggle_audio();
            }
            Command::ToggleRemoteAudioMute => {
                self.remote_audio_enabled = !self.remote_audio_enabled;
            }
            // handled by the run loop
            Command::Shutdown(_) => {}
        }
    }

    async fn start_search(&mut self) {
        if !matches!(self.state, LifecycleState::Idle | LifecycleState::Error) {
            debug!(state = %self.state, "already searching");
            return;
        }

        self.close_session().await;
        self.drop_parked().await;
        self.timers.cancel_state_timers();
        self.clear_error();
        self.messages.clear();
        self.lobby.clear_ignored();
        self.episode += 1;
        self.preparing = true;
        self.transition(LifecycleState::Searching);

        let media = self.media.clone();
        let adapter = self.adapter.clone();
        let known = self.identity.clone();
        let tx = self.prepared_tx.clone();
        let episode = self.episode;
        tokio::spawn(async move {
            let result = prepare(media, adapter, known).await;
            let _ = tx.send(Prepared { episode, result });
        });
    }

    async fn stop_search(&mut self) {
        if self.state == LifecycleState::Idle
            && self.session.is_none()
            && !self.lobby.is_joined()
            && !self.preparing
        {
            debug!("already idle");
            return;
        }
        self.preparing = false;
        self.close_with(CloseCause::LocalStop).await;
        self.drop_parked().await;
        self.clear_error();
    }

    async fn end_call(&mut self) {
        if self.session.is_none() {
            self.stop_search().await;
            return;
        }
        self.preparing = false;
        self.close_with(CloseCause::LocalEnd).await;
        self.clear_error();
    }

    async fn skip_to_next(&mut self) {
        if self.session.is_none()
            || !matches!(
                self.state,
                LifecycleState::Connecting | LifecycleState::Connected
            )
        {
            debug!(state = %self.state, "nothing to skip");
            return;
        }
        self.close_with(CloseCause::LocalSkip).await;
    }

    async fn send_chat(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let Some(link) = self.open_data_link() else {
            debug!("chat dropped, no open data channel");
            return;
        };
        if !self.limiter.try_acquire(tokio::time::Instant::now()) {
            self.set_error(ControllerError::RateLimited);
            return;
        }

        let text = truncate_chars(text, self.config.max_message_chars);
        let frame = Frame::Chat { text: text.clone() };
        match link.send(frame.encode()).await {
            Ok(()) => self.messages.push(ChatMessage::new(Origin::Local, text)),
            Err(e) => {
                warn!(error = %e, "chat send failed");
                self.set_error(ControllerError::SendFailed);
            }
        }
    }

    // ------------------------------------------------------------------
    // Search and pairing
    // ------------------------------------------------------------------

    async fn on_prepared(&mut self, prepared: Prepared) {
        if let Ok(identity) = &prepared.result {
            if self.identity.is_none() {
                self.identity = Some(identity.clone());
            }
        }
        if prepared.episode != self.episode || !self.preparing {
            debug!(episode = prepared.episode, "discarding stale preparation");
            return;
        }
        self.preparing = false;

        match prepared.result {
            Ok(identity) => {
                if self.state == LifecycleState::Searching && self.session.is_none() {
                    info!(id = identity.short(), "ready, joining lobby");
                    self.lobby.join(identity.as_str()).await;
                }
            }
            Err(error) => self.enter_error(error).await,
        }
    }

    /// Rejoin the lobby after a Session ended
    async fn resume_search(&mut self) {
        if self.state != LifecycleState::Searching || self.session.is_some() || self.preparing {
            return;
        }
        match self.identity.clone() {
            Some(identity) => {
                debug!("resuming search");
                self.lobby.join(identity.as_str()).await;
            }
            None => {
                self.enter_error(ControllerError::Identity(IdentityError::Closed))
                    .await
            }
        }
    }

    async fn on_lobby_event(&mut self, event: LobbyEvent) {
        match event {
            LobbyEvent::PeerSeen {
                generation,
                peer_id,
                timestamp,
            } => {
                if generation != self.lobby.generation() {
                    return;
                }
                // the beacon may have aged while queued behind a call attempt
                let beacon = PresenceBeacon { peer_id, timestamp };
                if beacon.is_stale(now_ms(), self.config.lobby.staleness_window_ms) {
                    debug!(peer = %beacon.peer_id, "sighting went stale before delivery");
                    return;
                }
                self.on_peer_seen(beacon.peer_id).await;
            }
            LobbyEvent::Unavailable { generation } => {
                if generation == self.lobby.generation()
                    && self.state == LifecycleState::Searching
                {
                    self.enter_error(ControllerError::MatchmakingUnavailable)
                        .await;
                }
            }
        }
    }

    async fn on_peer_seen(&mut self, peer_id: String) {
        if self.state != LifecycleState::Searching
            || self.session.is_some()
            || self.lobby.is_ignored(&peer_id)
        {
            return;
        }
        let Some(identity) = self.identity.clone() else {
            return;
        };
        if peer_id == identity.as_str() {
            return;
        }
        if !should_initiate(identity.as_str(), &peer_id) {
            debug!(peer = %peer_id, "peer seen, waiting for its call");
            return;
        }
        self.initiate(peer_id).await;
    }

    async fn initiate(&mut self, remote_id: String) {
        let Some(capture) = self.media.handle() else {
            warn!("no local capture, cannot place call");
            return;
        };

        self.lobby.leave().await;
        self.lobby.ignore(&remote_id);
        self.drop_parked().await;
        self.transition(LifecycleState::Connecting);
        self.begin_session(&remote_id).await;
        info!(peer = %remote_id, "calling peer");

        match self.adapter.call(&remote_id, &capture).await {
            Ok(call) => self.attach_call(call),
            Err(e) => {
                warn!(peer = %remote_id, error = %e, "call failed");
                self.close_with(cause_for(&e)).await;
                return;
            }
        }
        match self.adapter.connect_data(&remote_id).await {
            Ok(link) => self.attach_data(link),
            Err(e) => {
                warn!(peer = %remote_id, error = %e, "data channel failed");
                self.close_with(cause_for(&e)).await;
                return;
            }
        }

        self.timers.arm(
            TimerKind::ConnectionAttempt,
            self.config.connection_attempt_timeout,
        );
        self.timers.arm(
            TimerKind::StreamHandshake,
            self.config.stream_handshake_timeout,
        );
    }

    async fn on_incoming_call(&mut self, call: Arc<dyn MediaCall>) {
        let remote_id = call.remote_id().to_string();
        let willing = match self.state {
            LifecycleState::Searching => true,
            LifecycleState::Idle => self.config.accept_calls_while_idle,
            _ => false,
        };
        let capture = self.media.handle();

        let accept = willing
            && self.session.is_none()
            && self.identity.is_some()
            && !self.lobby.is_ignored(&remote_id);
        let Some(capture) = capture.filter(|_| accept) else {
            debug!(peer = %remote_id, state = %self.state, "rejecting incoming call");
            call.close().await;
            if self
                .parked_data
                .as_ref()
                .is_some_and(|link| link.remote_id() == remote_id)
            {
                self.drop_parked().await;
            }
            return;
        };

        info!(peer = %remote_id, "answering incoming call");
        self.preparing = false;
        self.lobby.leave().await;
        self.lobby.ignore(&remote_id);
        self.transition(LifecycleState::Connecting);
        self.begin_session(&remote_id).await;
        self.attach_call(call.clone());
        if let Some(link) = self.parked_data.take() {
            if link.remote_id() == remote_id {
                self.attach_data(link);
            } else {
                link.close().await;
            }
        }

        if let Err(e) = call.answer(&capture).await {
            warn!(peer = %remote_id, error = %e, "answer failed");
            self.close_with(CloseCause::SessionFailed).await;
            return;
        }
        self.timers.arm(
            TimerKind::StreamHandshake,
            self.config.stream_handshake_timeout,
        );
    }

    async fn on_incoming_data(&mut self, link: Arc<dyn DataLink>) {
        let remote_id = link.remote_id().to_string();
        let attachable = self
            .session
            .as_ref()
            .map(|s| s.remote_id == remote_id && s.data.is_none());
        if let Some(attachable) = attachable {
            if attachable {
                self.attach_data(link);
            } else {
                debug!(peer = %remote_id, "rejecting data channel, busy");
                link.close().await;
            }
            return;
        }
        if matches!(
            self.state,
            LifecycleState::Searching | LifecycleState::Idle
        ) {
            debug!(peer = %remote_id, "parking data channel until its call arrives");
            if let Some(previous) = self.parked_data.replace(link) {
                previous.close().await;
            }
            return;
        }
        link.close().await;
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    async fn begin_session(&mut self, remote_id: &str) {
        // at most one Session at a time
        self.close_session().await;
        self.session = Some(Session::new(remote_id));
    }

    fn attach_call(&mut self, call: Arc<dyn MediaCall>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.call_events = CallWatch::new(call.as_ref());
        if session.call_events.is_none() {
            warn!(peer = %session.remote_id, "call events already taken");
        }
        session.call = Some(call);
    }

    fn attach_data(&mut self, link: Arc<dyn DataLink>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.data_events = DataWatch::new(link.as_ref());
        if session.data_events.is_none() {
            warn!(peer = %session.remote_id, "data events already taken");
        }
        session.data = Some(link);
    }

    async fn close_session(&mut self) {
        self.timers.cancel(TimerKind::Ping);
        let Some(session) = self.session.take() else {
            return;
        };
        // discard the watches first so the closes below are not reported back
        drop(session.call_events);
        drop(session.data_events);
        if let Some(call) = session.call {
            call.close().await;
        }
        if let Some(link) = session.data {
            link.close().await;
        }
        debug!(peer = %session.remote_id, "session closed");
    }

    async fn drop_parked(&mut self) {
        if let Some(link) = self.parked_data.take() {
            link.close().await;
        }
    }

    fn open_data_link(&self) -> Option<Arc<dyn DataLink>> {
        self.session
            .as_ref()
            .filter(|s| s.data_open)
            .and_then(|s| s.data.clone())
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), SessionError> {
        let link = self.open_data_link().ok_or(SessionError::NotOpen)?;
        link.send(frame.encode()).await
    }

    /// End the current Session for `cause` and move to the decided state
    async fn close_with(&mut self, cause: CloseCause) {
        let outcome = on_close(self.state, cause, &self.config.close_policy);
        debug!(?cause, next = %outcome.next, resume = outcome.resume, "closing session");

        if let Some(kind) = outcome.signal {
            if let Err(e) = self.send_frame(&Frame::Signal { kind }).await {
                debug!(error = %e, ?kind, "signal not delivered");
            }
        }
        self.close_session().await;
        self.timers.cancel_state_timers();
        if outcome.next != LifecycleState::Searching {
            self.lobby.leave().await;
        }
        if let Some(text) = outcome.notice {
            self.notice(text);
        }
        if let Some(error) = outcome.error {
            self.set_error(error);
        }
        self.transition(outcome.next);
        if outcome.resume {
            self.timers.arm(TimerKind::Settle, self.config.settle_delay);
        }
    }

    async fn enter_error(&mut self, error: ControllerError) {
        warn!(error = %error, "lifecycle error");
        self.preparing = false;
        self.lobby.leave().await;
        self.close_session().await;
        self.timers.cancel_state_timers();
        self.set_error(error);
        self.transition(LifecycleState::Error);
    }

    async fn on_call_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::RemoteStream(media) => {
                if self.state != LifecycleState::Connecting {
                    return;
                }
                self.timers.cancel_state_timers();
                if let Some(session) = self.session.as_mut() {
                    info!(peer = %session.remote_id, stream = %media.stream_id, "remote media arrived");
                    session.remote_media = Some(media);
                    session.started_at = Some(now_ms());
                }
                self.remote_audio_enabled = true;
                self.clear_error();
                self.transition(LifecycleState::Connected);
            }
            CallEvent::Close => self.close_with(CloseCause::SessionClosed).await,
            CallEvent::Error(message) => {
                warn!(error = %message, "call error");
                self.close_with(CloseCause::SessionFailed).await;
            }
        }
    }

    async fn on_data_event(&mut self, event: DataEvent) {
        match event {
            DataEvent::Open => {
                if let Some(session) = self.session.as_mut() {
                    debug!(peer = %session.remote_id, "data channel open");
                    session.data_open = true;
                    self.timers.arm(TimerKind::Ping, self.config.ping_interval);
                }
            }
            DataEvent::Message(bytes) => {
                if let Some(frame) = Frame::parse(&bytes) {
                    self.on_frame(frame).await;
                }
            }
            DataEvent::Close => self.data_gone(),
            DataEvent::Error(message) => {
                debug!(error = %message, "data channel error");
                self.data_gone();
            }
        }
    }

    /// The call governs the Session; losing chat only stops the probes
    fn data_gone(&mut self) {
        self.timers.cancel(TimerKind::Ping);
        if let Some(session) = self.session.as_mut() {
            session.data_open = false;
            session.latency_ms = None;
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Chat { text } => {
                let text = truncate_chars(&text, self.config.max_message_chars);
                self.messages.push(ChatMessage::new(Origin::Peer, text));
            }
            Frame::Ping { timestamp } => {
                if let Err(e) = self.send_frame(&Frame::Pong { timestamp }).await {
                    debug!(error = %e, "pong not sent");
                }
            }
            Frame::Pong { timestamp } => {
                if let Some(rtt) = rtt_sample(now_ms(), timestamp, self.config.max_rtt_ms) {
                    if let Some(session) = self.session.as_mut() {
                        session.latency_ms = Some(rtt);
                    }
                }
            }
            Frame::Signal { kind } => {
                info!(?kind, "remote signal");
                let cause = match kind {
                    SignalKind::Skip => CloseCause::RemoteSkip,
                    SignalKind::Disconnect => CloseCause::RemoteDisconnect,
                    SignalKind::End => CloseCause::RemoteEnd,
                };
                self.close_with(cause).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Provider and timers
    // ------------------------------------------------------------------

    async fn on_provider_event(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::IncomingCall(call) => self.on_incoming_call(call).await,
            ProviderEvent::IncomingData(link) => self.on_incoming_data(link).await,
            ProviderEvent::Disconnected => {
                let adapter = self.adapter.clone();
                tokio::spawn(async move { adapter.reconnect_identity().await });
            }
            ProviderEvent::Closed => {
                warn!("session identity closed");
                self.identity = None;
                if !self.preparing
                    && matches!(
                        self.state,
                        LifecycleState::Searching | LifecycleState::Connecting
                    )
                {
                    self.enter_error(ControllerError::Identity(IdentityError::Closed))
                        .await;
                }
            }
            ProviderEvent::Error(kind) => self.on_provider_error(kind).await,
        }
    }

    async fn on_provider_error(&mut self, kind: ProviderErrorKind) {
        match kind {
            ProviderErrorKind::PeerUnavailable(peer) => {
                let current = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.remote_id == peer);
                if current && self.state == LifecycleState::Connecting {
                    info!(peer = %peer, "peer unavailable");
                    self.close_with(CloseCause::PeerUnavailable).await;
                }
            }
            ProviderErrorKind::Network | ProviderErrorKind::Server => {
                if self.session.is_some() {
                    self.close_with(CloseCause::NetworkLost).await;
                } else {
                    self.set_error(ControllerError::NetworkLost);
                }
            }
            ProviderErrorKind::Incompatible => {
                self.enter_error(ControllerError::Incompatible).await;
            }
            ProviderErrorKind::Other(message) => {
                warn!(error = %message, "provider error");
            }
        }
    }

    async fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(fired) {
            return;
        }
        match fired.kind {
            TimerKind::StreamHandshake => {
                if self.state == LifecycleState::Connecting {
                    info!("stream handshake timed out");
                    self.close_with(CloseCause::HandshakeTimeout).await;
                }
            }
            TimerKind::ConnectionAttempt => {
                if self.state == LifecycleState::Connecting {
                    info!("connection attempt timed out");
                    self.close_with(CloseCause::AttemptTimeout).await;
                }
            }
            TimerKind::Settle => self.resume_search().await,
            TimerKind::Ping => {
                if self.open_data_link().is_some() {
                    let ping = Frame::Ping {
                        timestamp: now_ms(),
                    };
                    if let Err(e) = self.send_frame(&ping).await {
                        debug!(error = %e, "ping not sent");
                    }
                    self.timers.arm(TimerKind::Ping, self.config.ping_interval);
                }
            }
            TimerKind::ErrorClear => self.last_error = None,
        }
    }

    /// Stop everything and release capture and identity
    async fn teardown(&mut self) {
        info!("shutting down");
        self.preparing = false;
        if self.session.is_some() || self.state != LifecycleState::Idle {
            self.close_with(CloseCause::LocalStop).await;
        }
        self.lobby.leave().await;
        self.drop_parked().await;
        self.timers.cancel_all();
        self.last_error = None;
        self.media.release();
        self.adapter.destroy().await;
        self.identity = None;
    }
}

fn cause_for(error: &SessionError) -> CloseCause {
    match error {
        SessionError::PeerUnavailable(_) => CloseCause::PeerUnavailable,
        _ => CloseCause::SessionFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBroker, MockCaptureDevice, MockNetwork, MockProvider};

    struct Client {
        handle: ControllerHandle,
        provider: Arc<MockProvider>,
        device: Arc<MockCaptureDevice>,
    }

    fn client(network: &MockNetwork, broker: &MockBroker, id: &str) -> Client {
        client_with(network, broker, id, ControllerConfig::default())
    }

    fn client_with(
        network: &MockNetwork,
        broker: &MockBroker,
        id: &str,
        config: ControllerConfig,
    ) -> Client {
        let provider = Arc::new(MockProvider::with_id(network, id));
        let device = Arc::new(MockCaptureDevice::new());
        let handle = Controller::spawn(
            config,
            Collaborators {
                provider: provider.clone(),
                lobby: Arc::new(broker.transport()),
                capture: device.clone(),
                credentials: None,
            },
        );
        Client {
            handle,
            provider,
            device,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_snapshot() {
        let c = client(&MockNetwork::new(), &MockBroker::new(), "a");
        let snapshot = c.handle.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Idle);
        assert!(snapshot.video_enabled);
        assert!(snapshot.audio_enabled);
        assert!(snapshot.remote_audio_enabled);
        assert!(snapshot.local_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_denied_enters_error() {
        let network = MockNetwork::new();
        let broker = MockBroker::new();
        let provider = Arc::new(MockProvider::with_id(&network, "a"));
        let handle = Controller::spawn(
            ControllerConfig::default(),
            Collaborators {
                provider: provider.clone(),
                lobby: Arc::new(broker.transport()),
                capture: Arc::new(MockCaptureDevice::failing(MediaError::DeviceDenied)),
                credentials: None,
            },
        );

        handle.start_search();
        let snapshot = handle
            .wait_for(|s| s.state == LifecycleState::Error)
            .await;
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some(MediaError::DeviceDenied.to_string().as_str())
        );
        // identity is never requested after a device failure
        assert_eq!(provider.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_failure_enters_error_and_retries_on_next_start() {
        let network = MockNetwork::new();
        let broker = MockBroker::new();
        let c = client(&network, &broker, "a");
        c.provider
            .fail_open(IdentityError::Server("unavailable-id".to_string()));

        c.handle.start_search();
        c.handle
            .wait_for(|s| s.state == LifecycleState::Error)
            .await;
        assert_eq!(c.provider.open_count(), 1);

        c.handle.start_search();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(c.handle.snapshot().state, LifecycleState::Error);
        assert_eq!(c.provider.open_count(), 2);
        // capture was kept, so the device was prompted only once
        assert_eq!(c.device.prompt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_auto_clears() {
        let broker = MockBroker::new();
        broker.set_available(false);
        let c = client(&MockNetwork::new(), &broker, "a");

        c.handle.start_search();
        let snapshot = c
            .handle
            .wait_for(|s| s.state == LifecycleState::Error)
            .await;
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some(ControllerError::MatchmakingUnavailable.to_string().as_str())
        );

        let started = tokio::time::Instant::now();
        let snapshot = c.handle.wait_for(|s| s.last_error.is_none()).await;
        assert!(started.elapsed() <= Duration::from_secs(5));
        assert!(started.elapsed() >= Duration::from_secs(4));
        // the state stays ERROR until the user starts again
        assert_eq!(snapshot.state, LifecycleState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_before_search_are_applied_on_acquire() {
        let network = MockNetwork::new();
        let broker = MockBroker::new();
        let c = client(&network, &broker, "a");

        c.handle.toggle_video();
        c.handle.toggle_remote_audio_mute();
        c.handle
            .wait_for(|s| !s.video_enabled && !s.remote_audio_enabled)
            .await;

        c.handle.start_search();
        c.handle.wait_for(|s| s.local_media.is_some()).await;
        let capture = c.device.last_capture().unwrap();
        assert!(!capture.video_enabled());
        assert!(capture.audio_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_closed_is_reinitialised() {
        let network = MockNetwork::new();
        let broker = MockBroker::new();
        let c = client(&network, &broker, "a");

        c.handle.start_search();
        c.handle
            .wait_for(|s| s.local_id.is_some() && !s.initializing)
            .await;

        c.provider.emit(ProviderEvent::Closed);
        c.handle
            .wait_for(|s| s.state == LifecycleState::Error)
            .await;

        c.handle.start_search();
        c.handle
            .wait_for(|s| s.state == LifecycleState::Searching && !s.initializing)
            .await;
        assert_eq!(c.provider.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_identity_reconnects() {
        let network = MockNetwork::new();
        let broker = MockBroker::new();
        let c = client(&network, &broker, "a");

        c.handle.start_search();
        c.handle
            .wait_for(|s| s.local_id.is_some() && !s.initializing)
            .await;
        c.provider.emit(ProviderEvent::Disconnected);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(c.provider.reconnect_count(), 1);
        assert_eq!(c.handle.snapshot().state, LifecycleState::Searching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_capture() {
        let network = MockNetwork::new();
        let broker = MockBroker::new();
        let c = client(&network, &broker, "a");

        c.handle.start_search();
        c.handle
            .wait_for(|s| s.local_media.is_some() && !s.initializing)
            .await;
        assert!(network.is_registered("a"));

        c.handle.shutdown().await;
        assert!(c.device.last_capture().unwrap().is_stopped());
        assert!(!network.is_registered("a"));
        assert_eq!(c.handle.snapshot().state, LifecycleState::Idle);
    }

    /// A controller that is searching as `id` but not running its loop
    async fn searching(network: &MockNetwork, id: &str) -> (Controller, Inputs, ControllerHandle) {
        let broker = MockBroker::new();
        let (mut controller, inputs, handle) = Controller::new(
            ControllerConfig::default(),
            Collaborators {
                provider: Arc::new(MockProvider::with_id(network, id)),
                lobby: Arc::new(broker.transport()),
                capture: Arc::new(MockCaptureDevice::new()),
                credentials: None,
            },
        );
        controller.media.acquire().await.unwrap();
        controller.identity = Some(LocalIdentity::new(id));
        controller.state = LifecycleState::Searching;
        (controller, inputs, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sighting_aged_in_queue_is_ignored() {
        let network = MockNetwork::new();
        let (mut controller, _inputs, _handle) = searching(&network, "b").await;

        let generation = controller.lobby.generation();
        controller
            .on_lobby_event(LobbyEvent::PeerSeen {
                generation,
                peer_id: "a".to_string(),
                timestamp: now_ms() - 5000,
            })
            .await;
        assert_eq!(controller.state, LifecycleState::Searching);
        assert!(controller.session.is_none());

        controller
            .on_lobby_event(LobbyEvent::PeerSeen {
                generation,
                peer_id: "a".to_string(),
                timestamp: now_ms(),
            })
            .await;
        assert_eq!(controller.state, LifecycleState::Connecting);
        assert_eq!(
            controller.session.as_ref().map(|s| s.remote_id.as_str()),
            Some("a")
        );
    }
}
