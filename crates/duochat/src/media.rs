//! Local capture gate
//!
//! Owns at most one capture handle. Enable/disable toggles are remembered
//! as desired flags so they survive until a handle exists.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use duochat_config::MediaConfig;

/// Capture acquisition failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Camera/microphone permission denied. Please allow access and try again.")]
    DeviceDenied,
    #[error("No camera or microphone found. Please connect a device.")]
    DeviceNotFound,
    #[error("Camera/microphone is already in use by another application.")]
    DeviceBusy,
    #[error("Camera does not meet the required specifications.")]
    ConstraintsUnsatisfiable,
    #[error("This platform does not support camera/microphone access.")]
    Unsupported,
}

/// Requested capture characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub ideal_frame_rate: u32,
    pub max_frame_rate: u32,
    pub facing_mode: String,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl From<&MediaConfig> for MediaConstraints {
    fn from(config: &MediaConfig) -> Self {
        Self {
            ideal_width: config.ideal_width,
            ideal_height: config.ideal_height,
            max_width: config.max_width,
            max_height: config.max_height,
            ideal_frame_rate: config.ideal_frame_rate,
            max_frame_rate: config.max_frame_rate,
            facing_mode: config.facing_mode.clone(),
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
            auto_gain_control: config.auto_gain_control,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::from(&MediaConfig::default())
    }
}

/// Live tracks produced by a capture device
pub trait CaptureSource: Send + Sync {
    /// Stable identifier of the captured stream
    fn stream_id(&self) -> &str;

    fn set_video_enabled(&self, enabled: bool);

    fn set_audio_enabled(&self, enabled: bool);

    /// Stop every track; the source is unusable afterwards
    fn stop(&self);
}

/// Platform capture API
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn CaptureSource>, MediaError>;
}

/// Cheap clonable reference to the held capture source
#[derive(Clone)]
pub struct CaptureHandle {
    source: Arc<dyn CaptureSource>,
}

impl CaptureHandle {
    pub fn stream_id(&self) -> &str {
        self.source.stream_id()
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("stream_id", &self.stream_id())
            .finish()
    }
}

struct GateState {
    handle: Option<CaptureHandle>,
    video_desired: bool,
    audio_desired: bool,
}

/// Acquires and releases the local capture handle
pub struct MediaGate {
    device: Arc<dyn CaptureDevice>,
    constraints: MediaConstraints,
    state: Mutex<GateState>,
    /// Serializes device prompts so concurrent callers share one handle
    acquiring: tokio::sync::Mutex<()>,
}

impl MediaGate {
    pub fn new(device: Arc<dyn CaptureDevice>, constraints: MediaConstraints) -> Self {
        Self {
            device,
            constraints,
            state: Mutex::new(GateState {
                handle: None,
                video_desired: true,
                audio_desired: true,
            }),
            acquiring: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Currently held handle, if any
    pub fn handle(&self) -> Option<CaptureHandle> {
        self.lock().handle.clone()
    }

    /// Acquire the capture devices, reusing the held handle when present
    pub async fn acquire(&self) -> Result<CaptureHandle, MediaError> {
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }

        let _prompt = self.acquiring.lock().await;
        // Another caller may have finished while we waited
        if let Some(handle) = self.handle() {
            return Ok(handle);
        }

        let source = self.device.acquire(&self.constraints).await.map_err(|e| {
            warn!(error = %e, "capture acquisition failed");
            e
        })?;

        let mut state = self.lock();
        source.set_video_enabled(state.video_desired);
        source.set_audio_enabled(state.audio_desired);
        let handle = CaptureHandle { source };
        info!(stream = handle.stream_id(), "local capture ready");
        state.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Flip the desired video flag; returns the new value
    pub fn toggle_video(&self) -> bool {
        let mut state = self.lock();
        state.video_desired = !state.video_desired;
        if let Some(handle) = &state.handle {
            handle.source.set_video_enabled(state.video_desired);
        }
        debug!(enabled = state.video_desired, "video toggled");
        state.video_desired
    }

    /// Flip the desired audio flag; returns the new value
    pub fn toggle_audio(&self) -> bool {
        let mut state = self.lock();
        state.audio_desired = !state.audio_desired;
        if let Some(handle) = &state.handle {
            handle.source.set_audio_enabled(state.audio_desired);
        }
        debug!(enabled = state.audio_desired, "audio toggled");
        state.audio_desired
    }

    pub fn video_enabled(&self) -> bool {
        self.lock().video_desired
    }

    pub fn audio_enabled(&self) -> bool {
        self.lock().audio_desired
    }

    /// Stop all tracks and drop the handle
    pub fn release(&self) {
        if let Some(handle) = self.lock().handle.take() {
            handle.source.stop();
            info!(stream = handle.stream_id(), "local capture released");
        }
    }
}
