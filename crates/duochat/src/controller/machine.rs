//! Session close decisions
//!
//! Every way a Session can end is named by a [`CloseCause`]. The next state,
//! whether the search resumes, and what the user is told are a pure function
//! of the current state, the cause and the configured policy.

use duochat_config::HandshakeTimeoutPolicy;

use super::ControllerError;
use crate::protocol::SignalKind;
use crate::types::LifecycleState;

pub const NOTICE_SKIPPED: &str = "Skipped to next person.";
pub const NOTICE_REMOTE_SKIPPED: &str = "Stranger skipped.";
pub const NOTICE_REMOTE_DISCONNECTED: &str = "Stranger disconnected.";
pub const NOTICE_REMOTE_ENDED: &str = "Stranger ended the chat.";
pub const NOTICE_CONNECT_FAILED_RESUMING: &str = "Connection failed. Searching for next peer...";
pub const NOTICE_CONNECT_FAILED: &str = "Connection failed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Local `skip_to_next`
    LocalSkip,
    /// Local `end_call`
    LocalEnd,
    /// Local `stop_search` or teardown
    LocalStop,
    RemoteSkip,
    RemoteDisconnect,
    RemoteEnd,
    HandshakeTimeout,
    AttemptTimeout,
    /// Media call closed without a preceding signal
    SessionClosed,
    /// Media call or setup failed
    SessionFailed,
    PeerUnavailable,
    NetworkLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosePolicy {
    pub handshake_timeout: HandshakeTimeoutPolicy,
    pub auto_resume_on_drop: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOutcome {
    pub next: LifecycleState,
    /// Rejoin the lobby once the settle delay has passed
    pub resume: bool,
    /// Control signal to send before closing
    pub signal: Option<SignalKind>,
    pub notice: Option<&'static str>,
    pub error: Option<ControllerError>,
}

impl CloseOutcome {
    fn resume() -> Self {
        Self {
            next: LifecycleState::Searching,
            resume: true,
            signal: None,
            notice: None,
            error: None,
        }
    }

    fn idle() -> Self {
        Self {
            next: LifecycleState::Idle,
            resume: false,
            signal: None,
            notice: None,
            error: None,
        }
    }

    fn signal(mut self, kind: SignalKind) -> Self {
        self.signal = Some(kind);
        self
    }

    fn notice(mut self, text: &'static str) -> Self {
        self.notice = Some(text);
        self
    }

    fn error(mut self, error: ControllerError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Decide what closing the Session for `cause` while in `state` leads to
pub fn on_close(state: LifecycleState, cause: CloseCause, policy: &ClosePolicy) -> CloseOutcome {
    let connected = state == LifecycleState::Connected;
    // A drop the local side did not ask for resumes unless the user opted out
    let dropped = || {
        if policy.auto_resume_on_drop {
            CloseOutcome::resume()
        } else {
            CloseOutcome::idle()
        }
    };

    match cause {
        CloseCause::LocalSkip => CloseOutcome::resume()
            .signal(SignalKind::Skip)
            .notice(NOTICE_SKIPPED),
        CloseCause::LocalEnd => CloseOutcome::idle().signal(SignalKind::End),
        CloseCause::LocalStop => CloseOutcome::idle().signal(SignalKind::Disconnect),
        CloseCause::RemoteSkip => CloseOutcome::resume().notice(NOTICE_REMOTE_SKIPPED),
        CloseCause::RemoteDisconnect => CloseOutcome::resume().notice(NOTICE_REMOTE_DISCONNECTED),
        CloseCause::RemoteEnd => CloseOutcome::idle().notice(NOTICE_REMOTE_ENDED),
        CloseCause::HandshakeTimeout => match policy.handshake_timeout {
            HandshakeTimeoutPolicy::Resume => {
                CloseOutcome::resume().notice(NOTICE_CONNECT_FAILED_RESUMING)
            }
            HandshakeTimeoutPolicy::Idle => CloseOutcome::idle().notice(NOTICE_CONNECT_FAILED),
        },
        CloseCause::AttemptTimeout => {
            CloseOutcome::resume().notice(NOTICE_CONNECT_FAILED_RESUMING)
        }
        CloseCause::SessionClosed if connected => dropped().notice(NOTICE_REMOTE_DISCONNECTED),
        CloseCause::SessionClosed => {
            CloseOutcome::resume().notice(NOTICE_CONNECT_FAILED_RESUMING)
        }
        CloseCause::SessionFailed if connected => dropped()
            .notice(NOTICE_REMOTE_DISCONNECTED)
            .error(ControllerError::CallFailed),
        CloseCause::SessionFailed => CloseOutcome::resume().error(ControllerError::CallFailed),
        CloseCause::PeerUnavailable => {
            CloseOutcome::resume().error(ControllerError::PeerUnreachable)
        }
        CloseCause::NetworkLost if connected => dropped()
            .notice(NOTICE_REMOTE_DISCONNECTED)
            .error(ControllerError::NetworkLost),
        CloseCause::NetworkLost => CloseOutcome::resume().error(ControllerError::NetworkLost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESUMING: ClosePolicy = ClosePolicy {
        handshake_timeout: HandshakeTimeoutPolicy::Resume,
        auto_resume_on_drop: true,
    };

    const STAYING: ClosePolicy = ClosePolicy {
        handshake_timeout: HandshakeTimeoutPolicy::Idle,
        auto_resume_on_drop: false,
    };

    #[test]
    fn test_local_end_and_stop_never_resume() {
        for policy in [RESUMING, STAYING] {
            for state in [LifecycleState::Connecting, LifecycleState::Connected] {
                let end = on_close(state, CloseCause::LocalEnd, &policy);
                assert_eq!(end.next, LifecycleState::Idle);
                assert!(!end.resume);
                assert_eq!(end.signal, Some(SignalKind::End));

                let stop = on_close(state, CloseCause::LocalStop, &policy);
                assert_eq!(stop.next, LifecycleState::Idle);
                assert_eq!(stop.signal, Some(SignalKind::Disconnect));
            }
        }
    }

    #[test]
    fn test_remote_signals() {
        let skip = on_close(LifecycleState::Connected, CloseCause::RemoteSkip, &STAYING);
        assert_eq!(skip.next, LifecycleState::Searching);
        assert!(skip.resume);

        let disconnect = on_close(
            LifecycleState::Connected,
            CloseCause::RemoteDisconnect,
            &STAYING,
        );
        assert_eq!(disconnect.next, LifecycleState::Searching);
        assert_eq!(disconnect.notice, Some(NOTICE_REMOTE_DISCONNECTED));

        let end = on_close(LifecycleState::Connected, CloseCause::RemoteEnd, &RESUMING);
        assert_eq!(end.next, LifecycleState::Idle);
        assert!(!end.resume);
        assert_eq!(end.signal, None);
    }

    #[test]
    fn test_local_skip_signals_and_notes() {
        let outcome = on_close(LifecycleState::Connected, CloseCause::LocalSkip, &STAYING);
        assert_eq!(outcome.next, LifecycleState::Searching);
        assert!(outcome.resume);
        assert_eq!(outcome.signal, Some(SignalKind::Skip));
        assert_eq!(outcome.notice, Some(NOTICE_SKIPPED));
    }

    #[test]
    fn test_handshake_timeout_follows_policy() {
        let resume = on_close(
            LifecycleState::Connecting,
            CloseCause::HandshakeTimeout,
            &RESUMING,
        );
        assert_eq!(resume.next, LifecycleState::Searching);
        assert_eq!(resume.notice, Some(NOTICE_CONNECT_FAILED_RESUMING));

        let idle = on_close(
            LifecycleState::Connecting,
            CloseCause::HandshakeTimeout,
            &STAYING,
        );
        assert_eq!(idle.next, LifecycleState::Idle);
        assert!(!idle.resume);
    }

    #[test]
    fn test_unrequested_drop_follows_auto_resume() {
        let resumed = on_close(
            LifecycleState::Connected,
            CloseCause::SessionClosed,
            &RESUMING,
        );
        assert_eq!(resumed.next, LifecycleState::Searching);
        assert!(resumed.resume);

        let stayed = on_close(
            LifecycleState::Connected,
            CloseCause::SessionClosed,
            &STAYING,
        );
        assert_eq!(stayed.next, LifecycleState::Idle);
        assert_eq!(stayed.notice, Some(NOTICE_REMOTE_DISCONNECTED));

        // a failed attempt always moves on to the next peer
        let attempt = on_close(
            LifecycleState::Connecting,
            CloseCause::SessionFailed,
            &STAYING,
        );
        assert_eq!(attempt.next, LifecycleState::Searching);
        assert_eq!(attempt.error, Some(ControllerError::CallFailed));
    }

    #[test]
    fn test_network_loss_reports_error() {
        let outcome = on_close(
            LifecycleState::Connected,
            CloseCause::NetworkLost,
            &RESUMING,
        );
        assert_eq!(outcome.error, Some(ControllerError::NetworkLost));
        assert_eq!(outcome.next, LifecycleState::Searching);
    }
}
