//! Shared types for the pairing core
//!
//! Identities, presence beacons, chat log entries and the lifecycle state
//! observed by the UI collaborator.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, the clock used on the wire
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Address assigned to this client by the session provider
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalIdentity(String);

impl LocalIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for logs
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broadcast announcing "I am searching now"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceBeacon {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    /// Sender clock, ms since epoch
    pub timestamp: i64,
}

impl PresenceBeacon {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            timestamp: now_ms(),
        }
    }

    /// Stale once `now - timestamp` exceeds the window
    pub fn is_stale(&self, now: i64, window_ms: u64) -> bool {
        now.saturating_sub(self.timestamp) > window_ms as i64
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a lobby payload, `None` for anything that is not a beacon
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let beacon: Self = serde_json::from_slice(payload).ok()?;
        if beacon.peer_id.is_empty() {
            return None;
        }
        Some(beacon)
    }
}

/// Controller phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleState {
    #[default]
    Idle,
    Searching,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "IDLE"),
            LifecycleState::Searching => write!(f, "SEARCHING"),
            LifecycleState::Connecting => write!(f, "CONNECTING"),
            LifecycleState::Connected => write!(f, "CONNECTED"),
            LifecycleState::Error => write!(f, "ERROR"),
        }
    }
}

/// Who produced a chat log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[serde(rename = "self")]
    Local,
    Peer,
    System,
}

/// One immutable line of the message log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub origin: Origin,
    pub text: String,
    pub timestamp: i64,
}

impl ChatMessage {
    pub fn new(origin: Origin, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin,
            text: text.into(),
            timestamp: now_ms(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Origin::System, text)
    }
}

/// Handle for media received from the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub stream_id: String,
}

impl RemoteMedia {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_wire_format() {
        let beacon = PresenceBeacon {
            peer_id: "abc".to_string(),
            timestamp: 1_700_000_000_000,
        };
        let json = String::from_utf8(beacon.encode()).unwrap();
        assert!(json.contains("\"peerId\":\"abc\""));
        assert!(json.contains("\"timestamp\":1700000000000"));
    }

    #[test]
    fn test_beacon_decode_rejects_malformed() {
        assert!(PresenceBeacon::decode(b"not json").is_none());
        assert!(PresenceBeacon::decode(br#"{"peerId":42,"timestamp":1}"#).is_none());
        assert!(PresenceBeacon::decode(br#"{"peerId":"x"}"#).is_none());
        assert!(PresenceBeacon::decode(br#"{"peerId":"","timestamp":1}"#).is_none());
        assert!(PresenceBeacon::decode(br#"{"peerId":"x","timestamp":"soon"}"#).is_none());
    }

    #[test]
    fn test_beacon_staleness_boundary() {
        let beacon = PresenceBeacon {
            peer_id: "p".to_string(),
            timestamp: 10_000,
        };
        assert!(!beacon.is_stale(13_000, 3000));
        assert!(beacon.is_stale(13_001, 3000));
        // clock skew into the future is not stale
        assert!(!beacon.is_stale(9_000, 3000));
    }

    #[test]
    fn test_origin_serializes_like_wire() {
        assert_eq!(serde_json::to_string(&Origin::Local).unwrap(), "\"self\"");
        assert_eq!(serde_json::to_string(&Origin::Peer).unwrap(), "\"peer\"");
        assert_eq!(serde_json::to_string(&Origin::System).unwrap(), "\"system\"");
    }

    #[test]
    fn test_lifecycle_display() {
        assert_eq!(LifecycleState::Searching.to_string(), "SEARCHING");
        assert_eq!(LifecycleState::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_identity_short() {
        let id = LocalIdentity::new("0123456789abcdef");
        assert_eq!(id.short(), "01234567");
        assert_eq!(LocalIdentity::new("ab").short(), "ab");
    }
}
