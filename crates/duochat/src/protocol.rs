//! Data-channel framing
//!
//! JSON objects tagged by `type`:
//! `{"type":"chat","text":..}`, `{"type":"ping","timestamp":..}`,
//! `{"type":"pong","timestamp":..}`, `{"type":"signal","kind":"skip"|"disconnect"|"end"}`.
//! The remote is anonymous and unauthenticated; anything that does not parse
//! is dropped.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Control notification kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Sender moved on to the next stranger
    Skip,
    /// Sender stopped searching or is tearing down
    Disconnect,
    /// Sender ended the call and will not search again
    End,
}

/// One data-channel frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Chat { text: String },
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
    Signal { kind: SignalKind },
}

impl Frame {
    /// Chat frame with text cut to `max_chars` characters
    pub fn chat(text: &str, max_chars: usize) -> Self {
        Frame::Chat {
            text: truncate_chars(text, max_chars),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parse a received payload
    pub fn parse(data: &[u8]) -> Option<Self> {
        match serde_json::from_slice(data) {
            Ok(frame) => Some(frame),
            Err(e) => {
                trace!(error = %e, len = data.len(), "dropping malformed frame");
                None
            }
        }
    }
}

/// Cut to at most `max_chars` characters without splitting one
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// RTT for a pong echoing `sent_ms`, `None` unless `0 <= rtt < max_rtt_ms`
pub fn rtt_sample(now_ms: i64, sent_ms: i64, max_rtt_ms: u64) -> Option<u64> {
    let rtt = now_ms.checked_sub(sent_ms)?;
    if rtt < 0 || rtt >= max_rtt_ms as i64 {
        trace!(rtt, "discarding out-of-range rtt");
        return None;
    }
    Some(rtt as u64)
}

/// Sliding-window limiter for outbound chat frames
#[derive(Debug)]
pub struct ChatRateLimiter {
    limit: usize,
    window: Duration,
    sent: VecDeque<Instant>,
}

impl ChatRateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            sent: VecDeque::with_capacity(limit),
        }
    }

    /// Record a send at `now` if the window has room
    ///
    /// Rejected attempts are not recorded.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.sent.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        if self.sent.len() >= self.limit {
            return false;
        }
        self.sent.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shapes() {
        assert_eq!(
            String::from_utf8(Frame::chat("hi", 1000).encode()).unwrap(),
            r#"{"type":"chat","text":"hi"}"#
        );
        assert_eq!(
            String::from_utf8(Frame::Ping { timestamp: 5 }.encode()).unwrap(),
            r#"{"type":"ping","timestamp":5}"#
        );
        assert_eq!(
            String::from_utf8(
                Frame::Signal {
                    kind: SignalKind::Disconnect
                }
                .encode()
            )
            .unwrap(),
            r#"{"type":"signal","kind":"disconnect"}"#
        );
    }

    #[test]
    fn test_parse_known_frames() {
        assert_eq!(
            Frame::parse(br#"{"type":"pong","timestamp":1700000000000}"#),
            Some(Frame::Pong {
                timestamp: 1_700_000_000_000
            })
        );
        assert_eq!(
            Frame::parse(br#"{"type":"signal","kind":"end"}"#),
            Some(Frame::Signal {
                kind: SignalKind::End
            })
        );
    }

    #[test]
    fn test_parse_drops_garbage() {
        assert!(Frame::parse(b"").is_none());
        assert!(Frame::parse(b"hello").is_none());
        assert!(Frame::parse(br#"{"type":"dance"}"#).is_none());
        assert!(Frame::parse(br#"{"type":"chat"}"#).is_none());
        assert!(Frame::parse(br#"{"type":"chat","text":7}"#).is_none());
        assert!(Frame::parse(br#"{"type":"signal","kind":"explode"}"#).is_none());
        assert!(Frame::parse(br#"{"type":"ping","timestamp":"now"}"#).is_none());
    }

    #[test]
    fn test_chat_truncation_counts_chars() {
        let long = "é".repeat(1500);
        match Frame::chat(&long, 1000) {
            Frame::Chat { text } => assert_eq!(text.chars().count(), 1000),
            other => panic!("unexpected frame {:?}", other),
        }
        assert_eq!(truncate_chars("short", 1000), "short");
    }

    #[test]
    fn test_rtt_bounds() {
        assert_eq!(rtt_sample(1_000, 1_000, 60_000), Some(0));
        assert_eq!(rtt_sample(1_250, 1_000, 60_000), Some(250));
        assert_eq!(rtt_sample(61_000, 1_001, 60_000), Some(59_999));
        assert_eq!(rtt_sample(61_000, 1_000, 60_000), None);
        assert_eq!(rtt_sample(999, 1_000, 60_000), None);
        assert_eq!(rtt_sample(0, i64::MIN, 60_000), None);
    }

    #[test]
    fn test_rate_limiter_window() {
        let start = Instant::now();
        let mut limiter = ChatRateLimiter::new(5, Duration::from_secs(1));

        let mut accepted = 0;
        for i in 0..6u64 {
            if limiter.try_acquire(start + Duration::from_millis(i * 150)) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 5);

        // still inside the window of the first send
        assert!(!limiter.try_acquire(start + Duration::from_millis(999)));
        // first send has aged out
        assert!(limiter.try_acquire(start + Duration::from_millis(1000)));
        // after a full second of quiet the whole window is free
        let later = start + Duration::from_millis(3000);
        for _ in 0..5 {
            assert!(limiter.try_acquire(later));
        }
        assert!(!limiter.try_acquire(later));
    }
}
