//! Cancellable controller timers
//!
//! Each armed timer is a spawned sleep that reports back on a channel. Every
//! arm bumps a generation counter; a firing is only honoured if its
//! generation still matches the one armed for that kind, so a timer that
//! raced with its own cancellation is ignored.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Answer/initiation until first remote media
    StreamHandshake,
    /// Whole outbound attempt, media plus data channel
    ConnectionAttempt,
    /// Pause before resuming the search after a session closed
    Settle,
    /// Latency probe interval
    Ping,
    /// Auto-clear of the user-visible error
    ErrorClear,
}

impl TimerKind {
    /// Timers armed on behalf of a lifecycle state; the ping belongs to the
    /// session and the error clear to the UI
    fn is_state_timer(self) -> bool {
        matches!(
            self,
            TimerKind::StreamHandshake | TimerKind::ConnectionAttempt | TimerKind::Settle
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

struct Armed {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct TimerSet {
    tx: mpsc::UnboundedSender<TimerFired>,
    armed: HashMap<TimerKind, Armed>,
    next_generation: u64,
}

impl TimerSet {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                armed: HashMap::new(),
                next_generation: 0,
            },
            rx,
        )
    }

    /// Arm `kind` to fire once after `delay`, replacing any armed instance
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);
        self.next_generation += 1;
        let generation = self.next_generation;
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired { kind, generation });
        });
        trace!(?kind, delay_ms = delay.as_millis() as u64, "timer armed");
        self.armed.insert(kind, Armed { generation, task });
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(armed) = self.armed.remove(&kind) {
            armed.task.abort();
            trace!(?kind, "timer cancelled");
        }
    }

    /// Cancel everything armed on behalf of a lifecycle state
    pub fn cancel_state_timers(&mut self) {
        let kinds: Vec<TimerKind> = self
            .armed
            .keys()
            .copied()
            .filter(|k| k.is_state_timer())
            .collect();
        for kind in kinds {
            self.cancel(kind);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.task.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Consume a firing; `false` if it was cancelled or superseded
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.armed.get(&fired.kind) {
            Some(armed) if armed.generation == fired.generation => {
                self.armed.remove(&fired.kind);
                true
            }
            _ => {
                trace!(kind = ?fired.kind, "ignoring stale timer");
                false
            }
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
