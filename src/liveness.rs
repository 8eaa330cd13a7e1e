use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::types::{now_ms, ConnectionState};

/// Tracks the remote runtime's heartbeat.
///
/// The state is a function of the last signal and the observation instant,
/// so request-time and sweep-time checks cannot disagree for the same
/// instant. `observe` is the only place that moves Connected to
/// Disconnected; `is_live_at` is a pure read.
#[derive(Debug)]
pub struct LivenessTracker {
    window: Duration,
    last_signal: Option<Instant>,
    last_signal_ms: Option<u64>,
    state: ConnectionState,
}

impl LivenessTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_signal: None,
            last_signal_ms: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// Record a heartbeat. Returns the wall-clock timestamp recorded.
    pub fn signal(&mut self, now: Instant) -> u64 {
        let timestamp = now_ms();
        self.last_signal = Some(now);
        self.last_signal_ms = Some(timestamp);
        if self.state != ConnectionState::Connected {
            info!("remote runtime connected");
        }
        self.state = ConnectionState::Connected;
        timestamp
    }

    pub fn is_live_at(&self, now: Instant) -> bool {
        self.last_signal
            .is_some_and(|last| now.saturating_duration_since(last) <= self.window)
    }

    /// Re-derive the state at `now`, logging a transition to Disconnected.
    pub fn observe(&mut self, now: Instant) -> ConnectionState {
        if self.state == ConnectionState::Connected && !self.is_live_at(now) {
            let age_ms = self
                .last_signal
                .map(|last| now.saturating_duration_since(last).as_millis())
                .unwrap_or_default();
            info!(
                "remote runtime disconnected (last signal {age_ms}ms ago, window {}ms)",
                self.window.as_millis()
            );
            self.state = ConnectionState::Disconnected;
        }
        self.state
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_signal_ms(&self) -> Option<u64> {
        self.last_signal_ms
    }
}
