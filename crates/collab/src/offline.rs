//! Connection resilience for the client.
//!
//! Tracks the connection lifecycle (Online, Offline, Reconnecting, Syncing)
//! and computes reconnect delays. Local edits keep flowing into the pending
//! queue while offline; nothing here ever discards them.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Connected and caught up with the server
    Online,
    /// Disconnected, operations queued locally
    #[default]
    Offline,
    /// Waiting for the next reconnect attempt
    Reconnecting,
    /// Reconnected, replaying the queue or loading a snapshot
    Syncing,
}

impl ConnectionStatus {
    /// Check if currently online
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionStatus::Online)
    }

    /// Whether a transport is currently attached.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Online | ConnectionStatus::Syncing)
    }
}

/// Exponential reconnect backoff with multiplicative jitter.
///
/// The nth delay is `base * 2^n`, capped at `max`, then scaled by a random
/// factor in `[1 - jitter, 1 + jitter]` and capped again.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay, using the thread-local RNG for jitter.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// Next delay with an explicit RNG.
    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let exponent = self.attempt.min(31) as i32;
        self.attempt = self.attempt.saturating_add(1);

        let nominal = (self.base.as_secs_f64() * 2f64.powi(exponent)).min(self.max.as_secs_f64());
        let factor = if self.jitter > 0.0 {
            rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        } else {
            1.0
        };
        Duration::from_secs_f64(nominal * factor).min(self.max)
    }
}

/// UI display information for connection status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineStatusInfo {
    pub status: ConnectionStatus,
    pub pending_changes: usize,
    pub status_message: String,
}

impl OfflineStatusInfo {
    pub fn new(status: ConnectionStatus, pending_changes: usize) -> Self {
        let status_message = match status {
            ConnectionStatus::Online => "Connected".to_string(),
            ConnectionStatus::Offline if pending_changes > 0 => {
                format!("Offline - {} pending changes", pending_changes)
            }
            ConnectionStatus::Offline => "Offline".to_string(),
            ConnectionStatus::Reconnecting => "Reconnecting...".to_string(),
            ConnectionStatus::Syncing => "Syncing changes...".to_string(),
        };
        Self {
            status,
            pending_changes,
            status_message,
        }
    }

    /// Check if the indicator should be shown
    ///
    /// Returns true if offline or has pending changes
    pub fn should_show(&self) -> bool {
        !matches!(self.status, ConnectionStatus::Online) || self.pending_changes > 0
    }

    /// Get a short status string
    pub fn short_status(&self) -> &'static str {
        match self.status {
            ConnectionStatus::Online => "Online",
            ConnectionStatus::Offline => "Offline",
            ConnectionStatus::Reconnecting => "Reconnecting",
            ConnectionStatus::Syncing => "Syncing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_connection_status_default() {
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Offline);
        assert!(ConnectionStatus::Syncing.is_connected());
        assert!(!ConnectionStatus::Reconnecting.is_connected());
    }

    #[test]
    fn test_backoff_grows_and_caps_without_jitter() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(4), 0.0);
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
        assert_eq!(backoff.attempt(), 6);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.3);
        for attempt in 0..8u32 {
            let nominal = (1u64 << attempt).min(30) as f64;
            let delay = backoff.next_delay_with(&mut rng).as_secs_f64();
            assert!(delay >= nominal * 0.7 - 1e-9, "attempt {attempt}: {delay}");
            assert!(delay <= (nominal * 1.3).min(30.0) + 1e-9, "attempt {attempt}: {delay}");
        }
    }

    #[test]
    fn test_status_info() {
        let info = OfflineStatusInfo::new(ConnectionStatus::Offline, 3);
        assert_eq!(info.status_message, "Offline - 3 pending changes");
        assert!(info.should_show());
        assert_eq!(info.short_status(), "Offline");

        let online = OfflineStatusInfo::new(ConnectionStatus::Online, 0);
        assert!(!online.should_show());
    }
}
