//! Connectivity tracking for the sync loop.
//!
//! An `auth_check` probe stands in for the browser's `online`/`offline`
//! events: probe results are turned into [`SyncTrigger`]s, and failed probes
//! are retried with exponential backoff.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Maximum backoff duration in seconds
pub const MAX_BACKOFF_SECS: u64 = 8;

/// Delay between probes while the server is reachable
pub const PROBE_INTERVAL_SECS: u64 = 30;

/// Events that can start work in the sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Online,
    Offline,
    /// The user came back to the app
    VisibilityRegained,
    /// Explicit request, e.g. a pull-to-refresh
    Manual,
}

/// Probe-side view of the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connected,
    /// Last probe failed; `attempt` counts consecutive failures
    Reconnecting {
        attempt: u32,
        next_retry: Option<Instant>,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn reconnect_attempt(&self) -> u32 {
        match self {
            ConnectionState::Reconnecting { attempt, .. } => *attempt,
            ConnectionState::Connected => 0,
        }
    }
}

/// Calculate exponential backoff duration for a given attempt number
///
/// Attempt 1: 0 seconds (immediate)
/// Attempt 2: 1 second
/// Attempt 3: 2 seconds
/// Attempt 4: 4 seconds
/// Attempt 5+: 8 seconds (max)
pub fn calculate_backoff(attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::from_secs(0);
    }
    let exponent = attempt - 2;
    let secs = if exponent >= 63 {
        MAX_BACKOFF_SECS
    } else {
        2u64.pow(exponent).min(MAX_BACKOFF_SECS)
    };
    Duration::from_secs(secs)
}

/// Result of feeding one probe outcome to a [`ConnectivityProbe`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    /// Set when connectivity flipped
    pub trigger: Option<SyncTrigger>,
    /// How long to wait before probing again
    pub next_probe_in: Duration,
}

/// Turns a stream of probe results into connectivity transitions.
#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    state: ConnectionState,
}

impl ConnectivityProbe {
    pub fn new(online: bool) -> Self {
        let state = if online {
            ConnectionState::Connected
        } else {
            ConnectionState::Reconnecting {
                attempt: 0,
                next_retry: None,
            }
        };
        Self { state }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn record_success(&mut self) -> ProbeOutcome {
        let was_connected = self.state.is_connected();
        self.state = ConnectionState::Connected;
        ProbeOutcome {
            trigger: (!was_connected).then_some(SyncTrigger::Online),
            next_probe_in: Duration::from_secs(PROBE_INTERVAL_SECS),
        }
    }

    pub fn record_failure(&mut self) -> ProbeOutcome {
        let was_connected = self.state.is_connected();
        let attempt = self.state.reconnect_attempt().saturating_add(1);
        // The first retry after a drop happens after one second, not immediately.
        let delay = calculate_backoff(attempt + 1);
        self.state = ConnectionState::Reconnecting {
            attempt,
            next_retry: Some(Instant::now() + delay),
        };
        ProbeOutcome {
            trigger: was_connected.then_some(SyncTrigger::Offline),
            next_probe_in: delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let secs: Vec<u64> = (1..=6).map(|a| calculate_backoff(a).as_secs()).collect();
        assert_eq!(secs, vec![0, 1, 2, 4, 8, 8]);
    }

    #[test]
    fn test_backoff_large_attempt_capped() {
        assert_eq!(calculate_backoff(100), Duration::from_secs(MAX_BACKOFF_SECS));
        assert_eq!(calculate_backoff(u32::MAX), Duration::from_secs(MAX_BACKOFF_SECS));
    }

    #[test]
    fn test_probe_emits_offline_once_then_backs_off() {
        let mut probe = ConnectivityProbe::new(true);

        let first = probe.record_failure();
        assert_eq!(first.trigger, Some(SyncTrigger::Offline));
        assert_eq!(first.next_probe_in, Duration::from_secs(1));

        let second = probe.record_failure();
        assert_eq!(second.trigger, None);
        assert_eq!(second.next_probe_in, Duration::from_secs(2));
        assert_eq!(probe.state().reconnect_attempt(), 2);

        for _ in 0..5 {
            probe.record_failure();
        }
        assert_eq!(
            probe.record_failure().next_probe_in,
            Duration::from_secs(MAX_BACKOFF_SECS)
        );
    }

    #[test]
    fn test_probe_emits_online_on_recovery() {
        let mut probe = ConnectivityProbe::new(false);
        let outcome = probe.record_success();
        assert_eq!(outcome.trigger, Some(SyncTrigger::Online));
        assert!(probe.state().is_connected());

        assert_eq!(probe.record_success().trigger, None);
    }
}
