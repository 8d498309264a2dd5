//! Periodic ping and staleness detection for latency sensitive connections.
//!
//! No pong is expected. Liveness is judged from ordinary inbound traffic:
//! a connection that has been silent for longer than the threshold since
//! its last open or last inbound frame is considered dead even if the
//! transport still reports itself open.

use super::timers::{TimerKind, Timers};
use crate::types::ConnectionId;
use log::*;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub send_ping: bool,
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    interval: Duration,
    stale_after: Duration,
}

impl HealthMonitor {
    pub fn new(interval: Duration, stale_after: Duration) -> Self {
        Self {
            interval,
            stale_after,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn start(&self, timers: &mut Timers, id: &ConnectionId) {
        debug!("[Heartbeat] Monitoring {} every {:?}", id, self.interval);
        timers.schedule_repeating(id, TimerKind::Heartbeat, self.interval);
    }

    pub fn stop(&self, timers: &mut Timers, id: &ConnectionId) {
        if timers.cancel(id, TimerKind::Heartbeat) {
            debug!("[Heartbeat] Stopped monitoring {}", id);
        }
    }

    pub fn is_monitoring(&self, timers: &Timers, id: &ConnectionId) -> bool {
        timers.is_armed(id, TimerKind::Heartbeat)
    }

    /// Decides what one heartbeat tick should do.
    pub fn assess(&self, open: bool, last_activity: Option<Instant>, now: Instant) -> Verdict {
        let stale = last_activity
            .map(|at| now.saturating_duration_since(at) > self.stale_after)
            .unwrap_or(false);
        Verdict {
            send_ping: open,
            stale,
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_STALE_AFTER)
    }
}
