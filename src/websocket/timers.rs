//! Cancellable one-shot and repeating timers keyed by connection.
//!
//! Timers never call back into the manager directly. They post a
//! [`TimerFired`] on a channel the manager polls, and the manager asks
//! [`Timers::accept`] whether that firing is still the armed one.

use crate::types::ConnectionId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Reconnect,
    Heartbeat,
    AuthTimeout,
    Settle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub connection_id: ConnectionId,
    pub kind: TimerKind,
    token: u64,
}

struct Armed {
    token: u64,
    repeating: bool,
    handle: JoinHandle<()>,
}

pub struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    armed: HashMap<(ConnectionId, TimerKind), Armed>,
    next_token: u64,
}

impl Timers {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                armed: HashMap::new(),
                next_token: 0,
            },
            rx,
        )
    }

    /// Arms a timer that fires once after `delay`, replacing any timer of the same kind.
    pub fn schedule_once(&mut self, id: &ConnectionId, kind: TimerKind, delay: Duration) {
        let fired = self.arm_token(id, kind);
        let tx = self.tx.clone();
        let token = fired.token;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(fired);
        });
        self.armed.insert(
            (id.clone(), kind),
            Armed {
                token,
                repeating: false,
                handle,
            },
        );
    }

    /// Arms a timer that fires every `period`, first after one full period.
    pub fn schedule_repeating(&mut self, id: &ConnectionId, kind: TimerKind, period: Duration) {
        let fired = self.arm_token(id, kind);
        let tx = self.tx.clone();
        let token = fired.token;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(fired.clone()).is_err() {
                    break;
                }
            }
        });
        self.armed.insert(
            (id.clone(), kind),
            Armed {
                token,
                repeating: true,
                handle,
            },
        );
    }

    pub fn cancel(&mut self, id: &ConnectionId, kind: TimerKind) -> bool {
        match self.armed.remove(&(id.clone(), kind)) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self, id: &ConnectionId) {
        self.armed.retain(|(armed_id, _), armed| {
            if armed_id == id {
                armed.handle.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn clear(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.handle.abort();
        }
    }

    pub fn is_armed(&self, id: &ConnectionId, kind: TimerKind) -> bool {
        self.armed.contains_key(&(id.clone(), kind))
    }

    /// True if `fired` belongs to the currently armed timer. A one-shot timer
    /// is disarmed by being accepted.
    pub fn accept(&mut self, fired: &TimerFired) -> bool {
        let key = (fired.connection_id.clone(), fired.kind);
        match self.armed.get(&key) {
            Some(armed) if armed.token == fired.token => {
                if !armed.repeating {
                    self.armed.remove(&key);
                }
                true
            }
            _ => false,
        }
    }

    fn arm_token(&mut self, id: &ConnectionId, kind: TimerKind) -> TimerFired {
        self.cancel(id, kind);
        self.next_token += 1;
        TimerFired {
            connection_id: id.clone(),
            kind,
            token: self.next_token,
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SharedChannel;

    fn id() -> ConnectionId {
        ConnectionId::shared(SharedChannel::Metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_after_delay() {
        let (mut timers, mut rx) = Timers::new();
        timers.schedule_once(&id(), TimerKind::Reconnect, Duration::from_secs(3));

        sleep(Duration::from_millis(2_900)).await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.expect("timer fires");
        assert_eq!(fired.kind, TimerKind::Reconnect);
        assert!(timers.accept(&fired));
        assert!(!timers.is_armed(&id(), TimerKind::Reconnect));
        assert!(!timers.accept(&fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_invalidates_previous_firing() {
        let (mut timers, mut rx) = Timers::new();
        timers.schedule_once(&id(), TimerKind::Settle, Duration::from_millis(10));
        sleep(Duration::from_millis(20)).await;
        let stale = rx.recv().await.expect("first firing");

        timers.schedule_once(&id(), TimerKind::Settle, Duration::from_millis(10));
        assert!(!timers.accept(&stale));

        let fresh = rx.recv().await.expect("second firing");
        assert!(timers.accept(&fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_until_cancelled() {
        let (mut timers, mut rx) = Timers::new();
        timers.schedule_repeating(&id(), TimerKind::Heartbeat, Duration::from_secs(30));

        for _ in 0..3 {
            let fired = rx.recv().await.expect("tick");
            assert!(timers.accept(&fired));
        }
        assert!(timers.is_armed(&id(), TimerKind::Heartbeat));

        assert!(timers.cancel(&id(), TimerKind::Heartbeat));
        sleep(Duration::from_secs(120)).await;
        while let Ok(late) = rx.try_recv() {
            assert!(!timers.accept(&late));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_only_touches_one_connection() {
        let (mut timers, _rx) = Timers::new();
        let other = ConnectionId::shared(SharedChannel::Events);
        timers.schedule_once(&id(), TimerKind::Reconnect, Duration::from_secs(1));
        timers.schedule_once(&id(), TimerKind::AuthTimeout, Duration::from_secs(1));
        timers.schedule_once(&other, TimerKind::Reconnect, Duration::from_secs(1));

        timers.cancel_all(&id());
        assert!(!timers.is_armed(&id(), TimerKind::Reconnect));
        assert!(!timers.is_armed(&id(), TimerKind::AuthTimeout));
        assert!(timers.is_armed(&other, TimerKind::Reconnect));
    }
}
