//! Per-connection lifecycle as a pure transition table.
//!
//! The manager feeds [`LinkEvent`]s in and performs the returned
//! [`Effect`]s in order. Nothing here touches a socket or a timer, so the
//! reconnect and heartbeat interplay can be checked without either.

use crate::types::{ConnectionStatus, NORMAL_CLOSURE};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Connecting,
    Connected,
    Disconnected { code: Option<u16> },
    Reconnecting { attempt: u32, delay: Duration },
    Closed,
}

impl Phase {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Phase::Connecting => ConnectionStatus::Connecting,
            Phase::Connected => ConnectionStatus::Connected,
            Phase::Disconnected { .. } => ConnectionStatus::Disconnected,
            Phase::Reconnecting { .. } => ConnectionStatus::Reconnecting,
            Phase::Closed => ConnectionStatus::Closed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Opened,
    TransportError(String),
    TransportClosed { code: u16 },
    /// The scheduler agreed to retry.
    BackoffArmed { attempt: u32, delay: Duration },
    /// A reconnect or settle timer elapsed.
    Reopen,
    /// Manual or stale-triggered reconnect.
    ReconnectRequested { settle: Duration },
    CloseRequested,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Authenticate,
    DrainQueue,
    StartHeartbeat,
    StopHeartbeat,
    RecordError(String),
    ScheduleReconnect,
    CancelReconnect,
    ArmSettle(Duration),
    OpenTransport,
    CloseTransport { code: u16, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: Phase,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: Phase, effects: Vec<Effect>) -> Option<Self> {
        Some(Self { next, effects })
    }
}

/// Next phase and side effects for `event`, or `None` when the event is
/// meaningless in `phase` and should be ignored.
pub fn transition(phase: &Phase, event: LinkEvent) -> Option<Transition> {
    use Phase::*;

    match (phase, event) {
        (Closed, _) => None,

        (Connecting, LinkEvent::Opened) => Transition::to(
            Connected,
            vec![Effect::Authenticate, Effect::DrainQueue, Effect::StartHeartbeat],
        ),

        (Connecting | Connected, LinkEvent::TransportError(cause)) => {
            Transition::to(phase.clone(), vec![Effect::RecordError(cause)])
        }

        (Connecting | Connected, LinkEvent::TransportClosed { code }) => {
            let mut effects = vec![Effect::StopHeartbeat];
            if code != NORMAL_CLOSURE {
                effects.push(Effect::ScheduleReconnect);
            }
            Transition::to(Disconnected { code: Some(code) }, effects)
        }

        (Disconnected { .. }, LinkEvent::BackoffArmed { attempt, delay }) => {
            Transition::to(Reconnecting { attempt, delay }, vec![])
        }

        (Reconnecting { .. }, LinkEvent::Reopen) => {
            Transition::to(Connecting, vec![Effect::OpenTransport])
        }

        (_, LinkEvent::ReconnectRequested { settle }) => Transition::to(
            Reconnecting {
                attempt: 0,
                delay: settle,
            },
            vec![
                Effect::CancelReconnect,
                Effect::StopHeartbeat,
                Effect::CloseTransport {
                    code: NORMAL_CLOSURE,
                    reason: "Manual reconnection",
                },
                Effect::ArmSettle(settle),
            ],
        ),

        (_, LinkEvent::CloseRequested) => Transition::to(
            Closed,
            vec![
                Effect::StopHeartbeat,
                Effect::CancelReconnect,
                Effect::CloseTransport {
                    code: NORMAL_CLOSURE,
                    reason: "Normal closure",
                },
            ],
        ),

        _ => None,
    }
}
