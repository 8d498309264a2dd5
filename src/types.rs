use crate::error::{RealtimeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Close code reserved for the manager's own intentional closes.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when a transport drops without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

// --- Channel kinds ---

/// Singleton channels, at most one live connection per kind.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum SharedChannel {
    Metrics,
    Events,
    Notifications,
}

/// Multi-instance channels, keyed by a consumer supplied instance id.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum IsolatedChannel {
    Terminals,
    FileTransfers,
    Executions,
    ContainerLogs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    Shared(SharedChannel),
    Isolated(IsolatedChannel),
}

impl SharedChannel {
    pub const ALL: [SharedChannel; 3] = [Self::Metrics, Self::Events, Self::Notifications];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Events => "events",
            Self::Notifications => "notifications",
        }
    }
}

impl IsolatedChannel {
    pub const ALL: [IsolatedChannel; 4] = [
        Self::Terminals,
        Self::FileTransfers,
        Self::Executions,
        Self::ContainerLogs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminals => "terminals",
            Self::FileTransfers => "fileTransfers",
            Self::Executions => "executions",
            Self::ContainerLogs => "containerLogs",
        }
    }
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared(kind) => kind.as_str(),
            Self::Isolated(kind) => kind.as_str(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// Latency sensitive kinds get a heartbeat; plain log tails and uploads do not.
    pub fn is_monitored(&self) -> bool {
        matches!(
            self,
            Self::Shared(SharedChannel::Metrics)
                | Self::Isolated(IsolatedChannel::Terminals)
                | Self::Isolated(IsolatedChannel::Executions)
        )
    }
}

impl From<SharedChannel> for ChannelKind {
    fn from(kind: SharedChannel) -> Self {
        ChannelKind::Shared(kind)
    }
}

impl From<IsolatedChannel> for ChannelKind {
    fn from(kind: IsolatedChannel) -> Self {
        ChannelKind::Isolated(kind)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        SharedChannel::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .map(|kind| ChannelKind::Shared(*kind))
            .or_else(|| {
                IsolatedChannel::ALL
                    .iter()
                    .find(|kind| kind.as_str() == s)
                    .map(|kind| ChannelKind::Isolated(*kind))
            })
            .ok_or_else(|| RealtimeError::UnknownChannel(s.to_string()))
    }
}

// --- Connection identity ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Shared,
    Isolated,
}

/// Key for every piece of per-connection state.
///
/// Text form is `shared:<kind>` or `isolated:<kind>:<instance>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionId {
    Shared(SharedChannel),
    Isolated(IsolatedChannel, String),
}

impl ConnectionId {
    pub fn shared(kind: SharedChannel) -> Self {
        ConnectionId::Shared(kind)
    }

    pub fn isolated(kind: IsolatedChannel, instance: impl Into<String>) -> Self {
        ConnectionId::Isolated(kind, instance.into())
    }

    pub fn scope(&self) -> Scope {
        match self {
            Self::Shared(_) => Scope::Shared,
            Self::Isolated(..) => Scope::Isolated,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Shared(kind) => ChannelKind::Shared(*kind),
            Self::Isolated(kind, _) => ChannelKind::Isolated(*kind),
        }
    }

    pub fn instance(&self) -> Option<&str> {
        match self {
            Self::Shared(_) => None,
            Self::Isolated(_, instance) => Some(instance.as_str()),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.scope() == Scope::Shared
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared(kind) => write!(f, "shared:{}", kind.as_str()),
            Self::Isolated(kind, instance) => write!(f, "isolated:{}:{}", kind.as_str(), instance),
        }
    }
}

impl FromStr for ConnectionId {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RealtimeError::InvalidConnectionId(s.to_string());
        let mut parts = s.splitn(3, ':');
        let scope = parts.next().ok_or_else(invalid)?;
        let kind = parts.next().ok_or_else(invalid)?;
        let instance = parts.next();

        match (scope, kind.parse::<ChannelKind>().map_err(|_| invalid())?, instance) {
            ("shared", ChannelKind::Shared(kind), None) => Ok(ConnectionId::Shared(kind)),
            ("isolated", ChannelKind::Isolated(kind), Some(id)) if !id.is_empty() => {
                Ok(ConnectionId::Isolated(kind, id.to_string()))
            }
            _ => Err(invalid()),
        }
    }
}

// --- Wire frames ---

/// One frame of the line-delimited JSON protocol.
///
/// Only `type` is mandatory. Every other top-level field (`id`, `timestamp`,
/// `code`, `error`, ...) is kept untyped in `extra`, so a frame reaches
/// subscribers whatever JSON types the server chose for those fields.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WireMessage {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets an arbitrary top-level field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// In-band credential frame sent right after a transport opens.
    pub fn auth(token: &str) -> Self {
        Self::new("auth").with_payload(json!({ "token": token }))
    }

    /// Fire-and-forget liveness ping.
    pub fn ping() -> Self {
        Self::new("ping")
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// `id` as text; numeric ids are not converted.
    pub fn id(&self) -> Option<&str> {
        self.field("id").and_then(Value::as_str)
    }

    /// Epoch-millisecond `timestamp`, when the server sent a number.
    pub fn timestamp(&self) -> Option<i64> {
        self.field("timestamp").and_then(Value::as_i64)
    }

    pub fn code(&self) -> Option<&str> {
        self.field("code").and_then(Value::as_str)
    }

    /// Human-readable `error`: either the string itself or `error.message`.
    pub fn error_message(&self) -> Option<&str> {
        match self.field("error")? {
            Value::String(text) => Some(text),
            other => other.get("message").and_then(Value::as_str),
        }
    }

    pub fn is_type(&self, message_type: &str) -> bool {
        self.message_type == message_type
    }
}

/// Outbound frame accepted by `send`: structured frames go through the codec,
/// raw text is written verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(WireMessage),
    Text(String),
}

impl From<WireMessage> for Outbound {
    fn from(message: WireMessage) -> Self {
        Outbound::Message(message)
    }
}

impl From<String> for Outbound {
    fn from(text: String) -> Self {
        Outbound::Text(text)
    }
}

impl From<&str> for Outbound {
    fn from(text: &str) -> Self {
        Outbound::Text(text.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

// --- Connection records ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Connected,
    Disconnected,
    Error,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct ConnectionRecord {
    pub endpoint: String,
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub message_count: u64,
    pub authenticated_as: Option<String>,
    /// Monotonic time of the last open or inbound frame.
    #[serde(skip)]
    pub last_activity: Option<Instant>,
}

/// Row of the aggregate health snapshot.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ConnectionHealth {
    pub connection_id: String,
    pub status: ConnectionStatus,
    pub reconnect_count: u32,
    pub last_error: Option<String>,
}

pub fn active_connections(health: &[ConnectionHealth]) -> usize {
    health
        .iter()
        .filter(|h| h.status == ConnectionStatus::Connected)
        .count()
}

pub fn total_connections(health: &[ConnectionHealth]) -> usize {
    health.len()
}

// --- Observability ---

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Connected,
    Disconnected { code: Option<u16>, reason: String },
    Message(WireMessage),
    Error(String),
    Reconnecting { attempt: u32, delay: Duration },
    QueueFull { evicted_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeEvent {
    pub connection_id: ConnectionId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl RealtimeEvent {
    pub fn now(connection_id: ConnectionId, kind: EventKind) -> Self {
        Self {
            connection_id,
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_round_trips_through_text() {
        let shared = ConnectionId::shared(SharedChannel::Metrics);
        assert_eq!(shared.to_string(), "shared:metrics");
        assert_eq!("shared:metrics".parse::<ConnectionId>().unwrap(), shared);

        let isolated = ConnectionId::isolated(IsolatedChannel::ContainerLogs, "abc");
        assert_eq!(isolated.to_string(), "isolated:containerLogs:abc");
        assert_eq!(isolated.instance(), Some("abc"));
        assert_eq!(isolated.scope(), Scope::Isolated);
    }

    #[test]
    fn test_connection_id_keeps_colons_in_instance() {
        let id: ConnectionId = "isolated:terminals:pod:web-0".parse().unwrap();
        assert_eq!(
            id,
            ConnectionId::isolated(IsolatedChannel::Terminals, "pod:web-0")
        );
    }

    #[test]
    fn test_connection_id_rejects_mismatched_scope() {
        for bad in [
            "shared:terminals",
            "isolated:metrics:x",
            "isolated:terminals",
            "isolated:terminals:",
            "shared:metrics:extra",
            "global:metrics",
            "shared:nope",
            "",
        ] {
            let result = bad.parse::<ConnectionId>();
            assert!(
                matches!(result, Err(RealtimeError::InvalidConnectionId(_))),
                "{} should not parse",
                bad
            );
        }
    }

    #[test]
    fn test_channel_kind_names() {
        assert_eq!(
            "fileTransfers".parse::<ChannelKind>().unwrap(),
            ChannelKind::Isolated(IsolatedChannel::FileTransfers)
        );
        assert!(matches!(
            "fileTransfer".parse::<ChannelKind>(),
            Err(RealtimeError::UnknownChannel(_))
        ));
        assert!(ChannelKind::Shared(SharedChannel::Metrics).is_monitored());
        assert!(!ChannelKind::Shared(SharedChannel::Events).is_monitored());
        assert!(!ChannelKind::Isolated(IsolatedChannel::ContainerLogs).is_monitored());
    }

    #[test]
    fn test_wire_message_preserves_unknown_fields() {
        let raw = r#"{"type":"pod.update","payload":{"name":"web"},"namespace":"prod"}"#;
        let msg: WireMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.message_type, "pod.update");
        assert_eq!(msg.extra.get("namespace"), Some(&json!("prod")));

        let encoded: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["namespace"], json!("prod"));
        assert!(encoded.get("code").is_none());
    }

    #[test]
    fn test_wire_message_accepts_any_field_types() {
        let raw = r#"{"type":"job","id":42,"timestamp":"2024-01-01T00:00:00Z","error":{"message":"boom"},"code":7}"#;
        let msg: WireMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.field("id"), Some(&json!(42)));
        assert_eq!(msg.id(), None);
        assert_eq!(msg.timestamp(), None);
        assert_eq!(msg.code(), None);
        assert_eq!(msg.error_message(), Some("boom"));

        let typed: WireMessage =
            serde_json::from_str(r#"{"type":"x","id":"c1","timestamp":1700000000000,"error":"bad"}"#)
                .unwrap();
        assert_eq!(typed.id(), Some("c1"));
        assert_eq!(typed.timestamp(), Some(1_700_000_000_000));
        assert_eq!(typed.error_message(), Some("bad"));
    }

    #[test]
    fn test_auth_frame_shape() {
        let value = serde_json::to_value(WireMessage::auth("tok-1")).unwrap();
        assert_eq!(value, json!({ "type": "auth", "payload": { "token": "tok-1" } }));
    }

    #[test]
    fn test_health_counts() {
        let row = |status| ConnectionHealth {
            connection_id: "shared:metrics".to_string(),
            status,
            reconnect_count: 0,
            last_error: None,
        };
        let health = vec![
            row(ConnectionStatus::Connected),
            row(ConnectionStatus::Reconnecting),
            row(ConnectionStatus::Connected),
        ];
        assert_eq!(active_connections(&health), 2);
        assert_eq!(total_connections(&health), 3);
    }
}
