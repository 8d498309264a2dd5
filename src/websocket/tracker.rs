//! Lifecycle records per connection plus the aggregate health snapshot.

use crate::types::{ConnectionHealth, ConnectionId, ConnectionRecord, ConnectionStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tokio::time::Instant;

/// Partial record merged by [`StateTracker::update`]. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    endpoint: Option<String>,
    status: Option<ConnectionStatus>,
    reconnect_attempts: Option<u32>,
    last_connected: Option<DateTime<Utc>>,
    last_disconnected: Option<DateTime<Utc>>,
    last_error: Option<Option<String>>,
    message_count: Option<u64>,
    authenticated_as: Option<Option<String>>,
    last_activity: Option<Instant>,
}

impl RecordUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn status(mut self, status: ConnectionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = Some(attempts);
        self
    }

    pub fn last_connected(mut self, at: DateTime<Utc>) -> Self {
        self.last_connected = Some(at);
        self
    }

    pub fn last_disconnected(mut self, at: DateTime<Utc>) -> Self {
        self.last_disconnected = Some(at);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn message_count(mut self, count: u64) -> Self {
        self.message_count = Some(count);
        self
    }

    pub fn authenticated_as(mut self, username: Option<String>) -> Self {
        self.authenticated_as = Some(username);
        self
    }

    pub fn last_activity(mut self, at: Instant) -> Self {
        self.last_activity = Some(at);
        self
    }

    fn apply(self, record: &mut ConnectionRecord) {
        if let Some(endpoint) = self.endpoint {
            record.endpoint = endpoint;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(attempts) = self.reconnect_attempts {
            record.reconnect_attempts = attempts;
        }
        if let Some(at) = self.last_connected {
            record.last_connected = Some(at);
        }
        if let Some(at) = self.last_disconnected {
            record.last_disconnected = Some(at);
        }
        if let Some(error) = self.last_error {
            record.last_error = error;
        }
        if let Some(count) = self.message_count {
            record.message_count = count;
        }
        if let Some(username) = self.authenticated_as {
            record.authenticated_as = username;
        }
        if let Some(at) = self.last_activity {
            record.last_activity = Some(at);
        }
    }
}

/// Source of truth for connection status. Every change republishes the health snapshot.
#[derive(Debug)]
pub struct StateTracker {
    records: BTreeMap<ConnectionId, ConnectionRecord>,
    health: watch::Sender<Vec<ConnectionHealth>>,
}

impl StateTracker {
    pub fn new() -> (Self, watch::Receiver<Vec<ConnectionHealth>>) {
        let (health, receiver) = watch::channel(Vec::new());
        (
            Self {
                records: BTreeMap::new(),
                health,
            },
            receiver,
        )
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionRecord> {
        self.records.get(id)
    }

    /// Merges `update` into the record, creating it if needed.
    pub fn update(&mut self, id: &ConnectionId, update: RecordUpdate) {
        let record = self.records.entry(id.clone()).or_default();
        update.apply(record);
        self.publish();
    }

    pub fn record_message(&mut self, id: &ConnectionId, at: Instant) {
        if let Some(record) = self.records.get_mut(id) {
            record.message_count += 1;
            record.last_activity = Some(at);
            self.publish();
        }
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<ConnectionRecord> {
        let removed = self.records.remove(id);
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.publish();
    }

    pub fn snapshot(&self) -> Vec<ConnectionHealth> {
        self.records
            .iter()
            .map(|(id, record)| ConnectionHealth {
                connection_id: id.to_string(),
                status: record.status,
                reconnect_count: record.reconnect_attempts,
                last_error: record.last_error.clone(),
            })
            .collect()
    }

    fn publish(&self) {
        // No observers is fine.
        self.health.send_replace(self.snapshot());
    }
}
