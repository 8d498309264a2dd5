use crate::error::RealtimeError;
use crate::types::WireMessage;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Wire code carried by an `error` frame when the server refuses the credential.
pub const AUTH_FAILED_CODE: &str = "AUTH_FAILED";

/// Read-only view of the console's login state.
///
/// The realtime layer never writes credentials; it only asks for the current
/// bearer token when a transport opens.
pub trait AuthProvider: Send + Sync + 'static {
    fn is_authenticated(&self) -> bool;
    fn token(&self) -> Option<String>;
}

/// Signals published by the login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    Login,
    Logout,
}

/// Shared token slot written by the login flow and read by the manager.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    token: Arc<RwLock<Option<String>>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::new();
        store.set(token);
        store
    }

    pub fn set(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.token.write() {
            *guard = None;
        }
    }
}

impl AuthProvider for TokenStore {
    fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    fn token(&self) -> Option<String> {
        self.token
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .filter(|token| !token.is_empty())
    }
}

/// Outcome of a successful in-band handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSession {
    pub username: Option<String>,
    pub authenticated_at: DateTime<Utc>,
}

/// Server verdict carried by an inbound frame, if it carries one.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AuthReply {
    Accepted { username: Option<String> },
    Rejected(String),
}

impl AuthReply {
    pub(crate) fn from_frame(message: &WireMessage) -> Option<Self> {
        if message.is_type("auth") {
            let payload = message.payload.as_ref()?;
            return match payload.get("authenticated").and_then(Value::as_bool) {
                Some(true) => Some(AuthReply::Accepted {
                    username: payload
                        .get("username")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }),
                Some(false) => Some(AuthReply::Rejected(
                    payload
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("Authentication rejected")
                        .to_string(),
                )),
                None => None,
            };
        }
        if message.is_type("error") && message.code() == Some(AUTH_FAILED_CODE) {
            let reason = message
                .error_message()
                .map(str::to_string)
                .or_else(|| {
                    message
                        .payload
                        .as_ref()
                        .and_then(|p| p.get("message"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "Authentication failed".to_string());
            return Some(AuthReply::Rejected(reason));
        }
        None
    }
}

/// Why a handshake did not succeed; kept on the link so late waiters see it too.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AuthFailure {
    Rejected(String),
    TimedOut(Duration),
    NoCredential,
}

impl AuthFailure {
    pub(crate) fn to_error(&self) -> RealtimeError {
        match self {
            AuthFailure::Rejected(reason) => RealtimeError::AuthenticationError(reason.clone()),
            AuthFailure::TimedOut(after) => RealtimeError::AuthTimeout(*after),
            AuthFailure::NoCredential => RealtimeError::AuthenticationError(
                "No authentication token available".to_string(),
            ),
        }
    }
}
