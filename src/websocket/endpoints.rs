//! Channel kind to server path mapping and per-kind reconnection policies.

use crate::error::Result;
use crate::types::{ChannelKind, IsolatedChannel, SharedChannel};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use url::Url;

const DEFAULT_PATH: &str = "/ws/default";

/// Reconnection tuning for one channel kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// How long to wait for the server's `auth` verdict.
    pub auth_timeout: Duration,
}

impl ReconnectPolicy {
    /// Metrics are a background feed; keep trying indefinitely.
    pub fn metrics() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(3_000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 1.5,
            jitter: true,
            auth_timeout: Duration::from_millis(10_000),
        }
    }

    /// Terminals are interactive; fail fast so the user can retry by hand.
    pub fn terminal() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(5_000),
            backoff_multiplier: 1.2,
            jitter: false,
            auth_timeout: Duration::from_millis(5_000),
        }
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(false, |max| attempts >= max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            initial_delay: Duration::from_millis(2_000),
            max_delay: Duration::from_millis(20_000),
            backoff_multiplier: 1.5,
            jitter: true,
            auth_timeout: Duration::from_millis(10_000),
        }
    }
}

/// Extra settings for an isolated channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IsolatedOptions {
    /// Appended to the endpoint URL as query parameters.
    pub params: BTreeMap<String, String>,
    /// Offered through `Sec-WebSocket-Protocol`.
    #[serde(skip)]
    pub protocols: Vec<String>,
}

impl IsolatedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }
}

/// Resolves paths and policies. Policies are fixed once the registry is handed
/// to the manager.
#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    base_url: Url,
    policies: HashMap<ChannelKind, ReconnectPolicy>,
    default_policy: ReconnectPolicy,
}

impl EndpointRegistry {
    pub fn new(base_url: Url) -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            ChannelKind::Shared(SharedChannel::Metrics),
            ReconnectPolicy::metrics(),
        );
        policies.insert(
            ChannelKind::Isolated(IsolatedChannel::Terminals),
            ReconnectPolicy::terminal(),
        );
        Self {
            base_url,
            policies,
            default_policy: ReconnectPolicy::default(),
        }
    }

    pub fn with_policy(mut self, kind: impl Into<ChannelKind>, policy: ReconnectPolicy) -> Self {
        self.policies.insert(kind.into(), policy);
        self
    }

    pub fn with_default_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Server path for a channel, with the instance id as `?id=` for isolated kinds.
    pub fn resolve(kind: ChannelKind, instance: Option<&str>) -> String {
        let base = match kind {
            ChannelKind::Shared(SharedChannel::Metrics) => "/ws/metrics",
            ChannelKind::Shared(SharedChannel::Events) => "/ws/events",
            ChannelKind::Shared(SharedChannel::Notifications) => "/ws/notifications",
            ChannelKind::Isolated(IsolatedChannel::Terminals) => "/ws/terminal",
            ChannelKind::Isolated(IsolatedChannel::FileTransfers) => "/ws/upload",
            ChannelKind::Isolated(IsolatedChannel::Executions) => "/ws/ansible-exec",
            ChannelKind::Isolated(IsolatedChannel::ContainerLogs) => "/ws/container/logs",
        };
        match (kind, instance) {
            (ChannelKind::Isolated(_), Some(id)) => {
                let query = url::form_urlencoded::Serializer::new(String::new())
                    .append_pair("id", id)
                    .finish();
                format!("{}?{}", base, query)
            }
            _ => base.to_string(),
        }
    }

    /// Same as [`resolve`](Self::resolve) for a kind given by name; unknown
    /// names map to the default path instead of failing.
    pub fn resolve_named(kind: &str, instance: Option<&str>) -> String {
        match kind.parse::<ChannelKind>() {
            Ok(kind) => Self::resolve(kind, instance),
            Err(_) => DEFAULT_PATH.to_string(),
        }
    }

    pub fn policy_for(&self, kind: ChannelKind) -> &ReconnectPolicy {
        self.policies.get(&kind).unwrap_or(&self.default_policy)
    }

    /// Absolute URL: base URL, then the path, then any extra query parameters.
    pub fn url_for(&self, path: &str, params: &BTreeMap<String, String>) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let mut url = Url::parse(&format!("{}{}", base, path))?;
        if !params.is_empty() {
            let extra = serde_qs::to_string(params)?;
            let query = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{}&{}", existing, extra),
                _ => extra,
            };
            url.set_query(Some(&query));
        }
        Ok(url)
    }
}
