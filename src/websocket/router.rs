//! Fan-out of inbound frames to independently registered subscribers.

use crate::types::{ConnectionId, WireMessage};
use anyhow::anyhow;
use log::*;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub type MessageHandler = Arc<dyn Fn(&WireMessage) -> anyhow::Result<()> + Send + Sync + 'static>;
pub type MessageFilter = Arc<dyn Fn(&WireMessage) -> bool + Send + Sync + 'static>;
pub type ErrorHandler = Arc<dyn Fn(&anyhow::Error) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum TypeFilter {
    #[default]
    Any,
    Only(BTreeSet<String>),
}

/// One subscriber: a handler plus optional type and predicate filters.
#[derive(Clone)]
pub struct Route {
    route_id: String,
    types: TypeFilter,
    filter: Option<MessageFilter>,
    handler: MessageHandler,
    on_error: Option<ErrorHandler>,
}

impl Route {
    pub fn new(handler: impl Fn(&WireMessage) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        Self {
            route_id: uuid::Uuid::new_v4().to_string(),
            types: TypeFilter::Any,
            filter: None,
            handler: Arc::new(handler),
            on_error: None,
        }
    }

    pub fn with_id(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = route_id.into();
        self
    }

    /// Only deliver frames of this type.
    pub fn message_type(self, message_type: impl Into<String>) -> Self {
        self.message_types([message_type])
    }

    /// Only deliver frames whose type is in the set.
    pub fn message_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = match self.types {
            TypeFilter::Only(existing) => existing,
            TypeFilter::Any => BTreeSet::new(),
        };
        set.extend(types.into_iter().map(Into::into));
        self.types = TypeFilter::Only(set);
        self
    }

    pub fn filter(mut self, filter: impl Fn(&WireMessage) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn on_error(mut self, on_error: impl Fn(&anyhow::Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    fn accepts_type(&self, message: &WireMessage) -> bool {
        match &self.types {
            TypeFilter::Any => true,
            TypeFilter::Only(types) => types.contains(&message.message_type),
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("route_id", &self.route_id)
            .field("types", &self.types)
            .field("filter", &self.filter.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Delivery tally for one routed frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReport {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub removed: bool,
    pub remaining: usize,
}

#[derive(Debug, Default)]
pub struct MessageRouter {
    routes: HashMap<ConnectionId, Vec<(SubscriberId, Route)>>,
    next_id: u64,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: &ConnectionId, route: Route) -> SubscriberId {
        self.next_id += 1;
        let subscriber = SubscriberId(self.next_id);
        debug!("[Router] {} registered {} ({})", id, subscriber, route.route_id);
        self.routes
            .entry(id.clone())
            .or_default()
            .push((subscriber, route));
        subscriber
    }

    /// Removing an unknown subscriber is a no-op.
    pub fn remove(&mut self, id: &ConnectionId, subscriber: SubscriberId) -> Removal {
        let Some(routes) = self.routes.get_mut(id) else {
            return Removal {
                removed: false,
                remaining: 0,
            };
        };
        let before = routes.len();
        routes.retain(|(sid, _)| *sid != subscriber);
        let removal = Removal {
            removed: routes.len() != before,
            remaining: routes.len(),
        };
        if routes.is_empty() {
            self.routes.remove(id);
        }
        removal
    }

    pub fn count(&self, id: &ConnectionId) -> usize {
        self.routes.get(id).map_or(0, Vec::len)
    }

    pub fn clear_connection(&mut self, id: &ConnectionId) {
        self.routes.remove(id);
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    /// Delivers `message` to every matching subscriber in registration order.
    /// A failing or panicking handler is reported to its own `on_error` and
    /// does not affect the others.
    pub fn route(&self, id: &ConnectionId, message: &WireMessage) -> RouteReport {
        let mut report = RouteReport::default();
        let Some(routes) = self.routes.get(id) else {
            return report;
        };
        for (_, route) in routes {
            if !route.accepts_type(message) {
                report.skipped += 1;
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if let Some(filter) = &route.filter {
                    if !filter(message) {
                        return Ok(false);
                    }
                }
                (route.handler)(message).map(|_| true)
            }));
            match outcome {
                Ok(Ok(true)) => report.delivered += 1,
                Ok(Ok(false)) => report.skipped += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    Self::report_failure(id, route, err);
                }
                Err(panic) => {
                    report.failed += 1;
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    Self::report_failure(id, route, anyhow!("handler panicked: {}", detail));
                }
            }
        }
        report
    }

    fn report_failure(id: &ConnectionId, route: &Route, err: anyhow::Error) {
        error!("[Router] Subscriber {} on {} failed: {:#}", route.route_id, id, err);
        if let Some(on_error) = &route.on_error {
            if catch_unwind(AssertUnwindSafe(|| on_error(&err))).is_err() {
                error!("[Router] Error callback of {} panicked", route.route_id);
            }
        }
    }
}
