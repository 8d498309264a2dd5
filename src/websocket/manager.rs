//! Connection manager: one actor task that owns every connection-indexed map.
//!
//! Transport notices, timer firings and public API commands all arrive over
//! channels and are handled one at a time, transport notices first. The
//! [`RealtimeManager`] handle is the only way in; it is cheap to clone and
//! every call is answered through a oneshot.

use super::codec::{Codec, JsonCodec};
use super::endpoints::{EndpointRegistry, IsolatedOptions};
use super::heartbeat::HealthMonitor;
use super::machine::{transition, Effect, LinkEvent, Phase};
use super::queue::{Delivery, MessageQueue};
use super::router::{MessageRouter, Route, SubscriberId};
use super::scheduler::ReconnectScheduler;
use super::timers::{TimerFired, TimerKind, Timers};
use super::tracker::{RecordUpdate, StateTracker};
use super::transport::{
    ConnectRequest, Connector, ReadyState, TransportEvent, TransportEvents, TransportHandle,
    TransportNotice, WsConnector,
};
use crate::auth::{AuthEvent, AuthFailure, AuthProvider, AuthReply, AuthSession, TokenStore};
use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::types::{
    ConnectionHealth, ConnectionId, ConnectionRecord, ConnectionStatus, EventKind, IsolatedChannel,
    Outbound, RealtimeEvent, SendOutcome, SharedChannel, WireMessage, NORMAL_CLOSURE,
};
use chrono::Utc;
use log::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Subscribe {
        kind: SharedChannel,
        route: Route,
        reply: Reply<SubscriberId>,
    },
    Attach {
        id: ConnectionId,
        route: Route,
        reply: Reply<SubscriberId>,
    },
    Unsubscribe {
        id: ConnectionId,
        subscriber: SubscriberId,
        reply: Option<oneshot::Sender<()>>,
    },
    CreateIsolated {
        kind: IsolatedChannel,
        instance: String,
        options: IsolatedOptions,
        reply: Reply<TransportHandle>,
    },
    CloseIsolated {
        id: ConnectionId,
        reply: oneshot::Sender<()>,
    },
    Status {
        id: ConnectionId,
        reply: oneshot::Sender<Option<ConnectionRecord>>,
    },
    Send {
        id: ConnectionId,
        outbound: Outbound,
        reply: Reply<SendOutcome>,
    },
    Reconnect {
        id: ConnectionId,
        reply: Reply<()>,
    },
    WaitAuth {
        id: ConnectionId,
        reply: Reply<AuthSession>,
    },
    CloseAll {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum AuthState {
    Idle,
    Pending,
    Accepted(AuthSession),
    Failed(AuthFailure),
}

/// Everything the manager knows about one connection id besides its record.
struct Link {
    phase: Phase,
    url: Url,
    protocols: Vec<String>,
    transport: Option<TransportHandle>,
    auth: AuthState,
    auth_waiters: Vec<Reply<AuthSession>>,
    settle_waiters: Vec<Reply<()>>,
}

impl Link {
    fn new(url: Url, protocols: Vec<String>) -> Self {
        Self {
            phase: Phase::Connecting,
            url,
            protocols,
            transport: None,
            auth: AuthState::Idle,
            auth_waiters: Vec::new(),
            settle_waiters: Vec::new(),
        }
    }

    fn owns(&self, generation: u64) -> bool {
        self.transport
            .as_ref()
            .map_or(false, |t| t.generation() == generation)
    }

    fn accept_auth(&mut self, session: AuthSession) {
        for waiter in self.auth_waiters.drain(..) {
            let _ = waiter.send(Ok(session.clone()));
        }
        self.auth = AuthState::Accepted(session);
    }

    fn fail_auth(&mut self, failure: AuthFailure) {
        for waiter in self.auth_waiters.drain(..) {
            let _ = waiter.send(Err(failure.to_error()));
        }
        self.auth = AuthState::Failed(failure);
    }

    /// Forgets the handshake of the current transport; pending waiters are rejected.
    fn reset_auth(&mut self, reason: &str) {
        for waiter in self.auth_waiters.drain(..) {
            let _ = waiter.send(Err(RealtimeError::Cancelled(reason.to_string())));
        }
        self.auth = AuthState::Idle;
    }

    fn release_settle_waiters(&mut self, outcome: impl Fn() -> Result<()>) {
        for waiter in self.settle_waiters.drain(..) {
            let _ = waiter.send(outcome());
        }
    }
}

struct ManagerCore {
    config: RealtimeConfig,
    registry: EndpointRegistry,
    auth: Arc<dyn AuthProvider>,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
    links: HashMap<ConnectionId, Link>,
    router: MessageRouter,
    queue: MessageQueue,
    tracker: StateTracker,
    timers: Timers,
    monitor: HealthMonitor,
    scheduler: ReconnectScheduler,
    events: broadcast::Sender<RealtimeEvent>,
    notice_tx: mpsc::UnboundedSender<TransportNotice>,
    next_generation: u64,
}

impl ManagerCore {
    async fn run(
        mut self,
        mut notices: mpsc::UnboundedReceiver<TransportNotice>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerFired>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(notice) = notices.recv() => self.on_notice(notice),
                Some(fired) = timer_rx.recv() => self.on_timer(fired),
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.close_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("[Manager] All handles dropped");
                        self.close_all();
                        break;
                    }
                },
            }
        }
        info!("[Manager] Stopped");
    }

    // --- Public commands ---

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { kind, route, reply } => {
                let _ = reply.send(self.subscribe(kind, route));
            }
            Command::Attach { id, route, reply } => {
                let _ = reply.send(Ok(self.router.add(&id, route)));
            }
            Command::Unsubscribe {
                id,
                subscriber,
                reply,
            } => {
                self.unsubscribe(&id, subscriber);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::CreateIsolated {
                kind,
                instance,
                options,
                reply,
            } => {
                let _ = reply.send(self.create_isolated(kind, instance, options));
            }
            Command::CloseIsolated { id, reply } => {
                self.teardown(&id, "Closed by owner");
                let _ = reply.send(());
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.tracker.get(&id).cloned());
            }
            Command::Send {
                id,
                outbound,
                reply,
            } => {
                let _ = reply.send(self.send(&id, outbound));
            }
            Command::Reconnect { id, reply } => self.manual_reconnect(&id, reply),
            Command::WaitAuth { id, reply } => self.wait_auth(&id, reply),
            Command::CloseAll { reply } => {
                self.close_all();
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn subscribe(&mut self, kind: SharedChannel, route: Route) -> Result<SubscriberId> {
        let id = ConnectionId::shared(kind);
        if !self.links.contains_key(&id) {
            let path = EndpointRegistry::resolve(id.kind(), None);
            let url = self.registry.url_for(&path, &BTreeMap::new())?;
            self.links.insert(id.clone(), Link::new(url, Vec::new()));
            self.tracker
                .update(&id, RecordUpdate::new().reconnect_attempts(0));
            self.open_transport(&id);
        }
        Ok(self.router.add(&id, route))
    }

    fn unsubscribe(&mut self, id: &ConnectionId, subscriber: SubscriberId) {
        let removal = self.router.remove(id, subscriber);
        if removal.removed && removal.remaining == 0 && id.is_shared() {
            info!("[Manager] Last subscriber left {}, closing", id);
            self.teardown(id, "No subscribers left");
        }
    }

    fn create_isolated(
        &mut self,
        kind: IsolatedChannel,
        instance: String,
        options: IsolatedOptions,
    ) -> Result<TransportHandle> {
        if instance.is_empty() {
            return Err(RealtimeError::InvalidConnectionId(format!(
                "isolated:{}:",
                kind.as_str()
            )));
        }
        let id = ConnectionId::isolated(kind, instance);
        if let Some(existing) = self.links.get(&id).and_then(|link| link.transport.as_ref()) {
            if matches!(
                existing.ready_state(),
                ReadyState::Connecting | ReadyState::Open
            ) {
                debug!("[Manager] Reusing live transport for {}", id);
                return Ok(existing.clone());
            }
        }

        let path = EndpointRegistry::resolve(id.kind(), id.instance());
        let url = self.registry.url_for(&path, &options.params)?;

        // Nothing armed for the old transport may fire against the new one.
        self.timers.cancel_all(&id);
        let link = self
            .links
            .entry(id.clone())
            .or_insert_with(|| Link::new(url.clone(), Vec::new()));
        if let Some(stale) = link.transport.take() {
            stale.close(NORMAL_CLOSURE, "Superseded");
        }
        link.url = url;
        link.protocols = options.protocols;
        link.phase = Phase::Connecting;
        link.auth = AuthState::Idle;
        link.release_settle_waiters(|| Ok(()));

        self.tracker
            .update(&id, RecordUpdate::new().reconnect_attempts(0));
        self.open_transport(&id)
            .ok_or_else(|| RealtimeError::UnknownConnection(id.to_string()))
    }

    fn send(&mut self, id: &ConnectionId, outbound: Outbound) -> Result<SendOutcome> {
        // Shared ids are few and fixed, so their frames may wait for the first
        // subscriber. Isolated ids only exist between create and close.
        if !id.is_shared() && !self.links.contains_key(id) {
            return Err(RealtimeError::UnknownConnection(id.to_string()));
        }
        let frame = self.codec.encode_outbound(&outbound)?;
        let open = self.writable(id);

        if let Some(transport) = &open {
            if self.queue.is_empty(id) && transport.send_text(frame.clone()) {
                trace!("[Manager] Sent on {}: {}", id, frame);
                return Ok(SendOutcome::Sent);
            }
        }

        if let Some(evicted) = self.queue.enqueue(id, frame) {
            warn!("[Manager] Message queue full for {}, dropped oldest frame", id);
            self.publish(
                id,
                EventKind::QueueFull {
                    evicted_at: evicted.enqueued_at,
                },
            );
        }
        if open.is_some() {
            self.drain(id);
        }
        if self.queue.is_empty(id) {
            Ok(SendOutcome::Sent)
        } else {
            debug!(
                "[Manager] Queued frame for {} ({} pending)",
                id,
                self.queue.len(id)
            );
            Ok(SendOutcome::Queued)
        }
    }

    fn manual_reconnect(&mut self, id: &ConnectionId, reply: Reply<()>) {
        if !self.links.contains_key(id) {
            let _ = reply.send(Err(RealtimeError::UnknownConnection(id.to_string())));
            return;
        }
        if !self.force_reconnect(id) {
            let _ = reply.send(Err(RealtimeError::Cancelled(format!(
                "{} cannot be reconnected",
                id
            ))));
            return;
        }
        if let Some(link) = self.links.get_mut(id) {
            link.settle_waiters.push(reply);
        }
    }

    fn wait_auth(&mut self, id: &ConnectionId, reply: Reply<AuthSession>) {
        let Some(link) = self.links.get_mut(id) else {
            let _ = reply.send(Err(RealtimeError::UnknownConnection(id.to_string())));
            return;
        };
        match &link.auth {
            AuthState::Accepted(session) => {
                let _ = reply.send(Ok(session.clone()));
            }
            AuthState::Failed(failure) => {
                let _ = reply.send(Err(failure.to_error()));
            }
            AuthState::Idle if matches!(link.phase, Phase::Disconnected { .. }) => {
                let _ = reply.send(Err(RealtimeError::Cancelled(format!(
                    "{} is disconnected",
                    id
                ))));
            }
            AuthState::Idle | AuthState::Pending => link.auth_waiters.push(reply),
        }
    }

    fn close_all(&mut self) {
        let ids: Vec<ConnectionId> = self.links.keys().cloned().collect();
        info!("[Manager] Closing all {} connection(s)", ids.len());
        for id in &ids {
            self.teardown(id, "Global teardown");
        }
        self.timers.clear();
        self.router.clear();
        self.queue.clear_all();
        self.tracker.clear();
    }

    /// Intentional close: heartbeat and timers go first, then every piece of state.
    fn teardown(&mut self, id: &ConnectionId, reason: &str) {
        if let Some(effects) = self.step(id, LinkEvent::CloseRequested) {
            self.perform_all(id, effects);
        }
        self.timers.cancel_all(id);
        self.queue.clear(id);
        self.router.clear_connection(id);
        self.tracker.remove(id);
        if let Some(mut link) = self.links.remove(id) {
            link.reset_auth(reason);
            let cancelled = format!("{} closed: {}", id, reason);
            link.release_settle_waiters(|| Err(RealtimeError::Cancelled(cancelled.clone())));
            info!("[Manager] Closed {} ({})", id, reason);
            self.publish(
                id,
                EventKind::Disconnected {
                    code: Some(NORMAL_CLOSURE),
                    reason: reason.to_string(),
                },
            );
        }
    }

    // --- Transport notices ---

    fn on_notice(&mut self, notice: TransportNotice) {
        let TransportNotice {
            connection_id: id,
            generation,
            event,
        } = notice;
        let current = self
            .links
            .get(&id)
            .map_or(false, |link| link.owns(generation));
        if !current {
            trace!(
                "[Manager] Ignoring {:?} from superseded transport of {}",
                event,
                id
            );
            return;
        }

        match event {
            TransportEvent::Opened => self.on_opened(&id),
            TransportEvent::Frame(text) => self.on_frame(&id, &text),
            TransportEvent::Error(cause) => {
                if let Some(effects) = self.step(&id, LinkEvent::TransportError(cause)) {
                    self.perform_all(&id, effects);
                }
            }
            TransportEvent::Closed { code, reason } => self.on_closed(&id, code, reason),
        }
    }

    fn on_opened(&mut self, id: &ConnectionId) {
        let Some(effects) = self.step(id, LinkEvent::Opened) else {
            return;
        };
        info!("[Manager] {} connected", id);
        self.tracker.update(
            id,
            RecordUpdate::new()
                .status(ConnectionStatus::Connected)
                .last_connected(Utc::now())
                .reconnect_attempts(0)
                .last_activity(Instant::now()),
        );
        self.publish(id, EventKind::Connected);
        self.perform_all(id, effects);
    }

    fn on_frame(&mut self, id: &ConnectionId, text: &str) {
        let message = match self.codec.decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("[Manager] Dropping malformed frame on {}: {}", id, e);
                return;
            }
        };
        self.tracker.record_message(id, Instant::now());
        if let Some(reply) = AuthReply::from_frame(&message) {
            self.on_auth_reply(id, reply);
        }
        let report = self.router.route(id, &message);
        trace!(
            "[Manager] {} routed '{}': {:?}",
            id,
            message.message_type,
            report
        );
        self.publish(id, EventKind::Message(message));
    }

    fn on_auth_reply(&mut self, id: &ConnectionId, reply: AuthReply) {
        self.timers.cancel(id, TimerKind::AuthTimeout);
        let Some(link) = self.links.get_mut(id) else {
            return;
        };
        match reply {
            AuthReply::Accepted { username } => {
                info!(
                    "[Manager] {} authenticated as {}",
                    id,
                    username.as_deref().unwrap_or("<unnamed>")
                );
                link.accept_auth(AuthSession {
                    username: username.clone(),
                    authenticated_at: Utc::now(),
                });
                self.tracker
                    .update(id, RecordUpdate::new().authenticated_as(username));
            }
            AuthReply::Rejected(reason) => {
                warn!("[Manager] Authentication rejected on {}: {}", id, reason);
                link.fail_auth(AuthFailure::Rejected(reason.clone()));
                let cause = format!("Authentication failed: {}", reason);
                self.tracker.update(
                    id,
                    RecordUpdate::new()
                        .authenticated_as(None)
                        .last_error(Some(cause.clone())),
                );
                self.publish(id, EventKind::Error(cause));
            }
        }
    }

    fn on_closed(&mut self, id: &ConnectionId, code: u16, reason: String) {
        let Some(effects) = self.step(id, LinkEvent::TransportClosed { code }) else {
            return;
        };
        self.timers.cancel(id, TimerKind::AuthTimeout);
        if let Some(link) = self.links.get_mut(id) {
            link.transport = None;
            link.reset_auth("Connection closed before authentication completed");
        }
        info!("[Manager] {} disconnected (code {}) {}", id, code, reason);
        self.tracker.update(
            id,
            RecordUpdate::new()
                .status(ConnectionStatus::Disconnected)
                .last_disconnected(Utc::now())
                .authenticated_as(None),
        );
        self.publish(
            id,
            EventKind::Disconnected {
                code: Some(code),
                reason,
            },
        );
        self.perform_all(id, effects);
    }

    // --- Timers ---

    fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(&fired) {
            trace!(
                "[Manager] Discarding stale {:?} timer for {}",
                fired.kind,
                fired.connection_id
            );
            return;
        }
        let id = fired.connection_id;
        match fired.kind {
            TimerKind::Reconnect => self.reopen(&id),
            TimerKind::Settle => {
                self.reopen(&id);
                if let Some(link) = self.links.get_mut(&id) {
                    link.release_settle_waiters(|| Ok(()));
                }
            }
            TimerKind::Heartbeat => self.heartbeat(&id),
            TimerKind::AuthTimeout => self.auth_timed_out(&id),
        }
    }

    fn reopen(&mut self, id: &ConnectionId) {
        if let Some(effects) = self.step(id, LinkEvent::Reopen) {
            self.perform_all(id, effects);
        }
    }

    fn heartbeat(&mut self, id: &ConnectionId) {
        let Some(link) = self.links.get(id) else {
            self.monitor.stop(&mut self.timers, id);
            return;
        };
        let transport = link.transport.clone().filter(TransportHandle::is_open);
        let last_activity = self.tracker.get(id).and_then(|r| r.last_activity);
        let verdict = self
            .monitor
            .assess(transport.is_some(), last_activity, Instant::now());

        if let (true, Some(transport)) = (verdict.send_ping, &transport) {
            match self.codec.encode(&WireMessage::ping()) {
                Ok(frame) => {
                    trace!("[Heartbeat] Ping {}", id);
                    transport.send_text(frame);
                }
                Err(e) => warn!("[Heartbeat] Could not encode ping for {}: {}", id, e),
            }
        }
        if verdict.stale {
            warn!(
                "[Heartbeat] {} silent for more than {:?}, forcing reconnect",
                id,
                self.monitor.stale_after()
            );
            self.force_reconnect(id);
        }
    }

    fn auth_timed_out(&mut self, id: &ConnectionId) {
        let timeout = self.registry.policy_for(id.kind()).auth_timeout;
        if let Some(link) = self.links.get_mut(id) {
            if matches!(link.auth, AuthState::Pending) {
                warn!("[Manager] No auth response on {} within {:?}", id, timeout);
                link.fail_auth(AuthFailure::TimedOut(timeout));
            }
        }
    }

    // --- State machine plumbing ---

    fn step(&mut self, id: &ConnectionId, event: LinkEvent) -> Option<Vec<Effect>> {
        let link = self.links.get_mut(id)?;
        match transition(&link.phase, event.clone()) {
            Some(next) => {
                debug!("[Manager] {}: {:?} -> {:?}", id, link.phase, next.next);
                link.phase = next.next;
                Some(next.effects)
            }
            None => {
                trace!("[Manager] {}: ignoring {:?} in {:?}", id, event, link.phase);
                None
            }
        }
    }

    fn perform_all(&mut self, id: &ConnectionId, effects: Vec<Effect>) {
        for effect in effects {
            self.perform(id, effect);
        }
    }

    fn perform(&mut self, id: &ConnectionId, effect: Effect) {
        match effect {
            Effect::Authenticate => self.authenticate(id),
            Effect::DrainQueue => self.drain(id),
            Effect::StartHeartbeat => {
                if id.kind().is_monitored() {
                    self.monitor.start(&mut self.timers, id);
                }
            }
            Effect::StopHeartbeat => self.monitor.stop(&mut self.timers, id),
            Effect::RecordError(cause) => {
                warn!("[Manager] Transport error on {}: {}", id, cause);
                self.tracker.update(
                    id,
                    RecordUpdate::new()
                        .status(ConnectionStatus::Error)
                        .last_error(Some(cause.clone())),
                );
                self.publish(id, EventKind::Error(cause));
            }
            Effect::ScheduleReconnect => self.schedule_reconnect(id),
            Effect::CancelReconnect => {
                self.scheduler.cancel(&mut self.timers, id);
                self.timers.cancel(id, TimerKind::Settle);
            }
            Effect::ArmSettle(delay) => {
                self.timers.schedule_once(id, TimerKind::Settle, delay);
            }
            Effect::OpenTransport => {
                self.open_transport(id);
            }
            Effect::CloseTransport { code, reason } => {
                self.timers.cancel(id, TimerKind::AuthTimeout);
                if let Some(link) = self.links.get_mut(id) {
                    link.reset_auth("Transport closed by manager");
                    if let Some(transport) = link.transport.take() {
                        debug!("[Manager] Closing transport of {} ({})", id, reason);
                        transport.close(code, reason);
                    }
                }
            }
        }
    }

    fn open_transport(&mut self, id: &ConnectionId) -> Option<TransportHandle> {
        let link = self.links.get_mut(id)?;
        self.next_generation += 1;
        let generation = self.next_generation;
        let request = ConnectRequest {
            connection_id: id.clone(),
            generation,
            url: link.url.clone(),
            protocols: link.protocols.clone(),
            connect_timeout: self.config.connect_timeout(),
        };
        let events = TransportEvents::new(id.clone(), generation, self.notice_tx.clone());
        info!("[Manager] Opening {} at {}", id, request.url);
        let handle = self.connector.open(request, events);
        link.transport = Some(handle.clone());
        self.tracker.update(
            id,
            RecordUpdate::new()
                .endpoint(link.url.as_str())
                .status(ConnectionStatus::Connecting),
        );
        Some(handle)
    }

    fn authenticate(&mut self, id: &ConnectionId) {
        let timeout = self.registry.policy_for(id.kind()).auth_timeout;
        let token = if self.auth.is_authenticated() {
            self.auth.token()
        } else {
            None
        };
        let Some(link) = self.links.get_mut(id) else {
            return;
        };
        let Some(token) = token else {
            debug!("[Manager] No credential for {}, skipping authentication", id);
            link.fail_auth(AuthFailure::NoCredential);
            return;
        };
        let frame = match self.codec.encode(&WireMessage::auth(&token)) {
            Ok(frame) => frame,
            Err(e) => {
                error!("[Manager] Could not encode auth frame for {}: {}", id, e);
                link.fail_auth(AuthFailure::Rejected(e.to_string()));
                return;
            }
        };
        let sent = link
            .transport
            .as_ref()
            .map_or(false, |transport| transport.send_text(frame));
        if sent {
            debug!("[Manager] Sent credentials on {}", id);
            link.auth = AuthState::Pending;
            self.timers.schedule_once(id, TimerKind::AuthTimeout, timeout);
        } else {
            warn!("[Manager] Transport of {} closed before authenticating", id);
        }
    }

    /// The current transport, but only once the link has processed its open.
    /// A socket that reports open ahead of its `Opened` notice must not carry
    /// application frames before the credential.
    fn writable(&self, id: &ConnectionId) -> Option<TransportHandle> {
        self.links
            .get(id)
            .filter(|link| link.phase == Phase::Connected)
            .and_then(|link| link.transport.clone())
            .filter(TransportHandle::is_open)
    }

    fn drain(&mut self, id: &ConnectionId) {
        let Some(transport) = self.writable(id) else {
            return;
        };
        let sent = self.queue.drain(id, |queued| {
            if transport.send_text(queued.frame.clone()) {
                Delivery::Sent
            } else {
                Delivery::TransportClosed
            }
        });
        if sent > 0 {
            debug!("[Manager] Flushed {} queued frame(s) to {}", sent, id);
        }
    }

    fn schedule_reconnect(&mut self, id: &ConnectionId) {
        let attempts = self.tracker.get(id).map_or(0, |r| r.reconnect_attempts);
        let policy = self.registry.policy_for(id.kind()).clone();
        match self.scheduler.plan(id, attempts, &policy) {
            Ok(plan) => {
                self.tracker.update(
                    id,
                    RecordUpdate::new()
                        .status(ConnectionStatus::Reconnecting)
                        .reconnect_attempts(plan.attempt),
                );
                self.publish(
                    id,
                    EventKind::Reconnecting {
                        attempt: plan.attempt,
                        delay: plan.delay,
                    },
                );
                if let Some(effects) = self.step(
                    id,
                    LinkEvent::BackoffArmed {
                        attempt: plan.attempt,
                        delay: plan.delay,
                    },
                ) {
                    self.perform_all(id, effects);
                }
                self.scheduler.arm(&mut self.timers, id, &plan);
            }
            Err(e) => {
                error!("[Manager] {}", e);
                self.tracker
                    .update(id, RecordUpdate::new().last_error(Some(e.to_string())));
                self.publish(id, EventKind::Error(e.to_string()));
            }
        }
    }

    /// Close now, re-open after the settle delay. Resets the attempt counter.
    fn force_reconnect(&mut self, id: &ConnectionId) -> bool {
        let settle = self.config.settle_delay();
        let Some(effects) = self.step(id, LinkEvent::ReconnectRequested { settle }) else {
            return false;
        };
        info!("[Manager] Reconnecting {} in {:?}", id, settle);
        self.tracker.update(
            id,
            RecordUpdate::new()
                .status(ConnectionStatus::Reconnecting)
                .reconnect_attempts(0),
        );
        self.publish(
            id,
            EventKind::Reconnecting {
                attempt: 0,
                delay: settle,
            },
        );
        self.perform_all(id, effects);
        true
    }

    fn publish(&self, id: &ConnectionId, kind: EventKind) {
        // No receivers is fine.
        let _ = self.events.send(RealtimeEvent::now(id.clone(), kind));
    }
}

// --- Public handle ---

/// Builder for [`RealtimeManager`]. Every collaborator has a production default.
pub struct RealtimeManagerBuilder {
    config: RealtimeConfig,
    registry: Option<EndpointRegistry>,
    auth: Option<Arc<dyn AuthProvider>>,
    connector: Option<Arc<dyn Connector>>,
    codec: Option<Arc<dyn Codec>>,
    jitter_seed: Option<u64>,
}

impl RealtimeManagerBuilder {
    pub fn config(mut self, config: RealtimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the registry built from `config.ws_base_url`.
    pub fn registry(mut self, registry: EndpointRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn auth(mut self, auth: impl AuthProvider) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// Makes backoff jitter reproducible.
    pub fn jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Spawns the manager task. Must be called from within a tokio runtime.
    pub fn start(self) -> Result<RealtimeManager> {
        self.config.validate()?;
        let registry = match self.registry {
            Some(registry) => registry,
            None => EndpointRegistry::new(self.config.base_url()?),
        };
        let (tracker, health) = StateTracker::new();
        let (timers, timer_rx) = Timers::new();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(self.config.event_capacity);

        info!("[Manager] Starting against {}", registry.base_url());
        let core = ManagerCore {
            monitor: HealthMonitor::new(
                self.config.heartbeat_interval(),
                self.config.stale_after(),
            ),
            queue: MessageQueue::new(self.config.max_queue_size),
            scheduler: match self.jitter_seed {
                Some(seed) => ReconnectScheduler::with_seed(seed),
                None => ReconnectScheduler::new(),
            },
            config: self.config,
            registry,
            auth: self
                .auth
                .unwrap_or_else(|| Arc::new(TokenStore::new())),
            connector: self.connector.unwrap_or_else(|| Arc::new(WsConnector)),
            codec: self.codec.unwrap_or_else(|| Arc::new(JsonCodec)),
            links: HashMap::new(),
            router: MessageRouter::new(),
            tracker,
            timers,
            events: events.clone(),
            notice_tx,
            next_generation: 0,
        };
        tokio::spawn(core.run(notice_rx, timer_rx, command_rx));

        Ok(RealtimeManager {
            commands: command_tx,
            events,
            health,
        })
    }
}

/// Handle to the running connection manager.
#[derive(Clone)]
pub struct RealtimeManager {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<RealtimeEvent>,
    health: watch::Receiver<Vec<ConnectionHealth>>,
}

impl RealtimeManager {
    pub fn builder() -> RealtimeManagerBuilder {
        RealtimeManagerBuilder {
            config: RealtimeConfig::default(),
            registry: None,
            auth: None,
            connector: None,
            codec: None,
            jitter_seed: None,
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| RealtimeError::ManagerStopped)?;
        rx.await.map_err(|_| RealtimeError::ManagerStopped)
    }

    /// Subscribes to a shared channel, opening it if this is the first subscriber.
    ///
    /// The connection lives as long as at least one [`Subscription`] does;
    /// dropping the guard unsubscribes.
    pub async fn subscribe(&self, kind: SharedChannel, route: Route) -> Result<Subscription> {
        let subscriber = self
            .request(|reply| Command::Subscribe { kind, route, reply })
            .await??;
        Ok(Subscription::new(
            ConnectionId::shared(kind),
            subscriber,
            self.commands.clone(),
        ))
    }

    /// Registers a subscriber on any connection id without opening anything,
    /// so an owner can attach before `create_isolated` and miss no frame.
    /// The entry lives as long as the returned guard. Detaching never closes
    /// an isolated connection.
    pub async fn attach(&self, id: &ConnectionId, route: Route) -> Result<Subscription> {
        let subscriber = self
            .request(|reply| Command::Attach {
                id: id.clone(),
                route,
                reply,
            })
            .await??;
        Ok(Subscription::new(id.clone(), subscriber, self.commands.clone()))
    }

    /// Opens `(kind, instance)` or returns the transport already connecting or open there.
    pub async fn create_isolated(
        &self,
        kind: IsolatedChannel,
        instance: impl Into<String>,
        options: IsolatedOptions,
    ) -> Result<TransportHandle> {
        let instance = instance.into();
        self.request(|reply| Command::CreateIsolated {
            kind,
            instance,
            options,
            reply,
        })
        .await?
    }

    pub async fn close_isolated(
        &self,
        kind: IsolatedChannel,
        instance: impl Into<String>,
    ) -> Result<()> {
        let id = ConnectionId::isolated(kind, instance);
        self.request(|reply| Command::CloseIsolated { id, reply })
            .await
    }

    pub async fn status(&self, id: &ConnectionId) -> Result<Option<ConnectionRecord>> {
        self.request(|reply| Command::Status {
            id: id.clone(),
            reply,
        })
        .await
    }

    /// Sends now if the transport is open and nothing is queued ahead; queues otherwise.
    ///
    /// An isolated id must have been created and not yet closed. A shared id
    /// queues even before its first subscriber opens it.
    pub async fn send(
        &self,
        id: &ConnectionId,
        message: impl Into<Outbound>,
    ) -> Result<SendOutcome> {
        let outbound = message.into();
        self.request(|reply| Command::Send {
            id: id.clone(),
            outbound,
            reply,
        })
        .await?
    }

    /// Closes the transport, waits the settle delay and opens a new one.
    /// Resolves once the new transport has been created.
    pub async fn reconnect(&self, id: &ConnectionId) -> Result<()> {
        self.request(|reply| Command::Reconnect {
            id: id.clone(),
            reply,
        })
        .await?
    }

    /// Resolves with the server's verdict on the credential sent for the current transport.
    pub async fn wait_authenticated(&self, id: &ConnectionId) -> Result<AuthSession> {
        self.request(|reply| Command::WaitAuth {
            id: id.clone(),
            reply,
        })
        .await?
    }

    pub async fn close_all(&self) -> Result<()> {
        self.request(|reply| Command::CloseAll { reply }).await
    }

    pub async fn shutdown(self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    pub fn health(&self) -> watch::Receiver<Vec<ConnectionHealth>> {
        self.health.clone()
    }

    /// Runs [`close_all`](Self::close_all) on every logout signal.
    pub fn watch_logout(&self, mut auth_events: broadcast::Receiver<AuthEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match auth_events.recv().await {
                    Ok(AuthEvent::Logout) => {
                        info!("[Manager] Logout received, closing all connections");
                        if manager.close_all().await.is_err() {
                            break;
                        }
                    }
                    Ok(AuthEvent::Login) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[Manager] Missed {} auth events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Router registration guard. Dropping it unsubscribes.
pub struct Subscription {
    connection_id: ConnectionId,
    subscriber: SubscriberId,
    commands: mpsc::UnboundedSender<Command>,
    active: bool,
}

impl Subscription {
    fn new(
        connection_id: ConnectionId,
        subscriber: SubscriberId,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            connection_id,
            subscriber,
            commands,
            active: true,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber
    }

    /// Unsubscribes and waits until the manager has processed it.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.active = false;
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Unsubscribe {
                id: self.connection_id.clone(),
                subscriber: self.subscriber,
                reply: Some(tx),
            })
            .map_err(|_| RealtimeError::ManagerStopped)?;
        rx.await.map_err(|_| RealtimeError::ManagerStopped)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.active {
            let _ = self.commands.send(Command::Unsubscribe {
                id: self.connection_id.clone(),
                subscriber: self.subscriber,
                reply: None,
            });
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("connection_id", &self.connection_id)
            .field("subscriber", &self.subscriber)
            .finish()
    }
}
