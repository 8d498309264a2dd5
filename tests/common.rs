// tests/common.rs
#![allow(dead_code)]

use serde_json::Value;
use std::sync::{Arc, Mutex, Once};
use tokio::sync::{broadcast, mpsc};
use vapor_realtime::auth::TokenStore;
use vapor_realtime::config::RealtimeConfig;
use vapor_realtime::types::{ConnectionId, ConnectionRecord, EventKind, RealtimeEvent};
use vapor_realtime::websocket::{
    ConnectRequest, Connector, OutboundFrame, RealtimeManager, ReadyState, TransportEvents,
    TransportHandle,
};

static INIT: Once = Once::new();

// Loads .env (if any) and installs the test logger once per test binary.
pub fn setup() {
    INIT.call_once(|| {
        if dotenv::from_path(".env").is_err() {
            let _ = dotenv::from_path("../.env");
        }
        env_logger::builder().is_test(true).try_init().ok();
    });
}

pub fn test_config() -> RealtimeConfig {
    RealtimeConfig::default().with_base_url("ws://console.test")
}

pub fn start(connector: &MockConnector, auth: TokenStore) -> RealtimeManager {
    start_with(connector, auth, test_config())
}

pub fn start_with(
    connector: &MockConnector,
    auth: TokenStore,
    config: RealtimeConfig,
) -> RealtimeManager {
    setup();
    RealtimeManager::builder()
        .config(config)
        .auth(auth)
        .connector(connector.clone())
        .jitter_seed(7)
        .start()
        .expect("manager starts")
}

/// Round-trips a command through the manager. Every transport notice and timer
/// firing queued before the call has been handled when it returns.
pub async fn flush(manager: &RealtimeManager, id: &ConnectionId) -> Option<ConnectionRecord> {
    manager.status(id).await.expect("manager running")
}

pub fn drain_events(rx: &mut broadcast::Receiver<RealtimeEvent>) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

/// One in-memory transport handed out by [`MockConnector`].
pub struct MockTransport {
    pub request: ConnectRequest,
    pub handle: TransportHandle,
    events: TransportEvents,
    outbound: Mutex<mpsc::UnboundedReceiver<OutboundFrame>>,
    sent: Mutex<Vec<OutboundFrame>>,
}

impl MockTransport {
    pub fn open(&self) {
        self.handle.set_ready_state(ReadyState::Open);
        self.events.opened();
    }

    pub fn push(&self, frame: Value) {
        self.events.frame(frame.to_string());
    }

    pub fn push_raw(&self, frame: &str) {
        self.events.frame(frame);
    }

    pub fn fail(&self, cause: &str) {
        self.events.error(cause);
    }

    /// Simulates the peer or the network closing the socket.
    pub fn drop_with(&self, code: u16) {
        self.handle.set_ready_state(ReadyState::Closed);
        self.events.closed(code, "closed by test");
    }

    /// Everything the manager wrote so far, close frames included.
    pub fn sent(&self) -> Vec<OutboundFrame> {
        let mut sent = self.sent.lock().unwrap();
        let mut rx = self.outbound.lock().unwrap();
        while let Ok(frame) = rx.try_recv() {
            sent.push(frame);
        }
        sent.clone()
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Text(text) => Some(text),
                OutboundFrame::Close { .. } => None,
            })
            .collect()
    }

    pub fn sent_json(&self) -> Vec<Value> {
        self.sent_text()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    pub fn close_frame(&self) -> Option<(u16, String)> {
        self.sent().into_iter().find_map(|frame| match frame {
            OutboundFrame::Close { code, reason } => Some((code, reason)),
            OutboundFrame::Text(_) => None,
        })
    }
}

/// Connector that records every request and never touches the network.
#[derive(Clone)]
pub struct MockConnector {
    auto_open: bool,
    transports: Arc<Mutex<Vec<Arc<MockTransport>>>>,
}

impl MockConnector {
    /// Transports report open as soon as they are created.
    pub fn new() -> Self {
        Self {
            auto_open: true,
            transports: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Transports stay connecting until the test calls [`MockTransport::open`].
    pub fn manual() -> Self {
        Self {
            auto_open: false,
            ..Self::new()
        }
    }

    pub fn count(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        self.transports.lock().unwrap()[index].clone()
    }

    pub fn last(&self) -> Arc<MockTransport> {
        self.transports
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("at least one transport")
    }

    pub fn for_connection(&self, id: &ConnectionId) -> Vec<Arc<MockTransport>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .filter(|t| &t.request.connection_id == id)
            .cloned()
            .collect()
    }
}

impl Connector for MockConnector {
    fn open(&self, request: ConnectRequest, events: TransportEvents) -> TransportHandle {
        let (handle, outbound) = TransportHandle::new(request.generation, request.url.as_str());
        let transport = Arc::new(MockTransport {
            request,
            handle: handle.clone(),
            events,
            outbound: Mutex::new(outbound),
            sent: Mutex::new(Vec::new()),
        });
        if self.auto_open {
            transport.open();
        }
        self.transports.lock().unwrap().push(transport);
        handle
    }
}
