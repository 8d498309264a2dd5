//! Transport boundary between the manager and the socket.
//!
//! A [`Connector`] opens a transport and returns a [`TransportHandle`]
//! immediately, before the socket is up. Everything that happens afterwards
//! (open, frames, errors, close) is reported through [`TransportEvents`],
//! which the manager wires up before the connector is even called, so no
//! notification can be missed.

use crate::error::RealtimeError;
use crate::types::{ConnectionId, ABNORMAL_CLOSURE, NORMAL_CLOSURE};
use futures_util::{SinkExt, StreamExt};
use log::*;
use std::borrow::Cow;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::connect_async;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// What the manager asks a transport to write.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
struct TransportShared {
    generation: u64,
    url: String,
    state: AtomicU8,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

/// Cheap, cloneable handle to one transport instance.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    inner: Arc<TransportShared>,
}

impl TransportHandle {
    /// Creates a handle in the `Connecting` state and the receiver its writer drains.
    pub fn new(
        generation: u64,
        url: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            inner: Arc::new(TransportShared {
                generation,
                url: url.into(),
                state: AtomicU8::new(ReadyState::Connecting as u8),
                outbound,
            }),
        };
        (handle, rx)
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Queues a text frame on the writer. Returns false if the transport is not open.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        if !self.is_open() {
            return false;
        }
        self.inner
            .outbound
            .send(OutboundFrame::Text(text.into()))
            .is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) {
        if matches!(self.ready_state(), ReadyState::Closing | ReadyState::Closed) {
            return;
        }
        self.set_ready_state(ReadyState::Closing);
        let _ = self.inner.outbound.send(OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// True if both handles point at the same transport instance.
    pub fn same_transport(&self, other: &TransportHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Error(String),
    Closed { code: u16, reason: String },
}

#[derive(Debug)]
pub(crate) struct TransportNotice {
    pub(crate) connection_id: ConnectionId,
    pub(crate) generation: u64,
    pub(crate) event: TransportEvent,
}

/// Reporting side of a transport, bound to one connection and generation.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    connection_id: ConnectionId,
    generation: u64,
    tx: mpsc::UnboundedSender<TransportNotice>,
}

impl TransportEvents {
    pub(crate) fn new(
        connection_id: ConnectionId,
        generation: u64,
        tx: mpsc::UnboundedSender<TransportNotice>,
    ) -> Self {
        Self {
            connection_id,
            generation,
            tx,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn opened(&self) {
        self.emit(TransportEvent::Opened);
    }

    pub fn frame(&self, text: impl Into<String>) {
        self.emit(TransportEvent::Frame(text.into()));
    }

    pub fn error(&self, cause: impl Into<String>) {
        self.emit(TransportEvent::Error(cause.into()));
    }

    pub fn closed(&self, code: u16, reason: impl Into<String>) {
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.into(),
        });
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(TransportNotice {
            connection_id: self.connection_id.clone(),
            generation: self.generation,
            event,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub connection_id: ConnectionId,
    pub generation: u64,
    pub url: Url,
    pub protocols: Vec<String>,
    /// A handshake still pending after this long is abandoned as a failed connect.
    pub connect_timeout: Duration,
}

/// Opens transports. Must not block; report progress through `events`.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, request: ConnectRequest, events: TransportEvents) -> TransportHandle;
}

/// Production connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, request: ConnectRequest, events: TransportEvents) -> TransportHandle {
        let (handle, outbound) = TransportHandle::new(request.generation, request.url.as_str());
        tokio::spawn(run_socket(request, handle.clone(), outbound, events));
        handle
    }
}

/// Drives one socket: connect, then a writer task and a reader task until either ends.
async fn run_socket(
    request: ConnectRequest,
    handle: TransportHandle,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    events: TransportEvents,
) {
    let id = request.connection_id.clone();
    info!("[Transport] Connecting {} to {}", id, request.url);

    let connected = match timeout(request.connect_timeout, open_socket(&request)).await {
        Ok(result) => result,
        Err(_) => Err(RealtimeError::WebsocketError(format!(
            "Handshake timed out after {:?}",
            request.connect_timeout
        ))),
    };
    let ws_stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            error!("[Transport] {} failed to connect: {}", id, e);
            handle.set_ready_state(ReadyState::Closed);
            events.error(e.to_string());
            events.closed(ABNORMAL_CLOSURE, "connection failed");
            return;
        }
    };

    // Closed by the owner while the handshake was in flight.
    if handle.ready_state() != ReadyState::Connecting {
        debug!("[Transport] {} closed before open, dropping socket", id);
        handle.set_ready_state(ReadyState::Closed);
        return;
    }

    handle.set_ready_state(ReadyState::Open);
    events.opened();

    let (mut write, mut read) = ws_stream.split();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    // --- Writer Task ---
    let writer_id = id.clone();
    let mut writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(OutboundFrame::Text(text)) => Message::Text(text),
                    Some(OutboundFrame::Close { code, reason }) => Message::Close(Some(CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Owned(reason),
                    })),
                    None => break,
                },
                Some(data) = pong_rx.recv() => Message::Pong(data),
            };
            let closing = matches!(message, Message::Close(_));
            trace!("[Transport] {} sending {:?}", writer_id, message);
            if let Err(e) = write.send(message).await {
                error!("[Transport] {} send error: {}. Stopping writer.", writer_id, e);
                return Some(e.to_string());
            }
            if closing {
                break;
            }
        }
        None
    });

    // --- Reader Task ---
    let reader_events = events.clone();
    let reader_id = id.clone();
    let mut reader = tokio::spawn(async move {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    trace!("[Transport] {} received {}", reader_id, text);
                    reader_events.frame(text);
                }
                Some(Ok(Message::Binary(bin))) => match String::from_utf8(bin) {
                    Ok(text) => reader_events.frame(text),
                    Err(_) => debug!("[Transport] {} ignoring non-UTF-8 binary frame", reader_id),
                },
                Some(Ok(Message::Ping(data))) => {
                    if pong_tx.send(data).is_err() {
                        return (ABNORMAL_CLOSURE, "writer gone".to_string());
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    warn!("[Transport] {} received close frame: {:?}", reader_id, frame);
                    return frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                }
                Some(Err(e)) => {
                    error!("[Transport] {} read error: {}", reader_id, e);
                    reader_events.error(e.to_string());
                    return (ABNORMAL_CLOSURE, e.to_string());
                }
                None => {
                    info!("[Transport] {} stream ended", reader_id);
                    return (ABNORMAL_CLOSURE, "stream ended".to_string());
                }
            }
        }
    });

    let (code, reason) = tokio::select! {
        closed = &mut reader => {
            writer.abort();
            closed.unwrap_or((ABNORMAL_CLOSURE, "reader task panicked".to_string()))
        }
        written = &mut writer => {
            reader.abort();
            match written {
                Ok(Some(cause)) => {
                    events.error(cause.clone());
                    (ABNORMAL_CLOSURE, cause)
                }
                _ => (NORMAL_CLOSURE, "closed by client".to_string()),
            }
        }
    };

    handle.set_ready_state(ReadyState::Closed);
    info!("[Transport] {} closed (code {})", id, code);
    events.closed(code, reason);
}

async fn open_socket(
    request: &ConnectRequest,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    RealtimeError,
> {
    let mut ws_request = request
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| RealtimeError::WebsocketError(format!("Invalid WebSocket request: {}", e)))?;
    if !request.protocols.is_empty() {
        let value = HeaderValue::from_str(&request.protocols.join(", ")).map_err(|e| {
            RealtimeError::WebsocketError(format!("Invalid sub-protocol list: {}", e))
        })?;
        ws_request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }
    let (ws_stream, response) = connect_async(ws_request)
        .await
        .map_err(|e| RealtimeError::WebsocketError(format!("WebSocket connection failed: {}", e)))?;
    debug!("[Transport] Handshake response: {:?}", response.status());
    Ok(ws_stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SharedChannel;

    #[test]
    fn test_handle_only_sends_when_open() {
        let (handle, mut rx) = TransportHandle::new(1, "ws://x.test/ws/metrics");
        assert!(!handle.send_text("early"));

        handle.set_ready_state(ReadyState::Open);
        assert!(handle.send_text("hello"));
        assert_eq!(rx.try_recv().ok(), Some(OutboundFrame::Text("hello".to_string())));

        handle.close(1000, "Normal closure");
        assert_eq!(handle.ready_state(), ReadyState::Closing);
        assert!(!handle.send_text("late"));
        assert_eq!(
            rx.try_recv().ok(),
            Some(OutboundFrame::Close {
                code: 1000,
                reason: "Normal closure".to_string()
            })
        );

        handle.close(1000, "twice");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_clones_share_identity() {
        let (a, _rx) = TransportHandle::new(1, "ws://x.test");
        let (b, _rx2) = TransportHandle::new(1, "ws://x.test");
        assert!(a.same_transport(&a.clone()));
        assert!(!a.same_transport(&b));
    }

    #[test]
    fn test_events_are_tagged_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new(ConnectionId::shared(SharedChannel::Metrics), 7, tx);
        events.opened();
        events.closed(1006, "gone");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.generation, 7);
        assert_eq!(first.event, TransportEvent::Opened);
        let second = rx.try_recv().unwrap();
        assert_eq!(
            second.event,
            TransportEvent::Closed {
                code: 1006,
                reason: "gone".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        // Accepts TCP but never answers the upgrade.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId::shared(SharedChannel::Metrics);
        let request = ConnectRequest {
            connection_id: id.clone(),
            generation: 3,
            url: Url::parse(&format!("ws://{}/ws/metrics", addr)).unwrap(),
            protocols: Vec::new(),
            connect_timeout: Duration::from_millis(200),
        };
        let handle = WsConnector.open(request, TransportEvents::new(id, 3, tx));

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("notice before the outer timeout")
            .unwrap();
        assert!(matches!(first.event, TransportEvent::Error(ref cause) if cause.contains("timed out")));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second.event,
            TransportEvent::Closed { code: ABNORMAL_CLOSURE, .. }
        ));
        assert_eq!(handle.ready_state(), ReadyState::Closed);
        server.abort();
    }
}
