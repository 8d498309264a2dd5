//! Multiplexed real-time channels for the Vapor console.
//!
//! This module owns every WebSocket the console opens. Consumers never touch a
//! socket directly; they go through a [`RealtimeManager`]:
//!
//! - **Shared channels** (`metrics`, `events`, `notifications`): one connection per
//!   kind, opened by the first [`RealtimeManager::subscribe`] and closed when the
//!   last [`Subscription`] goes away.
//! - **Isolated channels** (`terminals`, `fileTransfers`, `executions`,
//!   `containerLogs`): one connection per `(kind, instance id)`, opened with
//!   [`RealtimeManager::create_isolated`] and closed only by
//!   [`RealtimeManager::close_isolated`].
//!
//! # Architecture
//!
//! A single manager task owns all per-connection state and processes transport
//! notices, timer firings and API calls one at a time:
//!
//! - Credentials are sent in-band right after open; authentication never blocks the open
//! - Frames sent while a connection is down are buffered (100 per connection, oldest evicted)
//! - Abnormal closes are retried with exponential backoff and jitter, per channel kind
//! - Metrics, terminal and execution channels are pinged every 30 s and force-reconnected
//!   after 60 s of silence
//! - Each inbound frame is fanned out to every matching subscriber; a failing
//!   subscriber never affects the others
//!
//! # Usage
//!
//! ```no_run
//! use vapor_realtime::auth::TokenStore;
//! use vapor_realtime::config::RealtimeConfig;
//! use vapor_realtime::types::SharedChannel;
//! use vapor_realtime::websocket::{RealtimeManager, Route};
//!
//! #[tokio::main]
//! async fn main() -> vapor_realtime::Result<()> {
//!     let manager = RealtimeManager::builder()
//!         .config(RealtimeConfig::from_env()?)
//!         .auth(TokenStore::with_token("bearer-token"))
//!         .start()?;
//!
//!     let _metrics = manager
//!         .subscribe(
//!             SharedChannel::Metrics,
//!             Route::new(|msg| {
//!                 println!("metrics: {:?}", msg.payload);
//!                 Ok(())
//!             })
//!             .message_type("metrics"),
//!         )
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.shutdown().await
//! }
//! ```
//!
//! # Reconnection Behavior
//!
//! | kind      | attempts  | initial | max  | multiplier | jitter |
//! |-----------|-----------|---------|------|------------|--------|
//! | metrics   | unlimited | 3 s     | 30 s | 1.5        | yes    |
//! | terminals | 5         | 1 s     | 5 s  | 1.2        | no     |
//! | others    | 10        | 2 s     | 20 s | 1.5        | yes    |
//!
//! A close with code 1000 is never retried. Once attempts run out the connection
//! stays `disconnected` until [`RealtimeManager::reconnect`] is called.

pub mod codec;
pub mod endpoints;
pub mod heartbeat;
pub mod machine;
pub mod manager;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod timers;
pub mod tracker;
pub mod transport;

// Re-export the main types for easier access
pub use codec::{Codec, JsonCodec};
pub use endpoints::{EndpointRegistry, IsolatedOptions, ReconnectPolicy};
pub use manager::{RealtimeManager, RealtimeManagerBuilder, Subscription};
pub use router::{Route, RouteReport, SubscriberId};
pub use transport::{
    ConnectRequest, Connector, OutboundFrame, ReadyState, TransportEvents, TransportHandle,
    WsConnector,
};
