// demos/metrics_stream.rs
use std::env;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vapor_realtime::{
    auth::TokenStore,
    config::RealtimeConfig,
    types::{active_connections, total_connections, EventKind, SharedChannel},
    websocket::{RealtimeManager, Route},
};

/// Sets up logging; `RUST_LOG=vapor_realtime=debug` shows the manager's decisions.
fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();
    dotenv::dotenv().ok();

    let config = RealtimeConfig::from_env()?;
    let token = env::var("VAPOR_TOKEN").unwrap_or_default();
    if token.is_empty() {
        warn!("VAPOR_TOKEN not set, connecting without credentials");
    }
    info!("Connecting to {}", config.ws_base_url);

    let manager = RealtimeManager::builder()
        .config(config)
        .auth(TokenStore::with_token(token))
        .start()?;

    // Print connection lifecycle changes as they happen
    let mut events = manager.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.kind {
                EventKind::Message(_) => {}
                EventKind::Reconnecting { attempt, delay } => warn!(
                    "{} reconnecting (attempt {}) in {:?}",
                    event.connection_id, attempt, delay
                ),
                EventKind::Error(cause) => error!("{}: {}", event.connection_id, cause),
                other => info!("{}: {:?}", event.connection_id, other),
            }
        }
    });

    let _metrics = manager
        .subscribe(
            SharedChannel::Metrics,
            Route::new(|msg| {
                let cpu = msg
                    .payload
                    .as_ref()
                    .and_then(|p| p.pointer("/cpu/usage"))
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| anyhow::anyhow!("metrics frame without cpu.usage"))?;
                println!("cpu usage: {:.1}%", cpu);
                Ok(())
            })
            .message_type("metrics")
            .on_error(|e| eprintln!("Skipping frame: {}", e)),
        )
        .await?;

    let _events = manager
        .subscribe(
            SharedChannel::Events,
            Route::new(|msg| {
                println!("event {}: {}", msg.message_type, msg.payload.clone().unwrap_or_default());
                Ok(())
            }),
        )
        .await?;

    // Keep the streams alive for a while
    println!("Listening for 60 seconds...");
    for _ in 0..6 {
        sleep(Duration::from_secs(10)).await;
        let health = manager.health().borrow().clone();
        println!(
            "{}/{} connections up",
            active_connections(&health),
            total_connections(&health)
        );
    }

    manager.shutdown().await?;
    println!("Stopped.");
    Ok(())
}
