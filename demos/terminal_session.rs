// demos/terminal_session.rs
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vapor_realtime::{
    auth::TokenStore,
    config::RealtimeConfig,
    types::{ConnectionId, IsolatedChannel, WireMessage},
    websocket::{IsolatedOptions, RealtimeManager, Route},
};

/// Opens an isolated terminal channel and forwards stdin lines to it.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();
    dotenv::dotenv().ok();

    let config = RealtimeConfig::from_env()?;
    let token = env::var("VAPOR_TOKEN").unwrap_or_default();
    let session_id = env::args().nth(1).unwrap_or_else(|| "demo-shell".to_string());
    let container = env::var("VAPOR_CONTAINER").ok();

    let manager = RealtimeManager::builder()
        .config(config)
        .auth(TokenStore::with_token(token))
        .start()?;

    let mut options = IsolatedOptions::new().protocol("tty");
    if let Some(container) = container {
        options = options.param("container", container);
    }
    let transport = manager
        .create_isolated(IsolatedChannel::Terminals, session_id.as_str(), options)
        .await?;
    info!("Terminal transport for {} at {}", session_id, transport.url());

    let id = ConnectionId::isolated(IsolatedChannel::Terminals, session_id.as_str());
    let _output = manager
        .attach(
            &id,
            Route::new(|msg| {
                if let Some(data) = msg
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("data"))
                    .and_then(|d| d.as_str())
                {
                    print!("{}", data);
                }
                Ok(())
            })
            .message_types(["output", "stdout"]),
        )
        .await?;

    match manager.wait_authenticated(&id).await {
        Ok(session) => info!("Authenticated as {:?}", session.username),
        Err(e) => warn!("Continuing unauthenticated: {}", e),
    }

    println!("Type commands, Ctrl+D to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = WireMessage::new("input")
            .with_payload(serde_json::json!({ "data": format!("{}\n", line) }));
        manager.send(&id, input).await?;
    }

    manager
        .close_isolated(IsolatedChannel::Terminals, session_id.as_str())
        .await?;
    manager.shutdown().await?;
    Ok(())
}
