//! yues-bridge - run scripts against a yues server from the command line.
//!
//! Usage: `yues-bridge [SCRIPT]...`
//!
//! Starts a server session configured from the environment, prints every
//! posted message as a JSON line, evaluates each SCRIPT once and prints its
//! result, then shuts the server down.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yues_bridge::{Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "yues_bridge=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    tracing::info!("Starting yues-bridge v{}", env!("CARGO_PKG_VERSION"));

    let scripts: Vec<String> = std::env::args().skip(1).collect();
    let server = Server::new(ServerConfig::from_env());

    server.start().await.context("Failed to start yues server")?;
    server
        .on_notification(|value| println!("{}", value))
        .context("Failed to subscribe to server messages")?;

    let result = run_scripts(&server, &scripts).await;

    // Always stop the child, even when a script failed
    match server.shutdown().await {
        Ok(Some(outcome)) => tracing::info!(
            "Server stopped by {:?} in {:?}",
            outcome.stopped_by,
            outcome.elapsed
        ),
        Ok(None) => {}
        Err(e) => tracing::error!("Shutdown error: {}", e),
    }

    if let Err(e) = &result {
        tracing::error!("Application error: {:#}", e);
    }
    result
}

async fn run_scripts(server: &Server, scripts: &[String]) -> Result<()> {
    for script in scripts {
        let value = server
            .exec(script, &[], Vec::new())
            .await
            .with_context(|| format!("Script failed: {}", script))?;
        println!("{}", serde_json::to_string(&value)?);
    }
    Ok(())
}
