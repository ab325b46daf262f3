//! Casebook server binary

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use casebook::{config::Args, server, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("casebook={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Casebook v{}", env!("CARGO_PKG_VERSION"));
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Public URL: {}", args.public_base());
    info!("Frontend: {}", args.frontend_url);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!(
        "Engine: {}",
        args.engine_url.as_deref().unwrap_or("built-in outline")
    );
    info!(
        "OAuth provider: {}",
        if args.oauth.is_configured() { "configured client" } else { "loopback (dev)" }
    );
    info!("======================================");

    let state = Arc::new(AppState::from_args(args)?);
    server::run(state).await?;

    Ok(())
}
