//! xp-hooks - HTTP endpoint for provider webhooks
//!
//! Serves `GET /webhooks/{provider}` for subscription handshakes and
//! `POST /webhooks/{provider}` for signed deliveries.

use std::sync::Arc;

use clap::Parser;
use libcrosspost::logging::LoggingConfig;
use libcrosspost::service::{CrosspostService, Event};
use libcrosspost::webhooks::router;
use libcrosspost::{Config, CrosspostError, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "xp-hooks")]
#[command(version)]
#[command(about = "HTTP endpoint for provider webhooks")]
#[command(long_about = "\
xp-hooks - HTTP endpoint for provider webhooks

DESCRIPTION:
    xp-hooks receives webhook traffic from the connected platforms.

    GET  /webhooks/{provider}   subscription handshake (hub.challenge,
                                crc_token, challengeCode)
    POST /webhooks/{provider}   signed event delivery

    Deliveries are verified with the provider's signature scheme before they
    are stored. Deliveries that fail verification are logged and dropped but
    still answered with 200, so providers do not retry them.

CONFIGURATION:
    [webhooks]
    bind = \"127.0.0.1:8787\"

    [providers.facebook]
    webhook_secret_env = \"FACEBOOK_APP_SECRET\"
    verify_token_env = \"FACEBOOK_VERIFY_TOKEN\"

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (open requests finish first)

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Address to listen on (overrides config)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "xp-hooks stopped with an error");
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(bind) = cli.bind {
        config.webhooks.bind = bind;
    }
    let bind = config.webhooks.bind.clone();

    let service = CrosspostService::from_config(config).await?;
    spawn_event_log(&service);

    let app = router(Arc::new(service.webhook_ingestor()));

    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|e| CrosspostError::InvalidInput(format!("Cannot bind {}: {}", bind, e)))?;
    info!(bind = %bind, "xp-hooks listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| CrosspostError::InvalidInput(format!("Server error: {}", e)))?;

    info!("xp-hooks stopped");
    Ok(())
}

/// Log stored webhook events at info level
fn spawn_event_log(service: &CrosspostService) {
    let mut events = service.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Event::WebhookReceived {
                platform,
                event_type,
                post_id,
            } = event
            {
                info!(platform, event_type, post_id = ?post_id, "Webhook stored");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Received shutdown signal, stopping gracefully...");
}
