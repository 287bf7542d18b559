//! xp-creds - Manage provider connections and vault keys
//!
//! Tokens are only ever written sealed by the vault and are never printed.

use std::io::{self, Write};

use anyhow::Result;
use clap::{Parser, Subcommand};
use libcrosspost::logging::LoggingConfig;
use libcrosspost::service::{ConnectionService, CrosspostService};
use libcrosspost::{Config, CrosspostError, Provider};
use tracing::error;

#[derive(Parser)]
#[command(name = "xp-creds")]
#[command(version)]
#[command(about = "Manage provider connections and vault keys")]
#[command(long_about = "\
xp-creds - Manage provider connections and vault keys

DESCRIPTION:
    Connect an owner to a provider by exchanging an OAuth authorization code,
    list and remove connections, force a token refresh, and re-seal every
    stored token under the current vault key.

    Vault keys are read from the environment variables named in [vault.keys].

USAGE EXAMPLES:
    # Exchange an authorization code
    xp-creds connect --owner u1 --provider linkedin \\
        --code <CODE> --redirect-uri https://app.example/callback

    # After adding key version 2 and setting current_version = 2
    xp-creds rotate

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Reconnect required or configuration error
    3 - Invalid input
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Exchange an authorization code and store the connection
    Connect {
        #[arg(long)]
        owner: String,

        /// Provider name (instagram, tiktok, twitter, linkedin, pinterest, youtube, facebook)
        #[arg(long)]
        provider: String,

        /// Authorization code; read from stdin when omitted
        #[arg(long)]
        code: Option<String>,

        #[arg(long)]
        redirect_uri: String,
    },

    /// List connections (without showing tokens)
    List {
        /// Only this owner's connections
        #[arg(long)]
        owner: Option<String>,
    },

    /// Remove a connection
    Disconnect {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        provider: String,
    },

    /// Refresh a connection's access token now
    Refresh {
        #[arg(long)]
        owner: String,

        #[arg(long)]
        provider: String,
    },

    /// Re-seal every stored token under the current key version
    Rotate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run_command(cli.command).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<CrosspostError>()
            .map(CrosspostError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn connections() -> Result<ConnectionService> {
    let config = Config::load()?;
    let service = CrosspostService::from_config(config).await?;
    Ok(service.connections()?)
}

async fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Connect {
            owner,
            provider,
            code,
            redirect_uri,
        } => {
            let provider: Provider = provider.parse()?;
            let code = match code {
                Some(code) => code,
                None => read_code()?,
            };
            let summary = connections()
                .await?
                .connect(&owner, provider, &code, &redirect_uri)
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::List { owner } => {
            let list = connections().await?.list(owner.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        Commands::Disconnect { owner, provider } => {
            let provider: Provider = provider.parse()?;
            if connections().await?.disconnect(&owner, provider).await? {
                println!("✓ Disconnected {} for {}", provider.display_name(), owner);
            } else {
                return Err(CrosspostError::NotFound(format!(
                    "{} connection for {}",
                    provider, owner
                ))
                .into());
            }
        }
        Commands::Refresh { owner, provider } => {
            let provider: Provider = provider.parse()?;
            let summary = connections().await?.refresh(&owner, provider).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Rotate => {
            let report = connections().await?.rotate_keys().await?;
            println!(
                "Examined {} connection(s), re-sealed {}",
                report.examined, report.rotated
            );
            for (connection_id, reason) in &report.failed {
                println!("  ✗ {}: {}", connection_id, reason);
            }
            if !report.failed.is_empty() {
                anyhow::bail!("{} connection(s) could not be re-sealed", report.failed.len());
            }
        }
    }
    Ok(())
}

/// Read the authorization code from stdin, prompting when interactive
fn read_code() -> Result<String> {
    eprint!("Authorization code: ");
    io::stderr().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let code = input.trim().to_string();
    if code.is_empty() {
        return Err(CrosspostError::InvalidInput("authorization code is empty".to_string()).into());
    }
    Ok(code)
}
