//! pvx - drive the reconciliation engine from a shell.
//!
//! Each invocation runs one lifecycle operation: the desired spec and the
//! tracked state are JSON files, connection settings come from `PVE_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pvx_provisioner::drift::diff;
use pvx_provisioner::{Engine, GuestSpec, ProviderConfig, PveClient, ReadOutcome, TrackedGuest};

/// Reconcile Proxmox VE guests against declarative specs.
#[derive(Debug, Parser)]
#[command(name = "pvx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a guest and write its tracked state.
    Create {
        /// Desired guest spec (JSON).
        #[arg(long)]
        spec: PathBuf,

        /// Where to write the tracked state.
        #[arg(long)]
        state: PathBuf,
    },

    /// Refresh tracked state from the platform.
    Read {
        #[arg(long)]
        state: PathBuf,

        /// Desired spec to compare against; prints the drift.
        #[arg(long)]
        spec: Option<PathBuf>,
    },

    /// Converge a tracked guest onto a desired spec.
    Update {
        #[arg(long)]
        spec: PathBuf,

        #[arg(long)]
        state: PathBuf,
    },

    /// Destroy a tracked guest and remove its state file.
    Delete {
        #[arg(long)]
        state: PathBuf,
    },

    /// Adopt an existing guest.
    Import {
        /// Guest id.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = ProviderConfig::from_env()?;
    info!(
        api_url = %config.client.api_url,
        token_id = %config.client.token_id,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    let client = PveClient::connect(&config.client)
        .await
        .context("failed to connect to the platform")?;
    let engine = Engine::new(Arc::new(client), config.engine).with_shutdown(shutdown_rx);

    match cli.command {
        Command::Create { spec, state } => {
            let spec: GuestSpec = read_json(&spec)?;
            let tracked = engine.create(&spec).await?;
            write_json(&state, &tracked)?;
            println!("created guest {}", tracked.vmid);
        }
        Command::Read { state, spec } => {
            let prior: TrackedGuest = read_json(&state)?;
            match engine.read(&prior).await? {
                ReadOutcome::Present(tracked) => {
                    if let Some(spec) = spec {
                        let desired: GuestSpec = read_json(&spec)?;
                        let drift = diff(&desired, &tracked.spec);
                        if drift.is_empty() {
                            println!("guest {} matches its spec", tracked.vmid);
                        }
                        for field in drift {
                            println!("{}", field);
                        }
                    }
                    write_json(&state, &tracked)?;
                }
                ReadOutcome::Gone => {
                    println!("guest {} no longer exists", prior.vmid);
                    remove_state(&state)?;
                }
            }
        }
        Command::Update { spec, state } => {
            let desired: GuestSpec = read_json(&spec)?;
            let prior: TrackedGuest = read_json(&state)?;
            let tracked = engine.update(&prior, &desired).await?;
            write_json(&state, &tracked)?;
            println!("updated guest {}", tracked.vmid);
        }
        Command::Delete { state } => {
            let prior: TrackedGuest = read_json(&state)?;
            engine.delete(&prior).await?;
            remove_state(&state)?;
            println!("deleted guest {}", prior.vmid);
        }
        Command::Import { id } => {
            engine.import(&id).await?;
        }
    }

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_string_pretty(value)?;
    std::fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))
}

fn remove_state(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}
