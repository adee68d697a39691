//! dbdeck - database connection manager
//!
//! Usage:
//!   # Probe a server
//!   dbdeck test --type mysql --host localhost --user root --password secret
//!
//!   # Run a query against a saved profile
//!   dbdeck --config dbdeck.yaml query --profile local "SELECT * FROM users WHERE id = ?" -P 7
//!
//!   # Serve the operation surface as JSON lines on stdin/stdout
//!   dbdeck --config dbdeck.yaml serve

mod cli;
mod serve;
mod settings;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Command, TargetArgs};
use dbdeck_core::profile::{MemoryProfileStore, ProfileStore};
use dbdeck_core::ConnectionManager;
use dbdeck_rdbc::adapter::AdapterRegistry;
use dbdeck_rdbc::connection::ConnectionConfig;
use serve::ServeOptions;
use settings::DeckConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DeckConfig::from_file(path)?,
        None => DeckConfig::default(),
    };

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| config.settings.log_level.clone())
        .unwrap_or_else(|| "info".to_string());

    // stdout carries results; logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let timeouts = config.settings.timeouts.to_driver_timeouts();
    let manager = Arc::new(ConnectionManager::new(
        AdapterRegistry::with_defaults(),
        timeouts,
    ));
    let profiles = MemoryProfileStore::from_profiles(config.profiles.clone());

    match cli.command {
        Command::Test { target } => {
            let connection = resolve_target(&target, &profiles).await?;
            let outcome = manager.test_connection(&connection).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                anyhow::bail!("Test connection failed");
            }
        }
        Command::Query {
            target,
            sql,
            params,
        } => {
            let connection = resolve_target(&target, &profiles).await?;
            let params: Vec<_> = params.iter().map(|p| cli::parse_param(p)).collect();

            let connected = manager.connect(connection).await;
            let Some(id) = connected.id else {
                anyhow::bail!(
                    "{}",
                    connected.message.unwrap_or_else(|| "Connect failed".into())
                );
            };

            let outcome = manager.query(&id, &sql, &params).await;
            manager.shutdown().await;

            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                anyhow::bail!("Query failed");
            }
        }
        Command::Profiles => {
            for name in profiles.list().await? {
                let profile = profiles.require(&name).await?;
                println!(
                    "{:<20} {:<10} {}:{}/{}",
                    name,
                    profile.kind,
                    profile.host(),
                    profile.port(),
                    profile.database.as_deref().unwrap_or("")
                );
            }
        }
        Command::Serve => {
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                tracing::info!("Shutdown signal received");
                signal.cancel();
            });

            let options = ServeOptions {
                reap_interval: Duration::from_secs(config.settings.reap_interval_secs),
            };
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            serve::serve(manager, stdin, tokio::io::stdout(), options, shutdown).await?;
        }
    }

    Ok(())
}

/// Resolve the connection target from a profile name or ad-hoc flags
async fn resolve_target(
    target: &TargetArgs,
    profiles: &MemoryProfileStore,
) -> anyhow::Result<ConnectionConfig> {
    if let Some(name) = &target.profile {
        return profiles
            .require(name)
            .await
            .with_context(|| format!("Cannot use profile '{}'", name));
    }
    target
        .to_config()
        .context("Either --profile or --type is required")
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
