//! WolfElect - Leader Election Daemon
//!
//! Joins a leader election on a coordination store and reports every
//! leadership transition, or runs the coordination server itself.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfelect::api::{AppState, HttpServer};
use wolfelect::client::Connection;
use wolfelect::config::ElectConfig;
use wolfelect::election::Election;
use wolfelect::error::Result;
use wolfelect::network::CoordinationServer;
use wolfelect::store::MemoryStore;

/// WolfElect - Leader Election over a Coordination Store
#[derive(Parser)]
#[command(name = "wolfelect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfelect.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordination server
    Serve {
        /// Address to listen on, overrides server.bind_address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Join the configured election
    Run,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfelect.toml")]
        output: PathBuf,

        /// Participant ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind } => {
            let config = load_config(&cli.config, cli.log_level.as_deref())?;
            run_serve(config, bind).await
        }
        Commands::Run => {
            let config = load_config(&cli.config, cli.log_level.as_deref())?;
            run_participant(config).await
        }
        Commands::Init { output, node_id } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, node_id)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(cli.config)
        }
    }
}

/// Load the configuration and install logging from it
fn load_config(path: &std::path::Path, log_level: Option<&str>) -> Result<ElectConfig> {
    match ElectConfig::from_file(path) {
        Ok(config) => {
            init_logging(
                log_level.unwrap_or(&config.logging.level),
                &config.logging.format,
            );
            Ok(config)
        }
        Err(e) => {
            init_logging(log_level.unwrap_or("info"), "pretty");
            tracing::error!("Failed to load configuration from {:?}: {}", path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            Err(e)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

/// Run the coordination server until Ctrl+C
async fn run_serve(config: ElectConfig, bind: Option<String>) -> Result<()> {
    let bind_address = bind.unwrap_or_else(|| config.server.bind_address.clone());
    let server = CoordinationServer::bind(&bind_address, MemoryStore::new(), config.server_tick())
        .await?;
    tracing::info!(address = %server.local_addr()?, "coordination server started");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            server.stop();
        }
    }

    tracing::info!(
        sessions = server.store().session_count(),
        nodes = server.store().node_count(),
        "coordination server stopped"
    );
    Ok(())
}

/// Join the election, serve the status API, and withdraw on Ctrl+C
async fn run_participant(config: ElectConfig) -> Result<()> {
    let path = config.election_path()?;
    tracing::info!(
        participant = %config.node.id,
        path = %path,
        url = %config.coordination.url,
        "Starting WolfElect participant..."
    );

    let conn = Connection::connect(&config.coordination.url, config.session_options()).await?;
    tracing::info!(session = conn.session_id(), "connected to coordination store");

    let (handle, mut states) = Election::new(&conn, path.clone(), config.node.id.clone())
        .stale_timeout(config.stale_timeout())
        .buffer(config.election.buffer)
        .spawn()?;

    let app_state = Arc::new(AppState::new(config.node.id.clone(), path, conn.clone()));
    let api = HttpServer::new(config.api.clone(), Arc::clone(&app_state));
    let api_task = tokio::spawn(async move {
        if let Err(e) = api.start().await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut signalled = false;

    let result = loop {
        tokio::select! {
            next = states.next() => match next {
                Some(Ok(state)) => {
                    tracing::info!(
                        participant = %handle.participant_id(),
                        %state,
                        "leadership changed"
                    );
                    app_state.record(state).await;
                }
                Some(Err(e)) => {
                    tracing::error!(
                        participant = %handle.participant_id(),
                        "election failed: {}",
                        e
                    );
                    break Err(e);
                }
                None => {
                    tracing::info!(participant = %handle.participant_id(), "election ended");
                    break Ok(());
                }
            },
            _ = &mut shutdown, if !signalled => {
                tracing::info!("Received shutdown signal, withdrawing from election");
                signalled = true;
                handle.cancel();
            }
        }
    };

    app_state.finish().await;
    drop(states);
    handle.stopped().await;
    conn.close().await;
    api_task.abort();

    result
}

/// Write a sample configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    std::fs::write(&output, ElectConfig::sample(&node_id))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to point at your coordination store and election path.");
    println!("Then start with: wolfelect --config {} run", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ElectConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Participant ID: {}", config.node.id);
            println!("  Store: {}", config.coordination.url);
            println!("  Election Path: {}", config.election_path()?);
            println!("  Stale Timeout: {} ms", config.election.stale_timeout_ms);
            println!("  Session Timeout: {} ms", config.coordination.session_timeout_ms);
            println!(
                "  HTTP API: {}",
                if config.api.enabled {
                    config.api.bind_address.as_str()
                } else {
                    "disabled"
                }
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
