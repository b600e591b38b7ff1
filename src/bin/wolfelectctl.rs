//! WolfElectCtl - Command line tool for querying WolfElect participants
//!
//! Usage:
//!   wolfelectctl status      - Show leadership status of a participant
//!   wolfelectctl health      - Check that a participant is healthy

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use wolfelect::api::{HealthResponse, StatusResponse};

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080";

/// WolfElect Control Tool
#[derive(Parser)]
#[command(name = "wolfelectctl")]
#[command(about = "Query WolfElect election participants", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "wolfelect.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show leadership status of the participant
    Status,
    /// Check participant health
    Health,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default)]
    bind_address: Option<String>,
}

/// Resolve the API endpoint from the flag, then the config file
fn resolve_endpoint(cli: &Cli) -> String {
    if let Some(endpoint) = &cli.endpoint {
        return endpoint.trim_end_matches('/').to_string();
    }

    let bind = std::fs::read_to_string(&cli.config)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .and_then(|config| config.api.bind_address);

    match bind {
        Some(addr) => match addr.strip_prefix("0.0.0.0:") {
            Some(port) => format!("http://127.0.0.1:{}", port),
            None => format!("http://{}", addr),
        },
        None => DEFAULT_ENDPOINT.to_string(),
    }
}

// ============ Main ============

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let endpoint = resolve_endpoint(&cli);

    match cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Health => show_health(&endpoint).await,
    }
}

// ============ Commands ============

async fn show_status(endpoint: &str) -> anyhow::Result<()> {
    let url = format!("{}/status", endpoint);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {}", url))?;

    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }
    let status: StatusResponse = response.json().await.context("malformed status response")?;

    println!();
    println!("WolfElect Participant Status (wolfelectctl v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    println!("Participant:   {}", status.participant_id);
    println!("Election:      {}", status.election_path);

    let role = match (&status.state, status.is_leader) {
        (_, true) => "\x1b[1;34mLEADER\x1b[0m".to_string(),
        (Some(_), false) => match &status.leader_id {
            Some(leader) => format!("standby (leader: {})", leader),
            None => "\x1b[33mstandby (leader unknown)\x1b[0m".to_string(),
        },
        (None, false) => "pending".to_string(),
    };
    println!("Role:          {}", role);
    println!("Transitions:   {}", status.transitions);
    match status.last_change {
        Some(at) => println!("Last Change:   {}", at.to_rfc3339()),
        None => println!("Last Change:   never"),
    }
    println!(
        "Connection:    {} (session {:#x})",
        status
            .connection_state
            .map(|s| s.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        status.session_id
    );
    if !status.running {
        println!("\x1b[31mElection has ended\x1b[0m");
    }
    println!();

    Ok(())
}

async fn show_health(endpoint: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", endpoint);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {}", url))?;

    let health: HealthResponse = response.json().await.context("malformed health response")?;
    if health.healthy {
        println!(
            "\x1b[32m✓\x1b[0m {} is healthy{}",
            health.participant_id,
            if health.is_leader { " (leader)" } else { "" }
        );
        Ok(())
    } else {
        bail!("{} is unhealthy", health.participant_id)
    }
}
