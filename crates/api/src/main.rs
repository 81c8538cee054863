//! Relay API server binary.
//!
//! Usage:
//!   relay-api --config config.toml
//!   relay-api --port 8055
//!   relay-api --port 8055 --bind 0.0.0.0 --deployment mas-coordinator
//!
//! # Environment Variables
//!
//! - `DIAL_ENDPOINT`, `DEPLOYMENT_NAME`, `DIAL_API_KEY` - Routing LLM
//! - `UMS_AGENT_ENDPOINT` - Users Management Service agent
//! - `GPA_AGENT_ENDPOINT` - General-purpose agent
//! - `RELAY_BIND_ADDR` - Server bind address (default: 127.0.0.1)
//! - `RELAY_DEPLOYMENT` - Deployment name served by this relay
//! - `RELAY_CORS_ORIGINS` - CORS allowed origins (comma-separated)

use anyhow::Context;
use relay_api::{serve, AppState, DEFAULT_DEPLOYMENT};
use relay_coordinator::CoordinatorConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PORT: u16 = 8055;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,relay_api=debug,relay_coordinator=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut port = DEFAULT_PORT;
    let mut config_path: Option<String> = None;
    let mut bind_addr: Option<String> = None;
    let mut deployment: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port = args[i + 1]
                        .parse()
                        .with_context(|| format!("Invalid port number '{}'", args[i + 1]))?;
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    bind_addr = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--deployment" => {
                if i + 1 < args.len() {
                    deployment = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Relay API Server");
                println!();
                println!("Usage: relay-api [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -p, --port <PORT>        Port to listen on (default: {DEFAULT_PORT})");
                println!(
                    "  -b, --bind <ADDR>        Bind address (default: 127.0.0.1, env: RELAY_BIND_ADDR)"
                );
                println!("  -c, --config <FILE>      Path to config.toml file");
                println!(
                    "      --deployment <NAME>  Deployment name to serve (default: {DEFAULT_DEPLOYMENT}, env: RELAY_DEPLOYMENT)"
                );
                println!("  -h, --help               Show this help message");
                println!();
                println!("Environment variables:");
                println!("  DIAL_ENDPOINT            Routing LLM endpoint");
                println!("  DEPLOYMENT_NAME          Routing LLM deployment");
                println!("  DIAL_API_KEY             Internal key for the routing LLM");
                println!("  UMS_AGENT_ENDPOINT       Users Management Service agent endpoint");
                println!("  GPA_AGENT_ENDPOINT       General-purpose agent endpoint");
                println!("  RELAY_CORS_ORIGINS       CORS allowed origins (comma-separated)");
                return Ok(());
            }
            other => {
                tracing::warn!(argument = %other, "Ignoring unknown argument");
            }
        }
        i += 1;
    }

    // CLI flag > env var > default
    let host = bind_addr
        .or_else(|| std::env::var("RELAY_BIND_ADDR").ok())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    if host == "0.0.0.0" {
        tracing::warn!(
            "Server binding to 0.0.0.0 exposes the relay to all network interfaces. \
             Callers' Api-Key headers are forwarded to the general-purpose agent."
        );
    }

    let deployment = deployment
        .or_else(|| std::env::var("RELAY_DEPLOYMENT").ok())
        .unwrap_or_else(|| DEFAULT_DEPLOYMENT.to_string());

    let cors_origins: Option<Vec<String>> = std::env::var("RELAY_CORS_ORIGINS")
        .ok()
        .map(|s| s.split(',').map(|o| o.trim().to_string()).collect());

    let config = if let Some(path) = config_path {
        tracing::info!(path = %path, "Loading configuration");
        CoordinatorConfig::from_file(&path)?
    } else {
        tracing::info!("Using default configuration");
        CoordinatorConfig::default()
    }
    .apply_env();

    let state = AppState::new(config)?.with_deployment(deployment);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    serve(Arc::new(state), addr, cors_origins).await?;

    Ok(())
}
