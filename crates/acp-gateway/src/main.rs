// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use acp_gateway::{build_router, build_state, spawn_background};
use acp_toolproto::{HttpToolTransport, MockToolTransport, ToolTransport};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "acp-gateway", version, about = "Automation control plane gateway")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bind address from the config.
    #[arg(long)]
    bind: Option<String>,

    /// Register an HTTP tool engine as `name=url`. Repeatable.
    #[arg(long = "engine")]
    engines: Vec<String>,

    /// Register an in-process mock engine by name. Repeatable; development
    /// only.
    #[arg(long = "mock-engine")]
    mock_engines: Vec<String>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("acp=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("acp=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = acp_config::load_config(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    for warning in acp_config::warnings(&config) {
        warn!(target: "acp.gateway", %warning, "configuration warning");
    }

    let mut engines: HashMap<String, Arc<dyn ToolTransport>> = HashMap::new();
    for spec in &args.engines {
        let Some((name, url)) = spec.split_once('=') else {
            bail!("--engine expects name=url, got '{spec}'");
        };
        engines.insert(name.to_string(), Arc::new(HttpToolTransport::new(url)));
    }
    for name in &args.mock_engines {
        engines.insert(name.clone(), Arc::new(MockToolTransport::new()));
    }
    if engines.is_empty() {
        bail!("no engines registered; pass --engine name=url (or --mock-engine for development)");
    }

    let state = build_state(&config, engines)?;
    let _sweeper = spawn_background(&state);

    let app = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("bind {}", config.server.bind))?;
    info!(
        target: "acp.gateway",
        bind = %config.server.bind,
        data_dir = %config.server.data_dir,
        "acp-gateway listening"
    );

    axum::serve(listener, app).await.context("serve")
}
