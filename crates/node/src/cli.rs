//! # weftd CLI
//!
//! clap-based CLI for the weft provisioning daemon. Flags override the
//! config file; the config file fills whatever the flags leave out.
//!
//! Running without a subcommand defaults to `run`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use weft_common::config::{self, Config};
use weft_common::time::now_unix;
use weft_common::Capacity;
use weft_engine::{Engine, EngineConfig, ResultSigner, StaticTwins, Statistics};
use weft_store::FsStore;

use crate::api::{build_router, ApiState};
use crate::identity::NodeIdentity;
use crate::primitives::mock_registry;

/// weftd — per-node provisioning engine of the weft compute fabric
///
/// Accepts signed workload reservations, deploys them through the node's
/// primitive backends, enforces capacity, and decommissions on request or
/// expiry. Survives restart without losing or duplicating reservations.
#[derive(Parser)]
#[command(
    name = "weftd",
    version,
    about = "weftd — per-node provisioning engine of the weft compute fabric"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the provisioning daemon
    Run(RunArgs),

    /// Query a running daemon's health
    Status(StatusArgs),
}

#[derive(Args, Default)]
pub struct RunArgs {
    /// Working directory for the reservation store and node identity
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Listen address for the admission API
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Path to the TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the twins registry file
    #[arg(long)]
    pub twins: Option<PathBuf>,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Address of the running daemon's admission API
    #[arg(long, default_value = "127.0.0.1:2021")]
    pub addr: String,
}

pub async fn run(args: RunArgs) -> Result<()> {
    let file_config = match &args.config {
        Some(path) => config::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let root = args
        .root
        .or_else(|| file_config.data_dir.clone().map(PathBuf::from))
        .context("no data directory configured")?;
    let listen: SocketAddr = match args.listen {
        Some(addr) => addr,
        None => file_config
            .listen_addr
            .as_deref()
            .context("no listen address configured")?
            .parse()
            .context("invalid listen address")?,
    };
    let twins_path = args
        .twins
        .or_else(|| file_config.twins_file.clone().map(PathBuf::from));

    std::fs::create_dir_all(&root)
        .with_context(|| format!("creating data directory {}", root.display()))?;

    let identity = Arc::new(
        NodeIdentity::load_or_generate(root.join("identity.key"))
            .context("loading node identity")?,
    );
    let node_id = file_config
        .node_id
        .clone()
        .unwrap_or_else(|| identity.node_id()[..16].to_string());

    let twins = Arc::new(match twins_path {
        Some(path) if path.exists() => StaticTwins::load(&path)
            .with_context(|| format!("loading twins registry {}", path.display()))?,
        Some(path) => {
            warn!(path = %path.display(), "twins registry not found; no caller can authenticate");
            StaticTwins::default()
        }
        None => {
            warn!("no twins registry configured; no caller can authenticate");
            StaticTwins::default()
        }
    });

    if !file_config.mock_primitives.unwrap_or(true) {
        bail!("real primitive backends are wired in by the platform build; only mock mode is available here");
    }
    let registry = mock_registry(Duration::ZERO, 0.0);

    let totals: Capacity = file_config
        .capacity
        .as_ref()
        .map(|c| c.to_capacity())
        .unwrap_or_default();
    let reserved: Capacity = file_config
        .reserved
        .as_ref()
        .map(|c| c.to_capacity())
        .unwrap_or_default();

    let store = Arc::new(FsStore::open(&root).context("opening reservation store")?);
    let engine_config = EngineConfig {
        janitor_interval: Duration::from_secs(file_config.janitor_interval_secs.unwrap_or(10)),
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        store,
        Statistics::new(totals, reserved),
        twins.clone(),
        twins,
        registry,
        identity.clone() as Arc<dyn ResultSigner>,
        engine_config,
    );
    let handle = engine.handle();
    let engine_task = tokio::spawn(engine.run());

    let state = Arc::new(ApiState {
        handle: handle.clone(),
        node_id: node_id.clone(),
        start_time: now_unix(),
    });
    let router = build_router(state);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;

    info!(%node_id, %listen, root = %root.display(), total = %totals, "weftd started");

    let shutdown_handle = handle.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
            shutdown_handle.shutdown();
        })
        .await
        .context("admission api server failed")?;

    engine_task.await.context("engine task panicked")??;
    info!("weftd stopped");
    Ok(())
}

pub async fn status(args: StatusArgs) -> Result<()> {
    let url = format!("http://{}/api/v1/health", args.addr);
    let resp = reqwest::get(&url)
        .await
        .with_context(|| format!("querying {url}"))?;
    let body: serde_json::Value = resp.json().await.context("decoding health response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
