#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # dockd
//!
//! Node agent for managed worker hosts.
//!
//! dockd keeps an outbound tunnel open to the controller, runs the service
//! lifecycle scripts the controller asks for, and relays deployment
//! artifacts from the controller to those scripts.
//!
//! ## Listeners
//!
//! | Port  | Method  | Path          | Description                             |
//! |-------|---------|---------------|-----------------------------------------|
//! | 10002 | CONNECT | `/dock`       | Inbound tunnel (peer dials the agent)   |
//! | 10002 | GET     | `/api/health` | Liveness probe with tunnel status       |
//! | 10002 | GET     | anything else | Identification string                   |
//! | 7001  | GET     | `/{service}`  | Artifact relay to the controller        |
//!
//! ## Architecture
//!
//! ```text
//! main.rs           — entry point, CLI, wiring, graceful shutdown
//! config.rs         — TOML + env configuration, remote endpoint parsing
//! state.rs          — AgentState shared with control handlers
//! routes/
//!   mod.rs          — control router, identification string
//!   health.rs       — GET /api/health
//! tunnel/
//!   mod.rs          — frames, handshake, tunnel state and stats
//!   session.rs      — framed peer: commands, results, keep-alive
//!   supervisor.rs   — outbound CONNECT, reconnect backoff
//!   acceptor.rs     — inbound CONNECT upgrade
//! dispatch.rs       — command table → scripts, result shaping
//! script/
//!   mod.rs          — Executor trait, executor binary resolution
//!   process.rs      — spawn, first-JSON-value capture, completion
//! relay.rs          — streaming artifact relay
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use dockd::tunnel::{Handshake, TunnelStats};
use dockd::{relay, routes, script};
use dockd::{AgentState, ArtifactRelay, Config, ConfigError, Dispatcher, ScriptExecutor, Supervisor};

/// Node agent: controller tunnel, service scripts, artifact relay.
#[derive(Parser)]
#[command(name = "dockd", version)]
struct Cli {
    /// Controller address, `[key@]host[:port]` (default `localhost:10002`).
    remote: Option<String>,
    /// Extra capability tag announced in the handshake (repeatable).
    #[arg(long = "tag", value_name = "TAG")]
    tags: Vec<String>,
    /// Log executor spawn arguments and raw output.
    #[arg(long)]
    debug: bool,
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dockd: {e}");
            return ExitCode::FAILURE;
        }
    };

    // RUST_LOG wins, then --debug, then the config file
    let level = if cli.debug {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(ref remote) = cli.remote {
        config.remote.address.clone_from(remote);
    }
    config.device.tags.extend(cli.tags.iter().cloned());
    Ok(config)
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    // Everything fatal is checked before anything is served.
    let remote = config.remote_endpoint()?;
    let program = script::resolve_program(&config.executor.candidates)?;
    let control_addr = config.control_addr()?;
    let relay_addr = config.relay_addr()?;
    let identity = config.identity();
    let tags = config.tags();

    info!("dockd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Identity: {identity}, tags: {tags:?}");
    info!("Controller: {}", remote.authority());
    info!("Executor: {}", program.display());

    let executor = ScriptExecutor::new(
        program,
        config.executor.policy_args.clone(),
        config.scripts_dir(),
        config.executor.script_extension.clone(),
    );
    let dispatcher = Dispatcher::new(
        Arc::new(executor),
        identity.clone(),
        &config.fetch_helper(),
        relay_addr.port(),
    );
    let heartbeat = Duration::from_secs(config.tunnel.heartbeat_interval_secs.max(1));
    let tunnel_stats = Arc::new(TunnelStats::new());

    let (_, relay_task) =
        relay::spawn(ArtifactRelay::new(remote.clone(), identity.clone()), relay_addr).await?;

    let state = AgentState {
        identity: identity.clone(),
        dispatcher: dispatcher.clone(),
        heartbeat,
        tunnel_stats: tunnel_stats.clone(),
        start_time: Instant::now(),
    };
    let listener = TcpListener::bind(control_addr).await?;
    info!("Control endpoint listening on {control_addr}");

    let supervisor_task = Supervisor::new(
        remote,
        Handshake::dock(identity, tags),
        dispatcher,
        heartbeat,
        tunnel_stats,
    )
    .spawn();

    axum::serve(listener, routes::control_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    supervisor_task.abort();
    relay_task.abort();
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
