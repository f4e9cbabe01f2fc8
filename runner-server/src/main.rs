//! Runner server - HTTP control surface and live event stream for runs.

mod error;
mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use runner::io::config::load_config;
use runner::io::init::{DataPaths, ensure_data_dirs};
use runner::logging;
use runner::orchestrator::RunEnv;
use runner::start::reconcile_runs;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "runner-server")]
#[command(about = "HTTP control surface for agent task runs")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Data directory holding spec, task list, state, logs, and config
    #[arg(long, env = "RUNNER_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("runner=info,runner_server=info");

    let args = Args::parse();

    let paths = DataPaths::new(&args.data_dir);
    ensure_data_dirs(&paths)?;
    let config = load_config(&paths.config_path)?;
    info!(data_dir = %paths.root.display(), dry_run = config.agent.dry_run, "starting runner-server");

    let env = RunEnv::new(paths, config);
    reconcile_runs(&env.store, None).await?;

    let state = AppState::new(env);
    let app = routes::router(state.clone());

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", args.bind, args.port))?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .context("serve")?;

    state.shutdown().await;
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("ctrl-c handler unavailable; shutting down");
    }
    info!("shutdown requested");
    state.begin_shutdown();
}
