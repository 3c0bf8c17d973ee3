use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use colext::config::Config;
use colext::manager::MetricManager;
use colext::network::{NetworkManager, ShellRunner};
use colext::store::PostgresWriter;

/// Federated-learning testbed device agent.
#[derive(Parser)]
#[command(name = "colext", about)]
struct Cli {
    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("colext {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // All configuration comes from the testbed environment; a missing
    // variable is a fatal config error before any device work begins.
    let cfg = Config::from_env().context("loading configuration from environment")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        client_id = cfg.client_id,
        job_id = %cfg.job_id,
        "starting colext agent",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // 1. Signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // 2. Network emulation first: static rules are a startup precondition.
    let mut network = NetworkManager::new(cfg.network.clone(), Arc::new(ShellRunner))
        .context("loading network rules")?;
    network
        .start(&format!("client-{}", cfg.client_id))
        .await
        .context("starting network manager")?;

    // 3. Metric pipeline; start() blocks until the worker is live.
    let dsn = cfg.storage.dsn.clone();
    let mut manager = MetricManager::start(cfg.monitoring.clone(), cfg.client_db_id, move || {
        let dsn = dsn;
        async move { PostgresWriter::connect(&dsn).await }
    })
    .await?;

    // 4. Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // 5. Graceful shutdown: stop sampling and flush before dropping the
    //    network subscriptions.
    manager.stop().await;
    network.stop().await;

    tracing::info!("colext agent stopped");

    Ok(())
}
