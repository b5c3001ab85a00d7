//! nacd - network-access-control lease daemon.
//!
//! Long-running service pairing a DHCP hook socket server with a periodic
//! reconciliation scheduler. The hook client (`nacd-dhcp-script`) forwards
//! `dnsmasq --dhcp-script` invocations to this daemon over a Unix socket;
//! the scheduler keeps the materialized lease state consistent with the
//! operator-declared host reservations.
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown.
//! - `SIGHUP`: trigger a forced reconciliation pass (full re-validation).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nacd_core::config::ServiceConfig;
use nacd_daemon::release::ReleaseActionSink;
use nacd_daemon::repository::{ActionSink, ReservationRepository, SqliteReservationRepository};
use nacd_daemon::scheduler::{ReconcileScheduler, Refresh};
use nacd_daemon::server::LeaseServer;
use nacd_daemon::store::LeaseStore;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// nacd daemon - DHCP lease tracking and reconciliation
#[derive(Parser, Debug)]
#[command(name = "nacd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/nacd/nacd.toml")]
    config: PathBuf,

    /// Override the hook socket path from the configuration
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = if args.config.exists() {
        ServiceConfig::from_file(&args.config)
            .with_context(|| format!("loading configuration from {}", args.config.display()))?
    } else {
        info!(
            config = %args.config.display(),
            "configuration file not found; using defaults"
        );
        ServiceConfig::default()
    };
    if let Some(socket) = args.socket {
        config.server.socket_path = socket;
    }
    config.validate().context("validating configuration")?;

    let store = Arc::new(
        LeaseStore::open(&config.database.path).with_context(|| {
            format!("opening lease store at {}", config.database.path.display())
        })?,
    );
    let repository: Arc<dyn ReservationRepository> = Arc::new(
        SqliteReservationRepository::open(&config.database.path)
            .context("opening reservation repository")?,
    );
    let sink: Arc<dyn ActionSink> = Arc::new(ReleaseActionSink::new(
        Arc::clone(&store),
        config.reconcile.dhcp_server_ip,
        config.reconcile.release_from_ip,
    ));

    // Prefer an inherited (socket-activated) listener so no lease event is
    // lost across restarts of this daemon.
    let server = match LeaseServer::inherited(&config.server, Arc::clone(&store))
        .context("adopting inherited socket")?
    {
        Some(server) => server,
        None => LeaseServer::bind(&config.server, Arc::clone(&store))
            .context("binding hook socket")?,
    };

    let (scheduler, handle) =
        ReconcileScheduler::new(&config.reconcile, repository, sink, Arc::clone(&store));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(shutdown_rx.clone()));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            },
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            },
            _ = sighup.recv() => {
                info!("received SIGHUP, forcing reconciliation");
                handle.trigger(Refresh::Forced);
            },
        }
    }

    shutdown_tx.send(true).ok();
    if let Err(e) = server_task.await {
        warn!(error = %e, "server task ended abnormally");
    }
    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "scheduler task ended abnormally");
    }
    Ok(())
}
