mod config;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tether_lock::{
    require_blocking, FlockStore, LeaseStore, Lock, LockConfig, LockFactory, PersistingStore,
};
use tokio::process::{Child, Command};
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Config, StoreKind};

/// Exit status when the lock is held by someone else (EX_TEMPFAIL).
const EXIT_NOT_ACQUIRED: u8 = 75;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    let dir = config.effective_lock_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create lock dir {}", dir.display()))?;

    info!("Locking \"{}\"", config.resource);
    info!("  Store: {}", config.store);
    info!("  Lock dir: {}", dir.display());
    info!("  TTL: {}s", config.ttl);

    let store: Arc<dyn PersistingStore> = match config.store {
        StoreKind::Flock => Arc::new(FlockStore::new(&dir)?),
        StoreKind::Lease => Arc::new(LeaseStore::new(&dir)?),
    };
    if config.blocking {
        if let Err(e) = require_blocking(store.as_ref()) {
            info!("{} Polling for the lock instead.", e);
        }
    }
    let factory = LockFactory::with_config(
        store,
        LockConfig {
            default_ttl_secs: Some(config.ttl),
            ..LockConfig::default()
        },
    );
    let mut lock = factory.create_lock(config.resource.clone());

    let mut shutdown_rx = create_shutdown_signal();

    let acquired = tokio::select! {
        acquired = acquire(&mut lock, &config) => acquired?,
        _ = shutdown_rx.wait_for(|&v| v) => {
            info!("Interrupted while waiting for the lock");
            return Ok(ExitCode::FAILURE);
        }
    };

    if !acquired {
        info!("\"{}\" is locked by someone else", config.resource);
        return Ok(ExitCode::from(EXIT_NOT_ACQUIRED));
    }

    let outcome = supervise(&mut lock, &config, &mut shutdown_rx).await;

    if let Err(e) = lock.release().await {
        warn!("Failed to release \"{}\": {}", config.resource, e);
    }

    outcome
}

async fn acquire(lock: &mut Lock, config: &Config) -> anyhow::Result<bool> {
    let acquired = if config.shared {
        lock.acquire_read(config.blocking).await?
    } else {
        lock.acquire(config.blocking).await?
    };
    Ok(acquired)
}

/// Run the command, keeping the lock alive until it exits or we are told to stop.
async fn supervise(
    lock: &mut Lock,
    config: &Config,
    shutdown_rx: &mut tokio_watch::Receiver<bool>,
) -> anyhow::Result<ExitCode> {
    let (program, args) = config
        .command
        .split_first()
        .context("No command given")?;

    let mut child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start {}", program))?;
    info!("Started {} (pid {:?})", program, child.id());

    let period = config.refresh_interval();
    let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let refreshing = !config.no_refresh;

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for the command")?;
                info!("{} exited with {}", program, status);
                return Ok(exit_code(status));
            }
            _ = refresh.tick(), if refreshing => {
                if let Err(e) = lock.refresh(None).await {
                    error!("Lost the \"{}\" lock: {}", config.resource, e);
                    stop(&mut child).await;
                    return Ok(ExitCode::FAILURE);
                }
            }
            _ = shutdown_rx.wait_for(|&v| v) => {
                stop(&mut child).await;
                return Ok(ExitCode::FAILURE);
            }
        }
    }
}

async fn stop(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to stop the command: {}", e);
    }
}

fn exit_code(status: std::process::ExitStatus) -> ExitCode {
    match status.code() {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        // Killed by a signal
        None => ExitCode::FAILURE,
    }
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, initiating shutdown");
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
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

        let _ = tx.send(true);
    });

    rx
}
