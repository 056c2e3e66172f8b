use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Configuration for the tether command runner.
#[derive(Parser, Debug, Clone)]
#[command(name = "tether")]
#[command(about = "Run a command while holding a lock on a resource")]
pub struct Config {
    /// Lock store: flock (local advisory locks) or lease (expiring lease files)
    #[arg(long, default_value = "flock", env = "TETHER_STORE")]
    pub store: StoreKind,

    /// Directory holding lock and lease files
    #[arg(long, env = "TETHER_LOCK_DIR")]
    pub lock_dir: Option<PathBuf>,

    /// Lock lifetime in seconds, refreshed while the command runs
    #[arg(
        long,
        default_value = "300",
        env = "TETHER_TTL",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub ttl: u64,

    /// Wait for the lock instead of giving up when it is held
    #[arg(long, env = "TETHER_BLOCKING")]
    pub blocking: bool,

    /// Take a shared lock (falls back to exclusive on stores without shared locks)
    #[arg(long)]
    pub shared: bool,

    /// Do not refresh the lock while the command runs
    #[arg(long)]
    pub no_refresh: bool,

    /// Resource to lock
    pub resource: String,

    /// Command to run, after `--`
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl Config {
    /// Get the effective lock directory.
    pub fn effective_lock_dir(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(|| {
            dirs::runtime_dir()
                .or_else(dirs::cache_dir)
                .unwrap_or_else(std::env::temp_dir)
                .join("tether")
        })
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    /// Interval between refreshes, half the TTL.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.ttl * 500)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreKind {
    Flock,
    Lease,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Flock => write!(f, "flock"),
            StoreKind::Lease => write!(f, "lease"),
        }
    }
}
