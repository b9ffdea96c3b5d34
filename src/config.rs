use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Node id mixed into generated identifiers; unique per running instance.
    pub node_id: u16,
    pub gc_grace_secs: i64,
    /// 0 disables the background collector.
    pub gc_interval_secs: u64,
    pub sync_writes: bool,
    pub read_only: bool,
}

/// What the binary should do after loading its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    GcCheck,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Deduplicating object storage service")]
pub struct Args {
    /// Host to bind to (overrides DEDUP_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DEDUP_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where chunk data is stored (overrides DEDUP_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DEDUP_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Identifier node id, 0-1023 (overrides DEDUP_STORE_NODE_ID)
    #[arg(long)]
    pub node_id: Option<u16>,

    /// Seconds unreferenced data survives before GC reclaims it (overrides DEDUP_STORE_GC_GRACE_SECS)
    #[arg(long)]
    pub gc_grace_secs: Option<i64>,

    /// Seconds between GC passes, 0 disables (overrides DEDUP_STORE_GC_INTERVAL_SECS)
    #[arg(long)]
    pub gc_interval_secs: Option<u64>,

    /// fsync every chunk write
    #[arg(long)]
    pub sync_writes: bool,

    /// Reject every write
    #[arg(long)]
    pub read_only: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Run one GC scan over all buckets and exit non-zero on corruption
    #[arg(long, conflicts_with = "migrate")]
    pub gc_check: bool,
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, RunMode)> {
        // --- Environment fallback ---
        let env_host = env::var("DEDUP_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("DEDUP_STORE_PORT", 3000u16)?;
        let env_storage =
            env::var("DEDUP_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/chunks".into());
        let env_db = env::var("DEDUP_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/dedup_store.db".into());
        let env_node = env_or("DEDUP_STORE_NODE_ID", 0u16)?;
        let env_grace = env_or("DEDUP_STORE_GC_GRACE_SECS", 3600i64)?;
        let env_interval = env_or("DEDUP_STORE_GC_INTERVAL_SECS", 600u64)?;
        let env_sync = env_or("DEDUP_STORE_SYNC_WRITES", false)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            node_id: args.node_id.unwrap_or(env_node),
            gc_grace_secs: args.gc_grace_secs.unwrap_or(env_grace),
            gc_interval_secs: args.gc_interval_secs.unwrap_or(env_interval),
            sync_writes: args.sync_writes || env_sync,
            read_only: args.read_only,
        };
        if cfg.gc_grace_secs < 0 {
            bail!("gc grace window must not be negative");
        }

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.gc_check {
            RunMode::GcCheck
        } else {
            RunMode::Serve
        };
        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_and_mode() {
        let args = Args::try_parse_from([
            "dedup-store",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--node-id",
            "12",
            "--gc-grace-secs",
            "5",
            "--gc-check",
        ])
        .unwrap();
        let (cfg, mode) = AppConfig::from_args(args).unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:9000");
        assert_eq!(cfg.node_id, 12);
        assert_eq!(cfg.gc_grace_secs, 5);
        assert_eq!(mode, RunMode::GcCheck);
    }

    #[test]
    fn test_negative_grace_rejected() {
        let args =
            Args::try_parse_from(["dedup-store", "--gc-grace-secs=-1"]).unwrap();
        assert!(AppConfig::from_args(args).is_err());
    }

    #[test]
    fn test_migrate_conflicts_with_gc_check() {
        assert!(Args::try_parse_from(["dedup-store", "--migrate", "--gc-check"]).is_err());
    }
}
