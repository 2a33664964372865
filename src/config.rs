use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};
use uuid::Uuid;

/// Part size used when nothing is configured: 24 MiB, under the usual
/// attachment cap of messaging platforms.
pub const DEFAULT_SIZE_LIMIT: u64 = 24 * 1024 * 1024;

/// Settings the orchestrators need.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Split threshold and maximum part size in bytes.
    pub size_limit: u64,
    /// Working directory for chunk files.
    pub temp_dir: PathBuf,
    /// Default destination for downloads.
    pub output_dir: PathBuf,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub channel_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub size_limit: u64,
    pub upload_workers: usize,
    pub call_timeout: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked file storage on top of a messaging channel")]
pub struct Args {
    /// Ledger database URL (overrides CHUNKVAULT_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Root directory of the local blob channel (overrides CHUNKVAULT_CHANNEL_DIR)
    #[arg(long, global = true)]
    pub channel_dir: Option<PathBuf>,

    /// Working directory for chunk files (overrides CHUNKVAULT_TEMP_DIR)
    #[arg(long, global = true)]
    pub temp_dir: Option<PathBuf>,

    /// Download destination (overrides CHUNKVAULT_OUTPUT_DIR)
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Split threshold in bytes (overrides CHUNKVAULT_SIZE_LIMIT)
    #[arg(long, global = true)]
    pub size_limit: Option<u64>,

    /// Concurrent background uploads (overrides CHUNKVAULT_UPLOAD_WORKERS)
    #[arg(long, global = true)]
    pub upload_workers: Option<usize>,

    /// Timeout for each remote call in seconds (overrides CHUNKVAULT_CALL_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub call_timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the ledger schema and exit
    Migrate,
    /// Store one or more local files, uploading them concurrently
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Show upload progress of a stored file
    Status { id: Uuid },
    /// List stored files
    List,
    /// Reassemble a stored file
    Download {
        id: Uuid,
        /// Directory to write the file into (defaults to the configured output dir)
        #[arg(long)]
        to: Option<PathBuf>,
    },
    /// Delete a stored file and its remote container
    Delete { id: Uuid },
    /// Roll back uploads that never completed
    Reap {
        /// Only reap uploads older than this many seconds
        #[arg(long, default_value_t = 3600)]
        older_than_secs: u64,
    },
    /// Check ledger and disk readiness
    Check,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        let cfg = Self::from_args(&args)?;
        Ok((cfg, args.command))
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_db = env::var("CHUNKVAULT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/chunkvault.db".into());
        let env_channel =
            env::var("CHUNKVAULT_CHANNEL_DIR").unwrap_or_else(|_| "./data/channel".into());
        let env_temp = env::var("CHUNKVAULT_TEMP_DIR").unwrap_or_else(|_| "./data/tmp".into());
        let env_output =
            env::var("CHUNKVAULT_OUTPUT_DIR").unwrap_or_else(|_| "./data/output".into());
        let env_size_limit = env_parse("CHUNKVAULT_SIZE_LIMIT", DEFAULT_SIZE_LIMIT)?;
        let env_workers = env_parse("CHUNKVAULT_UPLOAD_WORKERS", 2usize)?;
        let env_timeout = env_parse("CHUNKVAULT_CALL_TIMEOUT_SECS", 120u64)?;

        // --- Merge ---
        let cfg = Self {
            database_url: args.database_url.clone().unwrap_or(env_db),
            channel_dir: args.channel_dir.clone().unwrap_or_else(|| env_channel.into()),
            temp_dir: args.temp_dir.clone().unwrap_or_else(|| env_temp.into()),
            output_dir: args.output_dir.clone().unwrap_or_else(|| env_output.into()),
            size_limit: args.size_limit.unwrap_or(env_size_limit),
            upload_workers: args.upload_workers.unwrap_or(env_workers),
            call_timeout: Duration::from_secs(args.call_timeout_secs.unwrap_or(env_timeout)),
        };

        if cfg.size_limit == 0 {
            anyhow::bail!("size limit must be positive");
        }
        if cfg.upload_workers == 0 {
            anyhow::bail!("at least one upload worker is required");
        }

        Ok(cfg)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            size_limit: self.size_limit,
            temp_dir: self.temp_dir.clone(),
            output_dir: self.output_dir.clone(),
        }
    }
}

/// Read and parse `key`, falling back to `default` when it is unset.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
