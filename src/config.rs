use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;
use std::{env, str::FromStr};

/// Limits and switches of the metadata engine itself.
#[derive(Debug, Clone)]
pub struct MetabaseConfig {
    /// Name reported in logs.
    pub application_name: String,
    /// Minimum plain size of every part except the last one.
    pub min_part_size: i64,
    /// Maximum number of distinct parts in one object.
    pub max_number_of_parts: usize,
    /// Resolve copy segments through their ancestor on reads.
    pub server_side_copy: bool,
    /// Reject zero plain sizes for remote segments.
    pub validate_plain_size: bool,
    /// Deadline given to pending objects when the caller sets none.
    pub default_zombie_deadline: Duration,
}

impl Default for MetabaseConfig {
    fn default() -> Self {
        Self {
            application_name: "metabase".into(),
            min_part_size: 5 * 1024 * 1024,
            max_number_of_parts: 10_000,
            server_side_copy: true,
            validate_plain_size: false,
            default_zombie_deadline: Duration::hours(24),
        }
    }
}

/// Centralized process configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub loop_batch_size: usize,
    pub metabase: MetabaseConfig,
}

/// What the process should do once configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Migrate,
    RunLoop,
    Cleanup,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Object and segment metadata engine")]
pub struct Args {
    /// Host for the operations endpoint (overrides METABASE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port for the operations endpoint (overrides METABASE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides METABASE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Minimum part size in bytes (overrides METABASE_MIN_PART_SIZE)
    #[arg(long)]
    pub min_part_size: Option<i64>,

    /// Maximum number of parts (overrides METABASE_MAX_NUMBER_OF_PARTS)
    #[arg(long)]
    pub max_number_of_parts: Option<usize>,

    /// Rows per loop batch (overrides METABASE_LOOP_BATCH_SIZE)
    #[arg(long)]
    pub loop_batch_size: Option<usize>,

    /// Do not resolve copy segments through their ancestor
    #[arg(long)]
    pub disable_server_side_copy: bool,

    /// Reject remote segments with zero plain size
    #[arg(long)]
    pub validate_plain_size: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Run one segment loop with the tally observer and exit
    #[arg(long, conflicts_with = "migrate")]
    pub run_loop: bool,

    /// Delete expired and zombie objects and exit
    #[arg(long, conflicts_with_all = ["migrate", "run_loop"])]
    pub cleanup: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        let args = Args::parse();
        let defaults = MetabaseConfig::default();

        // --- Environment fallback ---
        let env_host = env::var("METABASE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("METABASE_PORT", 3000u16)?;
        let env_db = env::var("METABASE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/metabase.db".into());
        let env_min_part = env_or("METABASE_MIN_PART_SIZE", defaults.min_part_size)?;
        let env_max_parts = env_or("METABASE_MAX_NUMBER_OF_PARTS", defaults.max_number_of_parts)?;
        let env_batch = env_or("METABASE_LOOP_BATCH_SIZE", 2500usize)?;

        let mode = if args.migrate {
            Mode::Migrate
        } else if args.run_loop {
            Mode::RunLoop
        } else if args.cleanup {
            Mode::Cleanup
        } else {
            Mode::Serve
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            loop_batch_size: args.loop_batch_size.unwrap_or(env_batch),
            metabase: MetabaseConfig {
                min_part_size: args.min_part_size.unwrap_or(env_min_part),
                max_number_of_parts: args.max_number_of_parts.unwrap_or(env_max_parts),
                server_side_copy: !args.disable_server_side_copy,
                validate_plain_size: args.validate_plain_size,
                ..defaults
            },
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse an environment variable, falling back when it is unset.
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
