use crate::services::{content_hash::ContentHashMode, ingest_service::IngestOptions};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use std::{env, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub max_chunk_bytes: u64,
    pub session_ttl_secs: u64,
    /// Zero disables the periodic sweep.
    pub sweep_interval_secs: u64,
    pub hash_mode: ContentHashMode,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked photo upload ingestion service")]
pub struct Args {
    /// Host to bind to (overrides PHOTO_INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PHOTO_INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding staged parts and artifacts (overrides PHOTO_INGEST_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides PHOTO_INGEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Largest accepted chunk payload in bytes (overrides PHOTO_INGEST_MAX_CHUNK_BYTES)
    #[arg(long)]
    pub max_chunk_bytes: Option<u64>,

    /// Idle seconds before an upload session is swept (overrides PHOTO_INGEST_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Seconds between sweeps, 0 to disable (overrides PHOTO_INGEST_SWEEP_INTERVAL_SECS).
    /// Without sweeps, parts of abandoned uploads stay on disk.
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Content hash registered for artifacts, `client` by default (overrides PHOTO_INGEST_HASH_MODE)
    #[arg(long, value_enum)]
    pub hash_mode: Option<ContentHashMode>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        let env_host = env::var("PHOTO_INGEST_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parsed("PHOTO_INGEST_PORT", 3000u16)?;
        let env_storage =
            env::var("PHOTO_INGEST_STORAGE_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_db = env::var("PHOTO_INGEST_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/photo_ingest.db".into());
        let env_max_chunk = env_parsed("PHOTO_INGEST_MAX_CHUNK_BYTES", 16 * 1024 * 1024u64)?;
        let env_ttl = env_parsed("PHOTO_INGEST_SESSION_TTL_SECS", 24 * 60 * 60u64)?;
        let env_sweep = env_parsed("PHOTO_INGEST_SWEEP_INTERVAL_SECS", 60 * 60u64)?;
        let env_hash_mode = match env::var("PHOTO_INGEST_HASH_MODE") {
            Ok(value) => ContentHashMode::from_str(&value, true)
                .map_err(|err| anyhow!(err))
                .with_context(|| format!("parsing PHOTO_INGEST_HASH_MODE value `{}`", value))?,
            Err(env::VarError::NotPresent) => ContentHashMode::default(),
            Err(err) => return Err(err).context("reading PHOTO_INGEST_HASH_MODE"),
        };

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            max_chunk_bytes: args.max_chunk_bytes.unwrap_or(env_max_chunk),
            session_ttl_secs: args.session_ttl_secs.unwrap_or(env_ttl),
            sweep_interval_secs: args.sweep_interval_secs.unwrap_or(env_sweep),
            hash_mode: args.hash_mode.unwrap_or(env_hash_mode),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            max_chunk_bytes: self.max_chunk_bytes,
            hash_mode: self.hash_mode,
            session_ttl: Duration::from_secs(self.session_ttl_secs),
        }
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

fn env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
