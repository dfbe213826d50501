use anyhow::{Context, Result};
use backon::ExponentialBuilder;
use clap::{Parser, Subcommand};
use std::{env, fmt::Display, str::FromStr, time::Duration};

use crate::{
    container::{BLOCK_SIZE, TRAILER_LEN},
    errors::PipelineError,
};

/// Most parts a single multipart upload may have.
pub const MAX_PARTS: u64 = 10_000;

/// Retry limits for transient store errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per operation, the first one included.
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .with_jitter()
    }
}

/// Everything the archival pipeline needs to know about a run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Only keys under this prefix are archived.
    pub source_prefix: String,

    /// Prepended to every volume name.
    pub destination_prefix: String,

    /// Base name of the volumes; the index is appended.
    pub archive_name: String,

    /// Hard cap on a volume's container size, trailer included.
    pub max_volume_size: u64,

    /// Size of each multipart upload part (the last one may be shorter).
    pub part_size: u64,

    pub fetch_concurrency: usize,
    pub compress_concurrency: usize,
    pub compression_level: i32,

    /// Bytes that may be fetched but not yet compressed at any time.
    pub in_flight_byte_budget: u64,

    /// Objects admitted past the lister but not yet appended to a volume.
    pub reorder_window: usize,

    /// Volumes that may be uploading at once.
    pub pipeline_depth: usize,

    pub retry: RetryPolicy,

    /// Times a volume is assembled and uploaded before the run gives up.
    pub volume_upload_attempts: u32,

    /// Compare fetched bytes against MD5 ETags reported by the listing.
    pub verify_source_etag: bool,

    pub resume: bool,

    /// Close and upload the open volume on graceful shutdown.
    pub close_partial_on_shutdown: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_prefix: String::new(),
            destination_prefix: String::new(),
            archive_name: "archive".into(),
            max_volume_size: 1 << 40,
            part_size: 128 << 20,
            fetch_concurrency: 64,
            compress_concurrency: num_cpus::get(),
            compression_level: zstd::DEFAULT_COMPRESSION_LEVEL,
            in_flight_byte_budget: 1 << 30,
            reorder_window: 4096,
            pipeline_depth: 2,
            retry: RetryPolicy::default(),
            volume_upload_attempts: 3,
            verify_source_etag: true,
            resume: true,
            close_partial_on_shutdown: false,
        }
    }
}

impl PipelineConfig {
    /// Object name of volume `index`.
    pub fn volume_name(&self, index: u64) -> String {
        format!(
            "{}{}-{:06}.vol",
            self.destination_prefix, self.archive_name, index
        )
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::Config(msg));

        if self.archive_name.is_empty() || self.archive_name.contains('/') {
            return invalid(format!(
                "archive name `{}` must be non-empty and contain no `/`",
                self.archive_name
            ));
        }
        if self.max_volume_size <= BLOCK_SIZE + TRAILER_LEN {
            return invalid(format!(
                "max volume size {} leaves no room for entries",
                self.max_volume_size
            ));
        }
        if self.part_size == 0 {
            return invalid("part size must be positive".into());
        }
        if self.max_volume_size.div_ceil(self.part_size) > MAX_PARTS {
            return invalid(format!(
                "a {} byte volume needs more than {MAX_PARTS} parts of {} bytes",
                self.max_volume_size, self.part_size
            ));
        }
        if self.fetch_concurrency == 0 || self.compress_concurrency == 0 {
            return invalid("fetch and compress concurrency must be positive".into());
        }
        let levels = zstd::compression_level_range();
        if !levels.contains(&self.compression_level) {
            return invalid(format!(
                "compression level {} outside {}..={}",
                self.compression_level,
                levels.start(),
                levels.end()
            ));
        }
        if self.in_flight_byte_budget == 0 {
            return invalid("in-flight byte budget must be positive".into());
        }
        if self.reorder_window == 0 || self.pipeline_depth == 0 {
            return invalid("reorder window and pipeline depth must be positive".into());
        }
        if self.retry.max_attempts == 0 || self.volume_upload_attempts == 0 {
            return invalid("retry attempts must be positive".into());
        }
        if self.retry.min_delay > self.retry.max_delay {
            return invalid("minimum retry delay exceeds the maximum".into());
        }
        Ok(())
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Pack a cold bucket into compressed archive volumes")]
pub struct Args {
    /// Directory where objects are stored (overrides COLD_ARCHIVER_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Object store metadata database (overrides COLD_ARCHIVER_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Archive a source bucket into volumes in a destination bucket
    Archive(ArchiveArgs),
    /// Read every volume back and check it
    Verify(VerifyArgs),
    /// Restore every archived object into a bucket
    Extract(ExtractArgs),
}

#[derive(clap::Args, Debug)]
pub struct ArchiveArgs {
    #[arg(long)]
    pub source_bucket: String,

    #[arg(long, default_value = "")]
    pub source_prefix: String,

    #[arg(long)]
    pub destination_bucket: String,

    #[arg(long, default_value = "")]
    pub destination_prefix: String,

    /// Volume base name (defaults to the source bucket name)
    #[arg(long)]
    pub archive_name: Option<String>,

    /// Progress ledger database (overrides COLD_ARCHIVER_LEDGER_URL)
    #[arg(long)]
    pub ledger_url: Option<String>,

    /// Maximum volume size in bytes (overrides COLD_ARCHIVER_MAX_VOLUME_SIZE)
    #[arg(long)]
    pub max_volume_size: Option<u64>,

    /// Multipart part size in bytes (overrides COLD_ARCHIVER_PART_SIZE)
    #[arg(long)]
    pub part_size: Option<u64>,

    /// Concurrent fetches (overrides COLD_ARCHIVER_FETCH_CONCURRENCY)
    #[arg(long)]
    pub fetch_concurrency: Option<usize>,

    /// Compressor threads (overrides COLD_ARCHIVER_COMPRESS_CONCURRENCY)
    #[arg(long)]
    pub compress_concurrency: Option<usize>,

    /// zstd level (overrides COLD_ARCHIVER_COMPRESSION_LEVEL)
    #[arg(long, allow_negative_numbers = true)]
    pub compression_level: Option<i32>,

    /// Bytes fetched but not yet compressed (overrides COLD_ARCHIVER_IN_FLIGHT_BYTES)
    #[arg(long)]
    pub in_flight_bytes: Option<u64>,

    /// Objects admitted ahead of the assembler (overrides COLD_ARCHIVER_REORDER_WINDOW)
    #[arg(long)]
    pub reorder_window: Option<usize>,

    /// Volumes uploading at once (overrides COLD_ARCHIVER_PIPELINE_DEPTH)
    #[arg(long)]
    pub pipeline_depth: Option<usize>,

    /// Attempts per store call (overrides COLD_ARCHIVER_RETRY_ATTEMPTS)
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// First retry delay in milliseconds (overrides COLD_ARCHIVER_RETRY_MIN_DELAY_MS)
    #[arg(long)]
    pub retry_min_delay_ms: Option<u64>,

    /// Longest retry delay in milliseconds (overrides COLD_ARCHIVER_RETRY_MAX_DELAY_MS)
    #[arg(long)]
    pub retry_max_delay_ms: Option<u64>,

    /// Attempts per volume upload (overrides COLD_ARCHIVER_VOLUME_ATTEMPTS)
    #[arg(long)]
    pub volume_attempts: Option<u32>,

    /// Refuse to continue an existing ledger
    #[arg(long)]
    pub no_resume: bool,

    /// Upload the open volume on graceful shutdown
    #[arg(long)]
    pub close_partial: bool,

    /// Do not compare fetched bytes against source ETags
    #[arg(long)]
    pub skip_etag_check: bool,
}

#[derive(clap::Args, Debug)]
pub struct VerifyArgs {
    /// Bucket holding the volumes
    #[arg(long)]
    pub bucket: String,

    #[arg(long, default_value = "")]
    pub prefix: String,
}

#[derive(clap::Args, Debug)]
pub struct ExtractArgs {
    /// Bucket holding the volumes
    #[arg(long)]
    pub bucket: String,

    #[arg(long, default_value = "")]
    pub prefix: String,

    /// Bucket to restore objects into (created if missing)
    #[arg(long)]
    pub target_bucket: String,

    /// Prepended to every restored key
    #[arg(long, default_value = "")]
    pub target_prefix: String,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub storage_dir: String,
    pub database_url: String,
}

/// A fully resolved `archive` invocation.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub source_bucket: String,
    pub destination_bucket: String,
    pub ledger_url: String,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_storage =
            env::var("COLD_ARCHIVER_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("COLD_ARCHIVER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/object_store.db".into());

        // --- Merge ---
        let cfg = Self {
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
        };

        Ok((cfg, args.command))
    }
}

impl ArchiveJob {
    /// Merge `archive` flags over `COLD_ARCHIVER_*` variables over defaults.
    pub fn from_args(args: ArchiveArgs) -> Result<Self> {
        let defaults = PipelineConfig::default();
        let archive_name = args
            .archive_name
            .unwrap_or_else(|| args.source_bucket.clone());
        let ledger_url = match args.ledger_url {
            Some(url) => url,
            None => env::var("COLD_ARCHIVER_LEDGER_URL")
                .unwrap_or_else(|_| format!("sqlite://./data/ledger/{archive_name}.db")),
        };

        let retry = RetryPolicy {
            max_attempts: pick(
                args.retry_attempts,
                "COLD_ARCHIVER_RETRY_ATTEMPTS",
                defaults.retry.max_attempts,
            )?,
            min_delay: Duration::from_millis(pick(
                args.retry_min_delay_ms,
                "COLD_ARCHIVER_RETRY_MIN_DELAY_MS",
                defaults.retry.min_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(pick(
                args.retry_max_delay_ms,
                "COLD_ARCHIVER_RETRY_MAX_DELAY_MS",
                defaults.retry.max_delay.as_millis() as u64,
            )?),
        };

        let pipeline = PipelineConfig {
            source_prefix: args.source_prefix,
            destination_prefix: args.destination_prefix,
            archive_name,
            max_volume_size: pick(
                args.max_volume_size,
                "COLD_ARCHIVER_MAX_VOLUME_SIZE",
                defaults.max_volume_size,
            )?,
            part_size: pick(args.part_size, "COLD_ARCHIVER_PART_SIZE", defaults.part_size)?,
            fetch_concurrency: pick(
                args.fetch_concurrency,
                "COLD_ARCHIVER_FETCH_CONCURRENCY",
                defaults.fetch_concurrency,
            )?,
            compress_concurrency: pick(
                args.compress_concurrency,
                "COLD_ARCHIVER_COMPRESS_CONCURRENCY",
                defaults.compress_concurrency,
            )?,
            compression_level: pick(
                args.compression_level,
                "COLD_ARCHIVER_COMPRESSION_LEVEL",
                defaults.compression_level,
            )?,
            in_flight_byte_budget: pick(
                args.in_flight_bytes,
                "COLD_ARCHIVER_IN_FLIGHT_BYTES",
                defaults.in_flight_byte_budget,
            )?,
            reorder_window: pick(
                args.reorder_window,
                "COLD_ARCHIVER_REORDER_WINDOW",
                defaults.reorder_window,
            )?,
            pipeline_depth: pick(
                args.pipeline_depth,
                "COLD_ARCHIVER_PIPELINE_DEPTH",
                defaults.pipeline_depth,
            )?,
            retry,
            volume_upload_attempts: pick(
                args.volume_attempts,
                "COLD_ARCHIVER_VOLUME_ATTEMPTS",
                defaults.volume_upload_attempts,
            )?,
            verify_source_etag: !args.skip_etag_check,
            resume: !args.no_resume,
            close_partial_on_shutdown: args.close_partial,
        };
        pipeline.validate()?;

        Ok(Self {
            source_bucket: args.source_bucket,
            destination_bucket: args.destination_bucket,
            ledger_url,
            pipeline,
        })
    }
}

/// CLI value, else the parsed environment variable, else the default.
fn pick<T>(cli: Option<T>, var: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match env::var(var) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parsing {} value `{}`", var, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(format!("reading {}", var)),
    }
}
