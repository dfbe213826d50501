use anyhow::{Context, Result};
use std::{fs, path::Path, process::ExitCode, sync::Arc};
use tracing_subscriber::EnvFilter;

use cold_archiver::{
    config::{AppConfig, ArchiveJob, Command},
    db,
    pipeline::{Archiver, ShutdownSignal, report::RunOutcome},
    services::{
        ledger_service::Ledger, restore_service::RestoreService, storage_service::StorageService,
    },
};

const TRACING_TARGET_SHUTDOWN: &str = "cold_archiver::shutdown";

#[tokio::main]
async fn main() -> ExitCode {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(RunOutcome::Fatal.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode> {
    // --- Parse config ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting cold-archiver with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize object store ---
    let db = db::connect(&cfg.database_url, 5)
        .await
        .with_context(|| format!("opening {}", cfg.database_url))?;
    db::run_migrations(&db, db::OBJECT_STORE_SCHEMA).await?;
    let storage = StorageService::new(Arc::new(db), cfg.storage_dir.clone());

    match command {
        Command::Archive(args) => archive(storage, ArchiveJob::from_args(args)?).await,
        Command::Verify(args) => {
            let report = RestoreService::new(storage)
                .verify(&args.bucket, &args.prefix)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(RunOutcome::Fatal.exit_code())
            })
        }
        Command::Extract(args) => {
            let report = RestoreService::new(storage)
                .extract(
                    &args.bucket,
                    &args.prefix,
                    &args.target_bucket,
                    &args.target_prefix,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(RunOutcome::PartialSuccess.exit_code())
            })
        }
    }
}

async fn archive(storage: StorageService, job: ArchiveJob) -> Result<ExitCode> {
    storage
        .ensure_bucket(&job.destination_bucket)
        .await
        .with_context(|| format!("preparing destination bucket {}", job.destination_bucket))?;
    let ledger = Ledger::open(&job.ledger_url)
        .await
        .with_context(|| format!("opening ledger {}", job.ledger_url))?;

    let source = Arc::new(storage.bucket(&job.source_bucket));
    let destination = Arc::new(storage.bucket(&job.destination_bucket));
    let archiver = Archiver::new(job.pipeline, source, destination, ledger)?;
    tracing::info!(
        source = %job.source_bucket,
        destination = %job.destination_bucket,
        ledger = %job.ledger_url,
        "archiving"
    );

    let signal = ShutdownSignal::new();
    let listener = tokio::spawn(listen_for_shutdown(signal.clone()));
    let report = archiver.run(signal).await;
    listener.abort();

    let report = report?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::from(report.outcome.exit_code()))
}

/// The first SIGINT/SIGTERM drains the pipeline, the second aborts it.
async fn listen_for_shutdown(signal: ShutdownSignal) {
    shutdown_requested().await;
    tracing::info!(
        target: TRACING_TARGET_SHUTDOWN,
        "Shutdown requested, finishing admitted objects (signal again to abort)"
    );
    signal.drain();

    shutdown_requested().await;
    tracing::warn!(target: TRACING_TARGET_SHUTDOWN, "Aborting in-flight work");
    signal.abort();
}

/// Waits for SIGTERM or SIGINT/Ctrl+C.
async fn shutdown_requested() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(
                target: TRACING_TARGET_SHUTDOWN,
                error = %e,
                "Failed to install Ctrl+C handler"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix;
        match unix::signal(unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(
                    target: TRACING_TARGET_SHUTDOWN,
                    error = %e,
                    "Failed to install SIGTERM handler"
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
