use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::{fs, path::Path, sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

use chunkvault::{
    StorageService,
    channel::{BlobChannel, LocalDirChannel, TimeoutChannel},
    config::{AppConfig, Command},
    models::file_object::FileMetadata,
    services::{
        ledger::Ledger,
        upload_worker::{self, UploadQueue, UploadStatus},
    },
};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::debug!("Starting chunkvault with config: {:?}", cfg);

    // --- Ensure working directories exist ---
    for dir in [&cfg.channel_dir, &cfg.temp_dir, &cfg.output_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
            tracing::info!("Created directory {}", dir.display());
        }
    }

    // --- Initialize SQLite ledger ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let ledger = Arc::new(
        Ledger::connect(&cfg.database_url, 5)
            .await
            .with_context(|| format!("opening ledger at {}", cfg.database_url))?,
    );

    // --- Handle migration mode ---
    if let Command::Migrate = command {
        let count = ledger.migrate().await?;
        tracing::info!("Database migration complete ({} statements).", count);
        return Ok(());
    }

    // --- Initialize core service ---
    let channel: Arc<dyn BlobChannel> = Arc::new(TimeoutChannel::new(
        LocalDirChannel::new(cfg.channel_dir.clone()),
        cfg.call_timeout,
    ));
    let storage = StorageService::new(ledger.clone(), channel, cfg.engine_settings());

    match command {
        Command::Migrate => {}
        Command::Upload { paths } => {
            let (queue, worker) =
                upload_worker::spawn(storage.uploads().clone(), ledger, cfg.upload_workers);

            let mut queued = Vec::with_capacity(paths.len());
            for path in paths {
                let metadata = FileMetadata::from_path(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                let id = queue.submit(path.clone(), metadata).await?;
                queued.push((path, id));
            }

            let mut results = Vec::with_capacity(queued.len());
            let mut failed = false;
            for (path, id) in queued {
                let status = wait_for(&queue, id).await?;
                failed |= matches!(status, UploadStatus::Failed { .. });
                results.push(json!({ "path": path, "id": id, "status": status }));
            }

            drop(queue);
            worker.join().await;
            print_json(&results)?;
            if failed {
                std::process::exit(1);
            }
        }
        Command::Status { id } => print_json(&storage.status(id).await?)?,
        Command::List => print_json(&storage.list_files().await?)?,
        Command::Download { id, to } => {
            let path = storage.download(id, to.as_deref()).await?;
            print_json(&json!({ "id": id, "path": path }))?;
        }
        Command::Delete { id } => {
            let file = storage.delete_file(id).await?;
            print_json(&file)?;
        }
        Command::Reap { older_than_secs } => {
            let secs = i64::try_from(older_than_secs).context("--older-than-secs is too large")?;
            let older_than =
                chrono::Duration::try_seconds(secs).context("--older-than-secs is too large")?;
            print_json(&storage.reap_orphans(older_than).await?)?;
        }
        Command::Check => {
            let report = storage.readiness().await;
            print_json(&report)?;
            if !report.is_ready() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Poll the queue until `id` leaves the pending state.
async fn wait_for(queue: &UploadQueue, id: Uuid) -> Result<UploadStatus> {
    let mut last_seen = None;
    loop {
        match queue.status(id).await? {
            UploadStatus::Pending {
                parts_recorded,
                expected_parts,
            } => {
                if last_seen != Some(parts_recorded) {
                    tracing::info!("{}: {}/{} part(s)", id, parts_recorded, expected_parts);
                    last_seen = Some(parts_recorded);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            done => return Ok(done),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
