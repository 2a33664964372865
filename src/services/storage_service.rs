//! src/services/storage_service.rs
//!
//! StorageService: the engine's front door. Wires the ledger, the remote
//! channel and the orchestrators together and adds the operations that span
//! both sides: deletion, listing, orphan reaping and readiness checks.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    channel::{BlobChannel, ChannelError, ContainerRef},
    config::EngineSettings,
    errors::{EngineError, EngineResult},
    models::file_object::{FileEntry, FileMetadata, FileObject},
    services::{
        download_service::DownloadOrchestrator, ledger::Ledger, upload_service::UploadOrchestrator,
    },
};

#[derive(Clone)]
pub struct StorageService {
    /// Ledger of file objects and parts.
    pub ledger: Arc<Ledger>,

    /// Remote channel holding the part content.
    pub channel: Arc<dyn BlobChannel>,

    uploads: UploadOrchestrator,
    downloads: DownloadOrchestrator,
    settings: EngineSettings,
}

/// Outcome of an orphan sweep.
#[derive(Serialize, Debug, Default)]
pub struct ReapReport {
    pub reaped: Vec<Uuid>,
    pub failed: Vec<ReapFailure>,
}

#[derive(Serialize, Debug)]
pub struct ReapFailure {
    pub id: Uuid,
    pub error: String,
}

#[derive(Serialize, Debug)]
pub struct ReadinessReport {
    pub status: String,
    pub checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize, Debug)]
pub struct CheckStatus {
    pub ok: bool,
    pub error: Option<String>,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        self.checks.values().all(|c| c.ok)
    }
}

impl StorageService {
    pub fn new(ledger: Arc<Ledger>, channel: Arc<dyn BlobChannel>, settings: EngineSettings) -> Self {
        Self {
            uploads: UploadOrchestrator::new(ledger.clone(), channel.clone(), settings.clone()),
            downloads: DownloadOrchestrator::new(ledger.clone(), channel.clone(), settings.clone()),
            ledger,
            channel,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn uploads(&self) -> &UploadOrchestrator {
        &self.uploads
    }

    pub fn downloads(&self) -> &DownloadOrchestrator {
        &self.downloads
    }

    /// Upload `source` in the calling task.
    pub async fn upload(&self, source: &Path, metadata: FileMetadata) -> EngineResult<FileObject> {
        self.uploads.upload_file(source, metadata).await
    }

    pub async fn download(&self, id: Uuid, output_dir: Option<&Path>) -> EngineResult<PathBuf> {
        self.downloads.download_file(id, output_dir).await
    }

    /// Current ledger state of one file object.
    pub async fn status(&self, id: Uuid) -> EngineResult<FileEntry> {
        let file = self.ledger.get_file_object(id).await?;
        let parts_recorded = self.ledger.count_parts(id).await?;
        let complete = file.container_ref.is_some() && parts_recorded == file.expected_parts;
        Ok(FileEntry {
            file,
            parts_recorded,
            complete,
        })
    }

    pub async fn list_files(&self) -> EngineResult<Vec<FileEntry>> {
        Ok(self.ledger.list_file_objects().await?)
    }

    /// Delete the remote container, then the ledger rows.
    ///
    /// A container that is already gone remotely is not an error. Any other
    /// channel failure leaves the ledger untouched so the delete can be retried.
    pub async fn delete_file(&self, id: Uuid) -> EngineResult<FileObject> {
        let file = self.ledger.get_file_object(id).await?;
        if let Some(container) = file.container_ref.as_deref() {
            self.delete_container(&ContainerRef(container.to_string()))
                .await?;
        }
        let file = self.ledger.delete_file_object(id).await?;
        info!("deleted {} ({})", file.id, file.original_filename);
        Ok(file)
    }

    async fn delete_container(&self, container: &ContainerRef) -> EngineResult<()> {
        match self.channel.delete_container(container).await {
            Ok(()) => Ok(()),
            Err(ChannelError::NotFound(_)) => {
                debug!("container {} already removed", container);
                Ok(())
            }
            Err(err) => Err(EngineError::Channel(err)),
        }
    }

    /// Roll back every incomplete upload older than `older_than`.
    ///
    /// The cutoff must exceed the longest upload still running, or live
    /// uploads are reaped too.
    pub async fn reap_orphans(&self, older_than: Duration) -> EngineResult<ReapReport> {
        let cutoff = Utc::now() - older_than;
        let orphans = self.ledger.find_orphans(cutoff).await?;
        let mut report = ReapReport::default();

        for orphan in orphans {
            match self.delete_file(orphan.id).await {
                Ok(_) => {
                    info!("reaped orphaned upload {} ({})", orphan.id, orphan.original_filename);
                    report.reaped.push(orphan.id);
                }
                Err(err) => {
                    warn!("could not reap orphaned upload {}: {}", orphan.id, err);
                    report.failed.push(ReapFailure {
                        id: orphan.id,
                        error: err.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Check ledger connectivity and that the working directories accept
    /// a write/read/delete cycle.
    pub async fn readiness(&self) -> ReadinessReport {
        let mut checks = HashMap::new();
        checks.insert(
            "sqlite",
            match self.ledger.ping().await {
                Ok(()) => CheckStatus {
                    ok: true,
                    error: None,
                },
                Err(e) => CheckStatus {
                    ok: false,
                    error: Some(format!("error: {}", e)),
                },
            },
        );
        checks.insert("temp_dir", check_dir(&self.settings.temp_dir).await);
        checks.insert("output_dir", check_dir(&self.settings.output_dir).await);

        let ok = checks.values().all(|c| c.ok);
        ReadinessReport {
            status: if ok { "ok".into() } else { "error".into() },
            checks,
        }
    }
}

/// Write, read back and delete a marker file under `dir`.
async fn check_dir(dir: &Path) -> CheckStatus {
    let marker = dir.join(format!(".ready-{}", Uuid::new_v4().simple()));
    match marker_round_trip(&marker).await {
        Ok(()) => CheckStatus {
            ok: true,
            error: None,
        },
        Err(err) => {
            let _ = fs::remove_file(&marker).await;
            CheckStatus {
                ok: false,
                error: Some(format!("{}: {}", dir.display(), err)),
            }
        }
    }
}

async fn marker_round_trip(marker: &Path) -> io::Result<()> {
    let payload = marker.as_os_str().as_encoded_bytes();
    fs::write(marker, payload).await?;
    if fs::read(marker).await? != payload {
        return Err(io::Error::other("marker read back differently"));
    }
    fs::remove_file(marker).await
}
