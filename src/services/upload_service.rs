//! src/services/upload_service.rs
//!
//! UploadOrchestrator turns a local file into one remote container, one
//! message per part and one ledger row per part. From the caller's point of
//! view the whole sequence either completes or leaves nothing behind: any
//! failure rolls back the recorded parts, the remote container and the local
//! chunk files before the error is returned.

use std::{io::ErrorKind, path::Path, sync::Arc};

use bytes::Bytes;
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    channel::{BlobChannel, ChannelError, ContainerRef},
    config::EngineSettings,
    errors::{EngineError, EngineResult},
    models::file_object::{FileMetadata, FileObject},
    services::{
        codec::{self, ChunkFile},
        ledger::Ledger,
    },
};

/// Drives uploads against a [`BlobChannel`], recording progress in the [`Ledger`].
#[derive(Clone)]
pub struct UploadOrchestrator {
    ledger: Arc<Ledger>,
    channel: Arc<dyn BlobChannel>,
    settings: EngineSettings,
}

/// One chunk queued for sending. `owned` chunks are temporary files this
/// upload created; the caller's source file is never owned.
struct PendingChunk {
    chunk: ChunkFile,
    owned: bool,
}

impl UploadOrchestrator {
    pub fn new(ledger: Arc<Ledger>, channel: Arc<dyn BlobChannel>, settings: EngineSettings) -> Self {
        Self {
            ledger,
            channel,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Create a file object for `metadata` and upload `source` into it.
    pub async fn upload_file(&self, source: &Path, metadata: FileMetadata) -> EngineResult<FileObject> {
        let plan = metadata.plan(self.settings.size_limit);
        let file = self.ledger.create_file_object(&plan).await?;
        self.run(file.id, source).await
    }

    /// Upload `source` into the already created file object `file_id`.
    ///
    /// On success the returned object is complete. On failure the ledger holds
    /// no parts for `file_id`, the remote container is gone and no chunk files
    /// remain; the file object itself is removed unless the remote container
    /// could not be deleted, in which case it is kept for the orphan reaper.
    pub async fn run(&self, file_id: Uuid, source: &Path) -> EngineResult<FileObject> {
        self.run_with(file_id, source, |_| async {}).await
    }

    /// Like [`run`](Self::run), but hands the primary error to `on_failure`
    /// before anything is rolled back, while the file object still exists.
    pub async fn run_with<F, Fut>(
        &self,
        file_id: Uuid,
        source: &Path,
        on_failure: F,
    ) -> EngineResult<FileObject>
    where
        F: FnOnce(&EngineError) -> Fut,
        Fut: Future<Output = ()>,
    {
        let file = self.ledger.get_file_object(file_id).await?;
        let work_dir = self.settings.temp_dir.join(format!("upload-{}", file.id));
        info!(
            "uploading {} as {} ({} bytes, {} part(s))",
            source.display(),
            file.id,
            file.size_bytes,
            file.expected_parts
        );

        let mut container = None;
        let result = self
            .transfer(&file, source, &work_dir, &mut container)
            .await;

        match result {
            Ok(()) => {
                if let Err(err) = remove_dir(&work_dir).await {
                    warn!(
                        "upload {} succeeded but chunk directory {} was not removed: {}",
                        file.id,
                        work_dir.display(),
                        err
                    );
                }
                let file = self.ledger.get_file_object(file.id).await?;
                info!("upload {} complete", file.id);
                Ok(file)
            }
            Err(primary) => {
                error!("upload {} failed: {}", file.id, primary);
                on_failure(&primary).await;
                let cleanup = self.rollback(&file, container.as_ref(), &work_dir).await;
                Err(primary.with_cleanup(cleanup))
            }
        }
    }

    async fn transfer(
        &self,
        file: &FileObject,
        source: &Path,
        work_dir: &Path,
        created: &mut Option<ContainerRef>,
    ) -> EngineResult<()> {
        let actual = fs::metadata(source).await?.len();
        if actual != file.size() {
            return Err(EngineError::SourceChanged {
                file_id: file.id,
                expected: file.size(),
                actual,
            });
        }

        let chunks = self.prepare_chunks(file, source, work_dir).await?;

        let container = match self.channel.create_container(&file.container_name).await {
            Ok(container) => container,
            Err(ChannelError::Conflict { name, created: dup }) => {
                *created = dup;
                return Err(EngineError::DuplicateContainer { name });
            }
            Err(err) => return Err(EngineError::Channel(err)),
        };
        *created = Some(container.clone());
        self.ledger.record_container(file.id, &container).await?;
        debug!("upload {} recorded container {}", file.id, container);

        for pending in &chunks {
            let ordinal = pending.chunk.ordinal;
            let part_filename = if file.is_split {
                codec::chunk_file_name(&file.original_filename, ordinal)
            } else {
                file.original_filename.clone()
            };
            let data = Bytes::from(fs::read(&pending.chunk.path).await?);

            let part_ref = match self
                .channel
                .send_part(&container, ordinal, data, &part_filename)
                .await
            {
                Ok(part_ref) => part_ref,
                Err(source) => {
                    return Err(EngineError::PartialUpload {
                        file_id: file.id,
                        failed_ordinal: ordinal,
                        succeeded: ordinal - 1,
                        source,
                    });
                }
            };

            self.ledger
                .append_part(
                    file.id,
                    ordinal,
                    part_ref.as_str(),
                    &part_filename,
                    pending.chunk.size_bytes,
                )
                .await?;
            debug!(
                "upload {} sent part {}/{} as {}",
                file.id, ordinal, file.expected_parts, part_ref
            );

            if pending.owned {
                if let Err(err) = fs::remove_file(&pending.chunk.path).await {
                    warn!("could not remove sent chunk {}: {}", pending.chunk.path.display(), err);
                }
            }
        }

        Ok(())
    }

    /// Split the source when the file object says so; otherwise the source
    /// itself is the single chunk.
    async fn prepare_chunks(
        &self,
        file: &FileObject,
        source: &Path,
        work_dir: &Path,
    ) -> EngineResult<Vec<PendingChunk>> {
        if !file.is_split {
            return Ok(vec![PendingChunk {
                chunk: ChunkFile {
                    ordinal: 1,
                    path: source.to_path_buf(),
                    size_bytes: file.size(),
                },
                owned: false,
            }]);
        }

        let chunks = codec::split(
            source,
            work_dir,
            codec::WORK_CHUNK_STEM,
            self.settings.size_limit,
        )
        .await?;
        if chunks.len() as i64 != file.expected_parts {
            return Err(EngineError::SourceChanged {
                file_id: file.id,
                expected: file.size(),
                actual: chunks.iter().map(|c| c.size_bytes).sum(),
            });
        }
        Ok(chunks
            .into_iter()
            .map(|chunk| PendingChunk { chunk, owned: true })
            .collect())
    }

    /// Undo whatever `transfer` managed to do. Returns the cleanup failures.
    async fn rollback(
        &self,
        file: &FileObject,
        container: Option<&ContainerRef>,
        work_dir: &Path,
    ) -> Vec<EngineError> {
        let mut failures = Vec::new();

        match self.ledger.delete_parts(file.id).await {
            Ok(removed) => debug!("rollback of {} removed {} part row(s)", file.id, removed),
            Err(err) => {
                error!("rollback of {} could not remove part rows: {}", file.id, err);
                failures.push(EngineError::from(err));
            }
        }

        let mut container_gone = true;
        if let Some(container) = container {
            match self.channel.delete_container(container).await {
                Ok(()) => debug!("rollback of {} deleted container {}", file.id, container),
                Err(ChannelError::NotFound(_)) => {}
                Err(err) => {
                    error!(
                        "rollback of {} could not delete container {}: {}",
                        file.id, container, err
                    );
                    container_gone = false;
                    failures.push(EngineError::Channel(err));
                }
            }
        }

        if let Err(err) = remove_dir(work_dir).await {
            error!(
                "rollback of {} could not remove chunk directory {}: {}",
                file.id,
                work_dir.display(),
                err
            );
            failures.push(EngineError::Io(err));
        }

        if container_gone {
            if let Err(err) = self.ledger.delete_file_object(file.id).await {
                error!("rollback of {} could not remove file object: {}", file.id, err);
                failures.push(EngineError::from(err));
            }
        } else {
            warn!(
                "keeping file object {} so its remote container can be reaped later",
                file.id
            );
        }

        failures
    }
}

/// Remove a chunk directory; a directory that never existed is fine.
async fn remove_dir(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
