//! src/services/download_service.rs
//!
//! DownloadOrchestrator resolves a complete file object back into one
//! byte-exact local file. Parts are fetched one at a time, in ledger order,
//! into a private temporary directory and merged under the object's recorded
//! original filename. A failed download never leaves output behind.

use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    channel::{BlobChannel, ChannelError, ContainerRef, PartRef},
    config::EngineSettings,
    errors::{EngineError, EngineResult},
    models::{file_object::FileObject, part::Part},
    services::{codec, ledger::Ledger},
};

#[derive(Clone)]
pub struct DownloadOrchestrator {
    ledger: Arc<Ledger>,
    channel: Arc<dyn BlobChannel>,
    settings: EngineSettings,
}

impl DownloadOrchestrator {
    pub fn new(ledger: Arc<Ledger>, channel: Arc<dyn BlobChannel>, settings: EngineSettings) -> Self {
        Self {
            ledger,
            channel,
            settings,
        }
    }

    /// Reassemble `file_id` into `output_dir` (or the configured output
    /// directory) and return the path of the written file.
    pub async fn download_file(
        &self,
        file_id: Uuid,
        output_dir: Option<&Path>,
    ) -> EngineResult<PathBuf> {
        let file = self.ledger.get_file_object(file_id).await?;
        let parts = self.ledger.list_parts(file_id).await?;

        let container = match file.container_ref.as_deref() {
            Some(container) if parts.len() as i64 == file.expected_parts => {
                ContainerRef(container.to_string())
            }
            _ => {
                return Err(EngineError::IncompleteUpload {
                    file_id,
                    recorded: parts.len() as i64,
                    expected: file.expected_parts,
                });
            }
        };

        let output_dir = output_dir.unwrap_or(&self.settings.output_dir);
        let output = output_dir.join(&file.original_filename);
        let work_dir = self
            .settings
            .temp_dir
            .join(format!("download-{}-{}", file.id, Uuid::new_v4().simple()));
        info!(
            "downloading {} ({} part(s)) to {}",
            file.id,
            parts.len(),
            output.display()
        );

        let result = self
            .assemble(&file, &container, &parts, &work_dir, &output)
            .await;

        if let Err(err) = fs::remove_dir_all(&work_dir).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    "could not remove download directory {}: {}",
                    work_dir.display(),
                    err
                );
            }
        }

        match result {
            Ok(()) => {
                info!("download {} complete", file.id);
                Ok(output)
            }
            Err(err) => {
                warn!("download {} failed: {}", file.id, err);
                Err(err)
            }
        }
    }

    async fn assemble(
        &self,
        file: &FileObject,
        container: &ContainerRef,
        parts: &[Part],
        work_dir: &Path,
        output: &Path,
    ) -> EngineResult<()> {
        let listed: HashSet<PartRef> = match self.channel.list_messages(container).await {
            Ok(messages) => messages.into_iter().map(|m| m.part_ref).collect(),
            Err(ChannelError::NotFound(_)) => {
                return Err(EngineError::ContainerUnavailable {
                    file_id: file.id,
                    container: container.clone(),
                });
            }
            Err(err) => return Err(EngineError::Channel(err)),
        };

        fs::create_dir_all(work_dir).await?;
        let mut chunks = Vec::with_capacity(parts.len());
        for part in parts {
            chunks.push(self.fetch_part(file, container, part, &listed, work_dir).await?);
        }

        if file.is_split {
            codec::merge_ordered(&chunks, output).await?;
        } else if let Some(chunk) = chunks.first() {
            place_single(chunk, output).await?;
        }

        let actual = fs::metadata(output).await?.len();
        if actual != file.size() {
            let _ = fs::remove_file(output).await;
            return Err(EngineError::SizeMismatch {
                file_id: file.id,
                expected: file.size(),
                actual,
            });
        }
        Ok(())
    }

    /// Fetch one part into `work_dir`, returning the chunk path.
    async fn fetch_part(
        &self,
        file: &FileObject,
        container: &ContainerRef,
        part: &Part,
        listed: &HashSet<PartRef>,
        work_dir: &Path,
    ) -> EngineResult<PathBuf> {
        let ordinal = part.checked_ordinal()?;
        let part_ref = PartRef(part.remote_ref.clone());
        let fetch_error = |source| EngineError::PartFetch {
            file_id: file.id,
            ordinal,
            source,
        };

        if !listed.contains(&part_ref) {
            return Err(fetch_error(ChannelError::NotFound(format!(
                "message {} in container {}",
                part_ref, container
            ))));
        }

        let attachment = self
            .channel
            .fetch_attachment(container, &part_ref)
            .await
            .map_err(fetch_error)?
            .ok_or_else(|| {
                fetch_error(ChannelError::NotFound(format!(
                    "attachment of message {}",
                    part_ref
                )))
            })?;

        let expected = part.size()?;
        let actual = attachment.data.len() as u64;
        if actual != expected {
            return Err(EngineError::PartSizeMismatch {
                file_id: file.id,
                ordinal,
                expected,
                actual,
            });
        }

        let path = work_dir.join(codec::chunk_file_name(codec::WORK_CHUNK_STEM, ordinal));
        fs::write(&path, &attachment.data).await?;
        debug!(
            "download {} fetched part {}/{} ({} bytes)",
            file.id, ordinal, file.expected_parts, actual
        );
        Ok(path)
    }
}

/// Move a single fetched chunk to `output`, copying when a rename is not possible.
async fn place_single(chunk: &Path, output: &Path) -> EngineResult<()> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::rename(chunk, output).await {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(
                "rename of {} failed ({}), copying instead",
                chunk.display(),
                err
            );
            codec::merge_ordered(&[chunk.to_path_buf()], output).await?;
            Ok(())
        }
    }
}
