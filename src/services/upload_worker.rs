//! Background upload queue.
//!
//! `UploadQueue::submit` records the file object and returns its id at once;
//! a dispatcher task hands each job to the upload orchestrator, running at
//! most `concurrency` uploads at a time. Callers poll [`UploadQueue::status`]:
//! the ledger is the handoff signal, plus an in-memory note of jobs that
//! failed, written before their ledger rows are rolled back.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use serde::Serialize;
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    task::{JoinHandle, JoinSet},
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    errors::{EngineError, EngineResult},
    models::file_object::FileMetadata,
    services::{ledger::Ledger, upload_service::UploadOrchestrator},
};

#[derive(Debug, Clone)]
pub struct UploadJob {
    pub file_id: Uuid,
    pub source: PathBuf,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UploadStatus {
    Pending {
        parts_recorded: i64,
        expected_parts: i64,
    },
    Complete,
    Failed {
        reason: String,
    },
}

type FailureLog = Arc<Mutex<HashMap<Uuid, String>>>;

/// Handle for submitting uploads and polling their progress.
#[derive(Clone)]
pub struct UploadQueue {
    tx: mpsc::Sender<UploadJob>,
    ledger: Arc<Ledger>,
    size_limit: u64,
    failures: FailureLog,
}

/// The dispatcher task. Finishes once every [`UploadQueue`] clone has been
/// dropped and all accepted jobs have run.
pub struct UploadWorker {
    handle: JoinHandle<()>,
}

/// Start a dispatcher running up to `concurrency` uploads at once.
pub fn spawn(
    orchestrator: UploadOrchestrator,
    ledger: Arc<Ledger>,
    concurrency: usize,
) -> (UploadQueue, UploadWorker) {
    let concurrency = concurrency.max(1);
    let (tx, rx) = mpsc::channel(concurrency * 4);
    let failures: FailureLog = Arc::new(Mutex::new(HashMap::new()));
    let size_limit = orchestrator.settings().size_limit;

    let handle = tokio::spawn(dispatch(
        rx,
        Arc::new(orchestrator),
        failures.clone(),
        concurrency,
    ));

    (
        UploadQueue {
            tx,
            ledger,
            size_limit,
            failures,
        },
        UploadWorker { handle },
    )
}

impl UploadQueue {
    /// Record a file object for `source` and queue its upload.
    pub async fn submit(
        &self,
        source: impl Into<PathBuf>,
        metadata: FileMetadata,
    ) -> EngineResult<Uuid> {
        let file = self
            .ledger
            .create_file_object(&metadata.plan(self.size_limit))
            .await?;
        let job = UploadJob {
            file_id: file.id,
            source: source.into(),
        };

        if self.tx.send(job).await.is_err() {
            if let Err(err) = self.ledger.delete_file_object(file.id).await {
                warn!("could not remove unqueued file object {}: {}", file.id, err);
            }
            return Err(EngineError::WorkerStopped);
        }
        info!("queued upload {} for {}", file.id, file.original_filename);
        Ok(file.id)
    }

    pub async fn status(&self, id: Uuid) -> EngineResult<UploadStatus> {
        if let Some(reason) = self.failures.lock().await.get(&id) {
            return Ok(UploadStatus::Failed {
                reason: reason.clone(),
            });
        }

        let file = self.ledger.get_file_object(id).await?;
        let parts_recorded = self.ledger.count_parts(id).await?;
        if file.container_ref.is_some() && parts_recorded == file.expected_parts {
            Ok(UploadStatus::Complete)
        } else {
            Ok(UploadStatus::Pending {
                parts_recorded,
                expected_parts: file.expected_parts,
            })
        }
    }
}

impl UploadWorker {
    /// Wait for the dispatcher to drain.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            error!("upload dispatcher stopped abnormally: {}", err);
        }
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<UploadJob>,
    orchestrator: Arc<UploadOrchestrator>,
    failures: FailureLog,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut running = JoinSet::new();

    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let orchestrator = orchestrator.clone();
        let failures = failures.clone();
        running.spawn(async move {
            let _permit = permit;
            let file_id = job.file_id;
            // Noted before rollback removes the ledger row, so pollers never
            // see the job vanish.
            let result = orchestrator
                .run_with(file_id, &job.source, |err| {
                    let reason = err.to_string();
                    let failures = failures.clone();
                    async move {
                        failures.lock().await.insert(file_id, reason);
                    }
                })
                .await;
            if let Err(err) = result {
                failures.lock().await.insert(file_id, err.to_string());
            }
        });

        while let Some(finished) = running.try_join_next() {
            if let Err(err) = finished {
                error!("upload task panicked: {}", err);
            }
        }
    }

    while let Some(finished) = running.join_next().await {
        if let Err(err) = finished {
            error!("upload task panicked: {}", err);
        }
    }
}
