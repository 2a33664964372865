use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;

use chunkvault::{
    EngineError, StorageService,
    channel::{
        Attachment, BlobChannel, ChannelError, ChannelResult, ContainerRef, MemoryChannel,
        PartRef, RemoteMessage, TimeoutChannel,
    },
    config::EngineSettings,
    models::file_object::{FileMetadata, MAX_FILENAME_LEN},
    services::{
        ledger::{Ledger, LedgerError},
        upload_worker::{self, UploadQueue, UploadStatus},
    },
};
use tempfile::TempDir;
use tokio::fs;
use uuid::Uuid;

struct Harness {
    dir: TempDir,
    channel: Arc<MemoryChannel>,
    storage: StorageService,
}

impl Harness {
    async fn new(size_limit: u64) -> Self {
        Self::with_channel(size_limit, |memory| memory as Arc<dyn BlobChannel>).await
    }

    /// Build the engine on `wrap(memory)`, keeping the memory channel for inspection.
    async fn with_channel(
        size_limit: u64,
        wrap: impl FnOnce(Arc<MemoryChannel>) -> Arc<dyn BlobChannel>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let settings = EngineSettings {
            size_limit,
            temp_dir: dir.path().join("tmp"),
            output_dir: dir.path().join("out"),
        };
        fs::create_dir_all(&settings.temp_dir).await.unwrap();
        fs::create_dir_all(&settings.output_dir).await.unwrap();
        fs::create_dir_all(dir.path().join("src")).await.unwrap();

        let ledger = Arc::new(Ledger::in_memory().await.unwrap());
        let channel = Arc::new(MemoryChannel::new());
        let storage = StorageService::new(ledger, wrap(channel.clone()), settings);
        Self {
            dir,
            channel,
            storage,
        }
    }

    /// Write `len` patterned bytes to `src/<name>`.
    async fn source(&self, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = self.dir.path().join("src").join(name);
        fs::write(&path, &data).await.unwrap();
        (path, data)
    }

    async fn upload(&self, path: &PathBuf) -> Result<chunkvault::models::file_object::FileObject, EngineError> {
        let metadata = FileMetadata::from_path(path).await.unwrap();
        self.storage.upload(path, metadata).await
    }

    async fn temp_entries(&self) -> usize {
        let mut entries = fs::read_dir(&self.storage.settings().temp_dir).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        count
    }
}

async fn wait_for(queue: &UploadQueue, id: Uuid) -> UploadStatus {
    for _ in 0..500 {
        match queue.status(id).await {
            Ok(UploadStatus::Pending { .. }) => {
                tokio::time::sleep(Duration::from_millis(10)).await
            }
            Ok(done) => return done,
            Err(err) => panic!("status of {id} failed: {err}"),
        }
    }
    panic!("upload {id} did not finish");
}

#[tokio::test]
async fn split_upload_round_trips() {
    let h = Harness::new(1_000_000).await;
    let (path, data) = h.source("big.bin", 2_500_000).await;

    let file = h.upload(&path).await.unwrap();
    assert!(file.is_split);
    assert_eq!(file.expected_parts, 3);
    assert_eq!(file.file_extension, ".bin");
    assert_eq!(file.container_name, "big_bin");

    let parts = h.storage.ledger.list_parts(file.id).await.unwrap();
    let ordinals: Vec<i64> = parts.iter().map(|p| p.ordinal).collect();
    let sizes: Vec<i64> = parts.iter().map(|p| p.size_bytes).collect();
    assert_eq!(ordinals, vec![1, 2, 3]);
    assert_eq!(sizes, vec![1_000_000, 1_000_000, 500_000]);
    assert_eq!(parts[0].part_filename, "big.bin_0001");

    let status = h.storage.status(file.id).await.unwrap();
    assert!(status.complete);
    assert_eq!(status.parts_recorded, 3);

    let output = h.storage.download(file.id, None).await.unwrap();
    assert_eq!(output, h.storage.settings().output_dir.join("big.bin"));
    assert_eq!(fs::read(&output).await.unwrap(), data);
    assert_eq!(h.temp_entries().await, 0);
    assert!(fs::metadata(&path).await.is_ok());
}

#[tokio::test]
async fn small_file_is_sent_whole() {
    let h = Harness::new(1_000).await;
    let (path, data) = h.source("notes.txt", 1_000).await;

    let file = h.upload(&path).await.unwrap();
    assert!(!file.is_split);
    assert_eq!(file.expected_parts, 1);

    let parts = h.storage.ledger.list_parts(file.id).await.unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].part_filename, "notes.txt");

    let target = h.dir.path().join("elsewhere");
    let output = h.storage.download(file.id, Some(&target)).await.unwrap();
    assert_eq!(output, target.join("notes.txt"));
    assert_eq!(fs::read(&output).await.unwrap(), data);
}

#[tokio::test]
async fn empty_file_round_trips() {
    let h = Harness::new(1_000).await;
    let (path, _) = h.source("empty", 0).await;

    let file = h.upload(&path).await.unwrap();
    assert_eq!(file.expected_parts, 1);
    let output = h.storage.download(file.id, None).await.unwrap();
    assert!(fs::read(&output).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_send_rolls_everything_back() {
    let h = Harness::new(100).await;
    let (path, _) = h.source("doc.pdf", 350).await;
    h.channel.fail_send_at(2).await;

    let err = h.upload(&path).await.unwrap_err();
    assert!(err.cleanup_errors().is_empty());
    let EngineError::PartialUpload {
        file_id,
        failed_ordinal,
        succeeded,
        ..
    } = err.primary()
    else {
        panic!("unexpected error {err}");
    };
    assert_eq!((*failed_ordinal, *succeeded), (2, 1));

    assert!(matches!(
        h.storage.status(*file_id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(h.storage.list_files().await.unwrap().is_empty());
    assert_eq!(h.channel.container_count().await, 0);
    assert_eq!(h.temp_entries().await, 0);
    assert!(fs::metadata(&path).await.is_ok());
}

#[tokio::test]
async fn duplicate_container_name_is_rejected() {
    let h = Harness::new(100).await;
    let (first, _) = h.source("same.txt", 50).await;
    fs::create_dir_all(h.dir.path().join("src/other")).await.unwrap();
    let (second, _) = h.source("other/same.txt", 50).await;

    h.upload(&first).await.unwrap();
    let err = h.upload(&second).await.unwrap_err();
    assert!(matches!(err.primary(), EngineError::DuplicateContainer { name } if name == "same_txt"));

    assert_eq!(h.channel.container_count().await, 1);
    assert_eq!(h.storage.list_files().await.unwrap().len(), 1);
}

#[tokio::test]
async fn duplicate_created_by_the_platform_is_removed() {
    let h = Harness::new(100).await;
    h.channel.create_duplicates(true).await;
    let (first, _) = h.source("same.txt", 50).await;
    fs::create_dir_all(h.dir.path().join("src/other")).await.unwrap();
    let (second, _) = h.source("other/same.txt", 50).await;

    h.upload(&first).await.unwrap();
    let err = h.upload(&second).await.unwrap_err();
    assert!(matches!(err.primary(), EngineError::DuplicateContainer { .. }));
    assert!(err.cleanup_errors().is_empty());

    assert_eq!(h.channel.container_names().await, vec!["same_txt".to_string()]);
    assert_eq!(h.storage.list_files().await.unwrap().len(), 1);
}

#[tokio::test]
async fn incomplete_object_is_not_downloaded() {
    let h = Harness::new(100).await;
    let plan = FileMetadata::new("half.bin", 250).unwrap().plan(100);
    let file = h.storage.ledger.create_file_object(&plan).await.unwrap();

    let err = h.storage.download(file.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::IncompleteUpload {
            recorded: 0,
            expected: 3,
            ..
        }
    ));
    assert_eq!(h.channel.list_calls().await, 0);
    assert_eq!(h.channel.fetch_calls().await, 0);
}

#[tokio::test]
async fn missing_attachment_fails_without_output() {
    let h = Harness::new(100).await;
    let (path, _) = h.source("photo.jpg", 250).await;
    let file = h.upload(&path).await.unwrap();

    let parts = h.storage.ledger.list_parts(file.id).await.unwrap();
    let container = ContainerRef(file.container_ref.clone().unwrap());
    assert!(
        h.channel
            .drop_attachment(&container, &PartRef(parts[1].remote_ref.clone()))
            .await
    );

    let err = h.storage.download(file.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::PartFetch { ordinal: 2, .. }));
    assert!(fs::metadata(h.storage.settings().output_dir.join("photo.jpg")).await.is_err());
    assert_eq!(h.temp_entries().await, 0);
}

#[tokio::test]
async fn vanished_container_is_reported() {
    let h = Harness::new(100).await;
    let (path, _) = h.source("gone.bin", 150).await;
    let file = h.upload(&path).await.unwrap();

    let container = ContainerRef(file.container_ref.clone().unwrap());
    assert!(h.channel.remove_container(&container).await);

    let err = h.storage.download(file.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::ContainerUnavailable { .. }));
    assert_eq!(h.channel.fetch_calls().await, 0);
}

#[tokio::test]
async fn delete_removes_container_and_rows() {
    let h = Harness::new(100).await;
    let (path, _) = h.source("old.log", 250).await;
    let file = h.upload(&path).await.unwrap();
    assert_eq!(h.channel.container_count().await, 1);

    let deleted = h.storage.delete_file(file.id).await.unwrap();
    assert_eq!(deleted.id, file.id);
    assert_eq!(h.channel.container_count().await, 0);
    assert!(h.storage.ledger.list_parts(file.id).await.unwrap().is_empty());
    assert!(matches!(
        h.storage.delete_file(file.id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn failed_cleanup_is_reported_and_reaped_later() {
    let h = Harness::new(100).await;
    let (path, _) = h.source("stuck.bin", 250).await;
    h.channel.fail_send_at(1).await;
    h.channel.fail_deletes(true).await;

    let err = h.upload(&path).await.unwrap_err();
    let EngineError::PartialUpload { file_id, .. } = err.primary() else {
        panic!("unexpected error {err}");
    };
    let file_id = *file_id;
    assert_eq!(err.cleanup_errors().len(), 1);
    assert!(err.to_string().contains("cleanup also failed"));

    // The object stays behind so its container is not lost track of.
    let entry = h.storage.status(file_id).await.unwrap();
    assert!(!entry.complete);
    assert_eq!(entry.parts_recorded, 0);
    assert_eq!(h.channel.container_count().await, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = h.storage.reap_orphans(chrono::Duration::zero()).await.unwrap();
    assert!(report.reaped.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, file_id);

    h.channel.fail_deletes(false).await;
    let report = h.storage.reap_orphans(chrono::Duration::zero()).await.unwrap();
    assert_eq!(report.reaped, vec![file_id]);
    assert_eq!(h.channel.container_count().await, 0);
    assert!(h.storage.list_files().await.unwrap().is_empty());
}

#[tokio::test]
async fn reaper_leaves_recent_and_complete_uploads_alone() {
    let h = Harness::new(100).await;
    let (path, _) = h.source("kept.bin", 150).await;
    let complete = h.upload(&path).await.unwrap();
    let plan = FileMetadata::new("fresh.bin", 10).unwrap().plan(100);
    let fresh = h.storage.ledger.create_file_object(&plan).await.unwrap();

    let report = h
        .storage
        .reap_orphans(chrono::Duration::hours(1))
        .await
        .unwrap();
    assert!(report.reaped.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = h.storage.reap_orphans(chrono::Duration::zero()).await.unwrap();
    assert_eq!(report.reaped, vec![fresh.id]);
    assert!(h.storage.status(complete.id).await.unwrap().complete);
}

#[tokio::test]
async fn worker_runs_queued_uploads() {
    let h = Harness::new(100).await;
    let (queue, worker) =
        upload_worker::spawn(h.storage.uploads().clone(), h.storage.ledger.clone(), 2);

    let mut ids = Vec::new();
    for name in ["a.bin", "b.bin", "c.bin"] {
        let (path, _) = h.source(name, 420).await;
        let metadata = FileMetadata::from_path(&path).await.unwrap();
        ids.push(queue.submit(path, metadata).await.unwrap());
    }

    for id in &ids {
        assert_eq!(wait_for(&queue, *id).await, UploadStatus::Complete);
        assert_eq!(h.storage.ledger.count_parts(*id).await.unwrap(), 5);
    }

    drop(queue);
    worker.join().await;
    assert_eq!(h.channel.container_count().await, 3);
}

#[tokio::test]
async fn worker_reports_failed_uploads() {
    let h = Harness::new(100).await;
    h.channel.fail_send_at(1).await;
    let (queue, worker) =
        upload_worker::spawn(h.storage.uploads().clone(), h.storage.ledger.clone(), 1);

    let (path, _) = h.source("doomed.bin", 150).await;
    let metadata = FileMetadata::from_path(&path).await.unwrap();
    let id = queue.submit(path, metadata).await.unwrap();

    match wait_for(&queue, id).await {
        UploadStatus::Failed { reason } => assert!(reason.contains("part 1")),
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(h.channel.container_count().await, 0);

    drop(queue);
    worker.join().await;
}

#[tokio::test]
async fn readiness_checks_ledger_and_directories() {
    let h = Harness::new(100).await;
    let report = h.storage.readiness().await;
    assert!(report.is_ready(), "{report:?}");
    assert_eq!(report.status, "ok");

    fs::remove_dir_all(&h.storage.settings().output_dir).await.unwrap();
    let report = h.storage.readiness().await;
    assert!(!report.is_ready());
    assert!(!report.checks["output_dir"].ok);
}

#[tokio::test]
async fn longest_filename_round_trips() {
    let h = Harness::new(100).await;
    let name = "n".repeat(MAX_FILENAME_LEN);

    for len in [80, 250] {
        let (path, data) = h.source(&name, len).await;
        let file = h.upload(&path).await.unwrap();
        let output = h.storage.download(file.id, None).await.unwrap();
        assert_eq!(fs::read(&output).await.unwrap(), data);
        h.storage.delete_file(file.id).await.unwrap();
    }
    assert_eq!(h.temp_entries().await, 0);
}

#[tokio::test]
async fn short_attachment_is_rejected() {
    let h = Harness::new(100).await;
    let (path, _) = h.source("short.bin", 250).await;
    let file = h.upload(&path).await.unwrap();

    let parts = h.storage.ledger.list_parts(file.id).await.unwrap();
    let container = ContainerRef(file.container_ref.clone().unwrap());
    assert!(
        h.channel
            .truncate_attachment(&container, &PartRef(parts[2].remote_ref.clone()), 10)
            .await
    );

    let err = h.storage.download(file.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::PartSizeMismatch {
            ordinal: 3,
            expected: 50,
            actual: 10,
            ..
        }
    ));
    assert!(fs::metadata(h.storage.settings().output_dir.join("short.bin")).await.is_err());
    assert_eq!(h.temp_entries().await, 0);
}

#[tokio::test]
async fn total_size_is_checked_after_merge() {
    let h = Harness::new(100).await;
    let (path, _) = h.source("grown.bin", 250).await;
    let file = h.upload(&path).await.unwrap();

    sqlx::query("UPDATE file_objects SET size_bytes = size_bytes + 1 WHERE id = ?")
        .bind(file.id)
        .execute(h.storage.ledger.pool())
        .await
        .unwrap();

    let err = h.storage.download(file.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::SizeMismatch {
            expected: 251,
            actual: 250,
            ..
        }
    ));
    assert!(fs::metadata(h.storage.settings().output_dir.join("grown.bin")).await.is_err());
}

#[tokio::test]
async fn corrupt_part_row_is_reported() {
    let h = Harness::new(100).await;
    let (path, _) = h.source("bent.bin", 150).await;
    let file = h.upload(&path).await.unwrap();

    sqlx::query("UPDATE file_parts SET size_bytes = -1 WHERE file_object_id = ? AND ordinal = 2")
        .bind(file.id)
        .execute(h.storage.ledger.pool())
        .await
        .unwrap();

    let err = h.storage.download(file.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Ledger(LedgerError::Corrupt { value: -1, .. })
    ));
}

/// Delegates to a memory channel but never answers sends after the first part.
struct StallingChannel(Arc<MemoryChannel>);

#[async_trait]
impl BlobChannel for StallingChannel {
    async fn create_container(&self, name: &str) -> ChannelResult<ContainerRef> {
        self.0.create_container(name).await
    }

    async fn delete_container(&self, container: &ContainerRef) -> ChannelResult<()> {
        self.0.delete_container(container).await
    }

    async fn send_part(
        &self,
        container: &ContainerRef,
        ordinal: u32,
        data: Bytes,
        filename: &str,
    ) -> ChannelResult<PartRef> {
        if ordinal > 1 {
            std::future::pending::<()>().await;
        }
        self.0.send_part(container, ordinal, data, filename).await
    }

    async fn list_messages(&self, container: &ContainerRef) -> ChannelResult<Vec<RemoteMessage>> {
        self.0.list_messages(container).await
    }

    async fn fetch_attachment(
        &self,
        container: &ContainerRef,
        part: &PartRef,
    ) -> ChannelResult<Option<Attachment>> {
        self.0.fetch_attachment(container, part).await
    }
}

#[tokio::test]
async fn timed_out_send_rolls_back() {
    let h = Harness::with_channel(100, |memory| {
        Arc::new(TimeoutChannel::new(
            StallingChannel(memory),
            Duration::from_millis(200),
        )) as Arc<dyn BlobChannel>
    })
    .await;
    let (path, _) = h.source("slow.bin", 250).await;

    let err = h.upload(&path).await.unwrap_err();
    let EngineError::PartialUpload {
        file_id,
        failed_ordinal: 2,
        source: ChannelError::Unavailable(reason),
        ..
    } = err.primary()
    else {
        panic!("unexpected error {err}");
    };
    assert!(reason.contains("timed out"), "{reason}");
    assert!(err.cleanup_errors().is_empty());

    assert!(matches!(
        h.storage.status(*file_id).await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(h.channel.container_count().await, 0);
    assert_eq!(h.temp_entries().await, 0);
}

#[tokio::test]
async fn failure_is_reported_while_the_row_still_exists() {
    let h = Harness::new(100).await;
    h.channel.fail_send_at(2).await;
    let (path, _) = h.source("watched.bin", 250).await;
    let metadata = FileMetadata::from_path(&path).await.unwrap();
    let file = h
        .storage
        .ledger
        .create_file_object(&metadata.plan(100))
        .await
        .unwrap();

    let row_present = Arc::new(AtomicBool::new(false));
    let seen = row_present.clone();
    let ledger = h.storage.ledger.clone();
    let id = file.id;
    let err = h
        .storage
        .uploads()
        .run_with(id, &path, move |_| async move {
            seen.store(ledger.get_file_object(id).await.is_ok(), Ordering::SeqCst);
        })
        .await
        .unwrap_err();

    assert!(matches!(err.primary(), EngineError::PartialUpload { .. }));
    assert!(row_present.load(Ordering::SeqCst));
    assert!(matches!(
        h.storage.status(id).await,
        Err(EngineError::NotFound(_))
    ));
}
