//! src/services/ledger.rs
//!
//! Ledger is the durable mapping from a file object to its ordered parts,
//! backed by SQLite. It is the only record of which remote messages make up
//! a file; nothing here talks to the remote channel.

use std::{collections::HashMap, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{
    channel::ContainerRef,
    models::{
        file_object::{FileEntry, FileObject, NewFileObject},
        part::Part,
    },
};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const FILE_OBJECT_COLUMNS: &str = "id, original_filename, size_bytes, file_extension, \
     container_name, container_ref, is_split, expected_parts, created_at";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("file object `{0}` not found")]
    NotFound(Uuid),
    #[error("container reference for `{0}` is already set")]
    AlreadySet(Uuid),
    #[error("part {got} of `{file_id}` is out of order (expected part {expected})")]
    OutOfOrder { file_id: Uuid, expected: i64, got: u32 },
    #[error("part {ordinal} of `{file_id}` exceeds the expected {expected_parts} part(s)")]
    PartOverflow {
        file_id: Uuid,
        ordinal: u32,
        expected_parts: i64,
    },
    #[error("file object `{0}` has no container reference yet")]
    ContainerNotRecorded(Uuid),
    #[error("ledger holds an invalid {field} ({value}) for `{file_id}`")]
    Corrupt {
        file_id: Uuid,
        field: &'static str,
        value: i64,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger of file objects and their parts.
///
/// Appends for one file object are serialised by a per-id lock on top of the
/// SQLite transaction, so the ordinal check and the insert cannot interleave
/// with another writer in this process.
#[derive(Clone)]
pub struct Ledger {
    db: Arc<SqlitePool>,
    write_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl Ledger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self {
            db,
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a pool for `database_url`, creating the database file if needed.
    pub async fn connect(database_url: &str, max_connections: u32) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// A migrated, private in-memory ledger.
    ///
    /// Uses a single connection that is never recycled; every SQLite memory
    /// connection is a separate database.
    pub async fn in_memory() -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let ledger = Self::new(Arc::new(pool));
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Run the embedded schema statement by statement. Idempotent.
    pub async fn migrate(&self) -> LedgerResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    /// Cheap connectivity check.
    pub async fn ping(&self) -> LedgerResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    async fn write_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks.entry(id).or_default().clone()
    }

    /// Drop the map entry for `id` once no other writer holds or awaits it.
    async fn release_write_lock(&self, id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.write_locks.lock().await;
        // New holders only clone under the map lock, so the count is stable here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&id);
        }
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.write_locks.lock().await.len()
    }

    /// Insert a new file object; its container reference starts out NULL.
    pub async fn create_file_object(&self, new: &NewFileObject) -> LedgerResult<FileObject> {
        let size_bytes = i64::try_from(new.size_bytes).unwrap_or(i64::MAX);
        let file = sqlx::query_as::<_, FileObject>(&format!(
            "INSERT INTO file_objects ({FILE_OBJECT_COLUMNS})
             VALUES (?, ?, ?, ?, ?, NULL, ?, ?, ?)
             RETURNING {FILE_OBJECT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new.original_filename)
        .bind(size_bytes)
        .bind(&new.file_extension)
        .bind(&new.container_name)
        .bind(new.is_split)
        .bind(i64::from(new.expected_parts))
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        debug!(
            "created file object {} for {} ({} part(s))",
            file.id, file.original_filename, file.expected_parts
        );
        Ok(file)
    }

    pub async fn get_file_object(&self, id: Uuid) -> LedgerResult<FileObject> {
        sqlx::query_as::<_, FileObject>(&format!(
            "SELECT {FILE_OBJECT_COLUMNS} FROM file_objects WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => LedgerError::NotFound(id),
            other => LedgerError::Sqlx(other),
        })
    }

    /// Set the container reference. Fails with `AlreadySet` on a second call.
    pub async fn record_container(&self, id: Uuid, container: &ContainerRef) -> LedgerResult<()> {
        let lock = self.write_lock(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.record_container_locked(id, container).await
        };
        self.release_write_lock(id, lock).await;
        result
    }

    async fn record_container_locked(&self, id: Uuid, container: &ContainerRef) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE file_objects SET container_ref = ? WHERE id = ? AND container_ref IS NULL",
        )
        .bind(container.as_str())
        .bind(id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing row from one that is already set.
            self.get_file_object(id).await?;
            return Err(LedgerError::AlreadySet(id));
        }
        Ok(())
    }

    /// Append the next part. `ordinal` must equal the current part count + 1.
    pub async fn append_part(
        &self,
        id: Uuid,
        ordinal: u32,
        remote_ref: &str,
        part_filename: &str,
        size_bytes: u64,
    ) -> LedgerResult<Part> {
        let lock = self.write_lock(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.append_part_locked(id, ordinal, remote_ref, part_filename, size_bytes).await
        };
        self.release_write_lock(id, lock).await;
        result
    }

    async fn append_part_locked(
        &self,
        id: Uuid,
        ordinal: u32,
        remote_ref: &str,
        part_filename: &str,
        size_bytes: u64,
    ) -> LedgerResult<Part> {
        let mut tx = self.db.begin().await?;
        let (container_ref, expected_parts) = sqlx::query_as::<_, (Option<String>, i64)>(
            "SELECT container_ref, expected_parts FROM file_objects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::NotFound(id))?;

        if container_ref.is_none() {
            return Err(LedgerError::ContainerNotRecorded(id));
        }

        let recorded: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM file_parts WHERE file_object_id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        if i64::from(ordinal) != recorded + 1 {
            return Err(LedgerError::OutOfOrder {
                file_id: id,
                expected: recorded + 1,
                got: ordinal,
            });
        }
        if i64::from(ordinal) > expected_parts {
            return Err(LedgerError::PartOverflow {
                file_id: id,
                ordinal,
                expected_parts,
            });
        }

        let part = sqlx::query_as::<_, Part>(
            "INSERT INTO file_parts (
                file_object_id, ordinal, remote_ref, part_filename, size_bytes, created_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             RETURNING file_object_id, ordinal, remote_ref, part_filename, size_bytes, created_at",
        )
        .bind(id)
        .bind(i64::from(ordinal))
        .bind(remote_ref)
        .bind(part_filename)
        .bind(i64::try_from(size_bytes).unwrap_or(i64::MAX))
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(part)
    }

    /// Parts of `id`, sorted by ordinal.
    pub async fn list_parts(&self, id: Uuid) -> LedgerResult<Vec<Part>> {
        let parts = sqlx::query_as::<_, Part>(
            "SELECT file_object_id, ordinal, remote_ref, part_filename, size_bytes, created_at
             FROM file_parts WHERE file_object_id = ? ORDER BY ordinal ASC",
        )
        .bind(id)
        .fetch_all(&*self.db)
        .await?;
        Ok(parts)
    }

    pub async fn count_parts(&self, id: Uuid) -> LedgerResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM file_parts WHERE file_object_id = ?")
            .bind(id)
            .fetch_one(&*self.db)
            .await?;
        Ok(count)
    }

    /// True iff the container is recorded and every expected part is present.
    pub async fn is_complete(&self, id: Uuid) -> LedgerResult<bool> {
        let file = self.get_file_object(id).await?;
        if file.container_ref.is_none() {
            return Ok(false);
        }
        Ok(self.count_parts(id).await? == file.expected_parts)
    }

    /// Remove every part of `id`, keeping the file object. Returns the number removed.
    pub async fn delete_parts(&self, id: Uuid) -> LedgerResult<u64> {
        let lock = self.write_lock(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.delete_parts_locked(id).await
        };
        self.release_write_lock(id, lock).await;
        result
    }

    async fn delete_parts_locked(&self, id: Uuid) -> LedgerResult<u64> {
        let result = sqlx::query("DELETE FROM file_parts WHERE file_object_id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Remove the file object and all its parts in one transaction.
    ///
    /// Does not touch the remote container.
    pub async fn delete_file_object(&self, id: Uuid) -> LedgerResult<FileObject> {
        let lock = self.write_lock(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.delete_file_object_locked(id).await
        };
        self.release_write_lock(id, lock).await;
        result
    }

    async fn delete_file_object_locked(&self, id: Uuid) -> LedgerResult<FileObject> {
        let mut tx = self.db.begin().await?;
        let file = sqlx::query_as::<_, FileObject>(&format!(
            "SELECT {FILE_OBJECT_COLUMNS} FROM file_objects WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::NotFound(id))?;

        sqlx::query("DELETE FROM file_parts WHERE file_object_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM file_objects WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!("deleted file object {} and its parts", id);
        Ok(file)
    }

    /// Every file object with its recorded part count, newest first.
    pub async fn list_file_objects(&self) -> LedgerResult<Vec<FileEntry>> {
        let sql = format!(
            "SELECT {FILE_OBJECT_COLUMNS},
                    (SELECT COUNT(*) FROM file_parts p WHERE p.file_object_id = f.id) AS parts_recorded
             FROM file_objects f
             ORDER BY created_at DESC"
        );
        let mut rows = sqlx::query_as::<_, FileObjectWithCount>(&sql).fetch(&*self.db);

        let mut entries = Vec::new();
        while let Some(row) = rows.try_next().await? {
            let complete =
                row.file.container_ref.is_some() && row.parts_recorded == row.file.expected_parts;
            entries.push(FileEntry {
                file: row.file,
                parts_recorded: row.parts_recorded,
                complete,
            });
        }
        Ok(entries)
    }

    /// Incomplete file objects created before `cutoff`.
    pub async fn find_orphans(&self, cutoff: DateTime<Utc>) -> LedgerResult<Vec<FileObject>> {
        let orphans = sqlx::query_as::<_, FileObject>(&format!(
            "SELECT {FILE_OBJECT_COLUMNS} FROM file_objects f
             WHERE created_at < ?
               AND (container_ref IS NULL
                    OR (SELECT COUNT(*) FROM file_parts p WHERE p.file_object_id = f.id)
                       < expected_parts)
             ORDER BY created_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;
        Ok(orphans)
    }
}

#[derive(sqlx::FromRow)]
struct FileObjectWithCount {
    #[sqlx(flatten)]
    file: FileObject,
    parts_recorded: i64,
}
