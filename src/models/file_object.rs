//! Represents a logical file stored as a sequence of remote parts.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};

/// Longest accepted filename. Remote part names append `_` and the ordinal
/// (up to ten digits), and the result must still fit a 255-byte file name.
pub const MAX_FILENAME_LEN: usize = 255 - 11;
const MAX_CONTAINER_NAME_LEN: usize = 100;

/// A logical file tracked by the ledger.
///
/// The struct holds metadata only. Content lives in the remote container
/// referenced by `container_ref`, split into `expected_parts` parts.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct FileObject {
    /// Identity allocated at creation.
    pub id: Uuid,

    /// Filename the caller supplied; downloads are written under this name.
    pub original_filename: String,

    /// Original size in bytes.
    pub size_bytes: i64,

    /// Extension including the leading dot (empty when there is none).
    pub file_extension: String,

    /// Deterministic name requested for the remote container.
    pub container_name: String,

    /// Remote container id, set once after the container was created.
    pub container_ref: Option<String>,

    /// Whether the content was split into more than one part.
    pub is_split: bool,

    /// Number of parts a complete upload records.
    pub expected_parts: i64,

    /// When this record was created.
    pub created_at: DateTime<Utc>,
}

impl FileObject {
    pub fn size(&self) -> u64 {
        u64::try_from(self.size_bytes).unwrap_or(0)
    }
}

/// Caller-supplied description of a file about to be stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMetadata {
    pub original_filename: String,
    pub size_bytes: u64,
}

impl FileMetadata {
    /// Validate the filename and build metadata for a file of `size_bytes`.
    pub fn new(original_filename: impl Into<String>, size_bytes: u64) -> EngineResult<Self> {
        let original_filename = original_filename.into();
        ensure_filename_safe(&original_filename)?;
        Ok(Self {
            original_filename,
            size_bytes,
        })
    }

    /// Describe a local file, using its final path component as the name.
    pub async fn from_path(path: &Path) -> EngineResult<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| EngineError::InvalidFilename(path.display().to_string()))?;
        let size = tokio::fs::metadata(path).await?.len();
        Self::new(name, size)
    }

    /// Compute the part layout for this file under `size_limit`.
    pub fn plan(&self, size_limit: u64) -> NewFileObject {
        let (is_split, expected_parts) = part_layout(self.size_bytes, size_limit);
        NewFileObject {
            original_filename: self.original_filename.clone(),
            size_bytes: self.size_bytes,
            file_extension: file_extension(&self.original_filename),
            container_name: container_name_for(&self.original_filename),
            is_split,
            expected_parts,
        }
    }
}

/// A file object about to be inserted into the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewFileObject {
    pub original_filename: String,
    pub size_bytes: u64,
    pub file_extension: String,
    pub container_name: String,
    pub is_split: bool,
    pub expected_parts: u32,
}

/// A file object together with how many parts are recorded for it.
#[derive(Serialize, Clone, Debug)]
pub struct FileEntry {
    #[serde(flatten)]
    pub file: FileObject,
    pub parts_recorded: i64,
    pub complete: bool,
}

/// Return `(split, expected_parts)` for a file of `size` bytes.
///
/// A file is split only when it is strictly larger than `size_limit`.
pub fn part_layout(size: u64, size_limit: u64) -> (bool, u32) {
    if size_limit == 0 || size <= size_limit {
        return (false, 1);
    }
    let parts = size.div_ceil(size_limit);
    (true, u32::try_from(parts).unwrap_or(u32::MAX))
}

/// Derive the remote container name from a filename.
///
/// Lowercases and replaces everything outside `[a-z0-9_-]` with `_`, so
/// `My File (1).tar.gz` becomes `my_file__1__tar_gz`.
pub fn container_name_for(filename: &str) -> String {
    let mut name: String = filename
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .take(MAX_CONTAINER_NAME_LEN)
        .collect();
    if name.is_empty() {
        name.push_str("file");
    }
    name
}

fn file_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

/// Reject filenames that are not a single, plain path component.
fn ensure_filename_safe(name: &str) -> EngineResult<()> {
    let invalid = || EngineError::InvalidFilename(name.to_string());
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(invalid());
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(invalid());
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_length_leaves_room_for_part_suffix() {
        let longest = "a".repeat(MAX_FILENAME_LEN);
        assert!(FileMetadata::new(longest.as_str(), 1).is_ok());
        let part_name = crate::services::codec::chunk_file_name(&longest, u32::MAX);
        assert!(part_name.len() <= 255);

        let too_long = "a".repeat(MAX_FILENAME_LEN + 1);
        assert!(matches!(
            FileMetadata::new(too_long, 1),
            Err(EngineError::InvalidFilename(_))
        ));
    }

    #[test]
    fn layout_splits_only_above_limit() {
        assert_eq!(part_layout(0, 10), (false, 1));
        assert_eq!(part_layout(10, 10), (false, 1));
        assert_eq!(part_layout(11, 10), (true, 2));
        assert_eq!(part_layout(101, 10), (true, 11));
        assert_eq!(part_layout(2_500_000, 1_000_000), (true, 3));
    }

    #[test]
    fn container_names_are_deterministic() {
        assert_eq!(container_name_for("My File (1).tar.gz"), "my_file__1__tar_gz");
        assert_eq!(container_name_for("report.pdf"), container_name_for("report.pdf"));
        assert_eq!(container_name_for(&"x".repeat(300)).len(), MAX_CONTAINER_NAME_LEN);
    }

    #[test]
    fn plan_fills_derived_fields() {
        let meta = FileMetadata::new("movie.mkv", 25).unwrap();
        let plan = meta.plan(10);
        assert!(plan.is_split);
        assert_eq!(plan.expected_parts, 3);
        assert_eq!(plan.file_extension, ".mkv");
        assert_eq!(plan.container_name, "movie_mkv");
    }

    #[test]
    fn rejects_path_like_filenames() {
        for bad in ["", ".", "..", "a/b", "..\\x", "tab\tname"] {
            assert!(
                matches!(FileMetadata::new(bad, 1), Err(EngineError::InvalidFilename(_))),
                "accepted {bad:?}"
            );
        }
        assert!(FileMetadata::new("notes", 1).is_ok());
    }
}
