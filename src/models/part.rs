//! Represents one stored chunk of a file object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::services::ledger::LedgerError;

/// A single part of a [`FileObject`](super::file_object::FileObject) as held
/// by the remote channel.
///
/// Parts are written once, after the remote send succeeded, and never
/// updated afterwards.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Part {
    /// Owning file object.
    pub file_object_id: Uuid,

    /// Position within the file (1-based).
    pub ordinal: i64,

    /// Remote message reference returned by the channel.
    pub remote_ref: String,

    /// Attachment filename the part was sent under.
    pub part_filename: String,

    /// Size of this part in bytes.
    pub size_bytes: i64,

    /// When the part was recorded.
    pub created_at: DateTime<Utc>,
}

impl Part {
    /// The ordinal as sent to the channel.
    pub fn checked_ordinal(&self) -> Result<u32, LedgerError> {
        u32::try_from(self.ordinal)
            .ok()
            .filter(|ordinal| *ordinal >= 1)
            .ok_or_else(|| self.corrupt("ordinal", self.ordinal))
    }

    /// The recorded part size in bytes.
    pub fn size(&self) -> Result<u64, LedgerError> {
        u64::try_from(self.size_bytes).map_err(|_| self.corrupt("part size", self.size_bytes))
    }

    fn corrupt(&self, field: &'static str, value: i64) -> LedgerError {
        LedgerError::Corrupt {
            file_id: self.file_object_id,
            field,
            value,
        }
    }
}
