//! Engine-level error taxonomy.
//!
//! Each layer keeps its own error enum (`CodecError`, `LedgerError`,
//! `ChannelError`); orchestration failures are reported as [`EngineError`],
//! which carries enough context (file id, ordinal, underlying channel error)
//! for a caller to decide whether to retry the whole operation.

use std::{fmt, io};

use thiserror::Error;
use uuid::Uuid;

use crate::{
    channel::{ChannelError, ContainerRef},
    services::{codec::CodecError, ledger::LedgerError},
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Ledger(LedgerError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("file object `{0}` not found")]
    NotFound(Uuid),
    #[error("invalid filename `{0}`")]
    InvalidFilename(String),
    #[error("source for `{file_id}` changed size: recorded {expected} bytes, found {actual}")]
    SourceChanged {
        file_id: Uuid,
        expected: u64,
        actual: u64,
    },
    #[error("container `{name}` already exists")]
    DuplicateContainer { name: String },
    #[error(
        "upload of `{file_id}` aborted at part {failed_ordinal} after {succeeded} part(s) succeeded: {source}"
    )]
    PartialUpload {
        file_id: Uuid,
        failed_ordinal: u32,
        succeeded: u32,
        #[source]
        source: ChannelError,
    },
    #[error("file object `{file_id}` is incomplete: {recorded} of {expected} part(s) recorded")]
    IncompleteUpload {
        file_id: Uuid,
        recorded: i64,
        expected: i64,
    },
    #[error("container `{container}` for `{file_id}` is no longer available")]
    ContainerUnavailable {
        file_id: Uuid,
        container: ContainerRef,
    },
    #[error("could not fetch part {ordinal} of `{file_id}`: {source}")]
    PartFetch {
        file_id: Uuid,
        ordinal: u32,
        #[source]
        source: ChannelError,
    },
    #[error("part {ordinal} of `{file_id}` is {actual} bytes, expected {expected}")]
    PartSizeMismatch {
        file_id: Uuid,
        ordinal: u32,
        expected: u64,
        actual: u64,
    },
    #[error("reassembled `{file_id}` is {actual} bytes, expected {expected}")]
    SizeMismatch {
        file_id: Uuid,
        expected: u64,
        actual: u64,
    },
    #[error("upload worker is not running")]
    WorkerStopped,
    #[error("{primary} (cleanup also failed: {cleanup})")]
    WithCleanup {
        #[source]
        primary: Box<EngineError>,
        cleanup: CleanupErrors,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// The error that caused the operation to fail, looking through any
    /// attached cleanup failures.
    pub fn primary(&self) -> &EngineError {
        match self {
            EngineError::WithCleanup { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// Secondary failures raised while compensating for this error.
    pub fn cleanup_errors(&self) -> &[EngineError] {
        match self {
            EngineError::WithCleanup { cleanup, .. } => &cleanup.0,
            _ => &[],
        }
    }

    /// Attach cleanup failures; returns `self` unchanged when there are none.
    pub fn with_cleanup(self, cleanup: Vec<EngineError>) -> Self {
        if cleanup.is_empty() {
            return self;
        }
        EngineError::WithCleanup {
            primary: Box::new(self),
            cleanup: CleanupErrors(cleanup),
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => EngineError::NotFound(id),
            other => EngineError::Ledger(other),
        }
    }
}

/// Failures raised by compensating actions.
#[derive(Debug, Default)]
pub struct CleanupErrors(pub Vec<EngineError>);

impl fmt::Display for CleanupErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}
