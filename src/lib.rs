//! Chunked file storage on top of a messaging channel.
//!
//! Files larger than the configured size limit are split into parts, each
//! part is sent to the remote channel as a message attachment, and the
//! ledger records which messages make up which file so it can be
//! reassembled byte for byte later.

pub mod channel;
pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use channel::BlobChannel;
pub use errors::{EngineError, EngineResult};
pub use services::storage_service::StorageService;
