//! The remote blob channel: a messaging platform used as a container/part store.
//!
//! The engine only ever talks to the platform through [`BlobChannel`], one
//! request/response call at a time. Decorators such as [`TimeoutChannel`]
//! wrap any implementation without the orchestrators noticing.

pub mod local;
pub mod memory;
pub mod timeout;

use std::{fmt, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::LocalDirChannel;
pub use memory::MemoryChannel;
pub use timeout::TimeoutChannel;

/// Remote id of a container (e.g. a dedicated sub-channel).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ContainerRef(pub String);

/// Remote id of a message carrying one part.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct PartRef(pub String);

impl ContainerRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PartRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attachment metadata as reported by a history listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub filename: String,
    pub size_bytes: u64,
}

/// A message in a container's history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteMessage {
    pub part_ref: PartRef,
    pub attachments: Vec<AttachmentInfo>,
}

/// Downloaded attachment content.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub filename: String,
    pub data: Bytes,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel rejected credentials: {0}")]
    Auth(String),
    #[error("remote resource `{0}` not found")]
    NotFound(String),
    #[error("rate limited by channel (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    /// A container with the requested name already exists. Some platforms
    /// create the duplicate anyway; `created` then names it so the caller can
    /// remove it.
    #[error("container name `{name}` already in use")]
    Conflict {
        name: String,
        created: Option<ContainerRef>,
    },
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Request/response operations the engine needs from the remote platform.
#[async_trait]
pub trait BlobChannel: Send + Sync {
    /// Create a new container named `name`.
    ///
    /// Returns [`ChannelError::Conflict`] when the name is already taken.
    async fn create_container(&self, name: &str) -> ChannelResult<ContainerRef>;

    /// Delete a container and everything in it.
    async fn delete_container(&self, container: &ContainerRef) -> ChannelResult<()>;

    /// Send one part as a named attachment and return the message reference.
    async fn send_part(
        &self,
        container: &ContainerRef,
        ordinal: u32,
        data: Bytes,
        filename: &str,
    ) -> ChannelResult<PartRef>;

    /// List the container's messages in the order they were sent.
    async fn list_messages(&self, container: &ContainerRef) -> ChannelResult<Vec<RemoteMessage>>;

    /// Fetch the attachment carried by `part`, or `None` when the message
    /// exists but has no attachment.
    async fn fetch_attachment(
        &self,
        container: &ContainerRef,
        part: &PartRef,
    ) -> ChannelResult<Option<Attachment>>;
}
