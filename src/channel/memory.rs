//! In-memory [`BlobChannel`] with fault injection, used to exercise the
//! orchestrators' failure paths.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::{
    Attachment, AttachmentInfo, BlobChannel, ChannelError, ChannelResult, ContainerRef, PartRef,
    RemoteMessage,
};

#[derive(Debug)]
struct StoredMessage {
    part: PartRef,
    attachment: Option<Attachment>,
}

#[derive(Debug)]
struct StoredContainer {
    name: String,
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
struct State {
    containers: HashMap<ContainerRef, StoredContainer>,
    next_id: u64,
    fail_sends_at: HashSet<u32>,
    fail_deletes: bool,
    create_duplicates: bool,
    send_calls: usize,
    fetch_calls: usize,
    list_calls: usize,
}

impl State {
    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// Channel holding everything in process memory.
///
/// By default a conflicting container name is rejected without creating
/// anything. [`MemoryChannel::create_duplicates`] switches to the behaviour of
/// platforms that create the duplicate and report the conflict afterwards.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    state: Mutex<State>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the send of part `ordinal` fail with `Unavailable`.
    pub async fn fail_send_at(&self, ordinal: u32) {
        self.state.lock().await.fail_sends_at.insert(ordinal);
    }

    /// Make every `delete_container` call fail with `Unavailable`.
    pub async fn fail_deletes(&self, fail: bool) {
        self.state.lock().await.fail_deletes = fail;
    }

    pub async fn create_duplicates(&self, enabled: bool) {
        self.state.lock().await.create_duplicates = enabled;
    }

    /// Strip the attachment from a stored message, keeping the message.
    pub async fn drop_attachment(&self, container: &ContainerRef, part: &PartRef) -> bool {
        let mut state = self.state.lock().await;
        state
            .containers
            .get_mut(container)
            .and_then(|c| c.messages.iter_mut().find(|m| &m.part == part))
            .map(|m| m.attachment = None)
            .is_some()
    }

    /// Cut a stored attachment down to its first `len` bytes.
    pub async fn truncate_attachment(
        &self,
        container: &ContainerRef,
        part: &PartRef,
        len: usize,
    ) -> bool {
        let mut state = self.state.lock().await;
        state
            .containers
            .get_mut(container)
            .and_then(|c| c.messages.iter_mut().find(|m| &m.part == part))
            .and_then(|m| m.attachment.as_mut())
            .map(|a| a.data.truncate(len))
            .is_some()
    }

    /// Remove a container behind the engine's back.
    pub async fn remove_container(&self, container: &ContainerRef) -> bool {
        self.state.lock().await.containers.remove(container).is_some()
    }

    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }

    pub async fn contains(&self, container: &ContainerRef) -> bool {
        self.state.lock().await.containers.contains_key(container)
    }

    pub async fn container_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.containers.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    pub async fn send_calls(&self) -> usize {
        self.state.lock().await.send_calls
    }

    pub async fn fetch_calls(&self) -> usize {
        self.state.lock().await.fetch_calls
    }

    pub async fn list_calls(&self) -> usize {
        self.state.lock().await.list_calls
    }
}

#[async_trait]
impl BlobChannel for MemoryChannel {
    async fn create_container(&self, name: &str) -> ChannelResult<ContainerRef> {
        let mut state = self.state.lock().await;
        let taken = state.containers.values().any(|c| c.name == name);
        if taken && !state.create_duplicates {
            return Err(ChannelError::Conflict {
                name: name.to_string(),
                created: None,
            });
        }

        let container = ContainerRef(state.allocate("container"));
        state.containers.insert(
            container.clone(),
            StoredContainer {
                name: name.to_string(),
                messages: Vec::new(),
            },
        );

        if taken {
            return Err(ChannelError::Conflict {
                name: name.to_string(),
                created: Some(container),
            });
        }
        Ok(container)
    }

    async fn delete_container(&self, container: &ContainerRef) -> ChannelResult<()> {
        let mut state = self.state.lock().await;
        if state.fail_deletes {
            return Err(ChannelError::Unavailable("delete rejected".into()));
        }
        state
            .containers
            .remove(container)
            .map(|_| ())
            .ok_or_else(|| ChannelError::NotFound(container.to_string()))
    }

    async fn send_part(
        &self,
        container: &ContainerRef,
        ordinal: u32,
        data: Bytes,
        filename: &str,
    ) -> ChannelResult<PartRef> {
        let mut state = self.state.lock().await;
        state.send_calls += 1;
        if state.fail_sends_at.contains(&ordinal) {
            return Err(ChannelError::Unavailable(format!(
                "send of part {ordinal} rejected"
            )));
        }

        let part = PartRef(state.allocate("message"));
        let stored = state
            .containers
            .get_mut(container)
            .ok_or_else(|| ChannelError::NotFound(container.to_string()))?;
        stored.messages.push(StoredMessage {
            part: part.clone(),
            attachment: Some(Attachment {
                filename: filename.to_string(),
                data,
            }),
        });
        Ok(part)
    }

    async fn list_messages(&self, container: &ContainerRef) -> ChannelResult<Vec<RemoteMessage>> {
        let mut state = self.state.lock().await;
        state.list_calls += 1;
        let stored = state
            .containers
            .get(container)
            .ok_or_else(|| ChannelError::NotFound(container.to_string()))?;
        Ok(stored
            .messages
            .iter()
            .map(|m| RemoteMessage {
                part_ref: m.part.clone(),
                attachments: m
                    .attachment
                    .iter()
                    .map(|a| AttachmentInfo {
                        filename: a.filename.clone(),
                        size_bytes: a.data.len() as u64,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn fetch_attachment(
        &self,
        container: &ContainerRef,
        part: &PartRef,
    ) -> ChannelResult<Option<Attachment>> {
        let mut state = self.state.lock().await;
        state.fetch_calls += 1;
        let stored = state
            .containers
            .get(container)
            .ok_or_else(|| ChannelError::NotFound(container.to_string()))?;
        let message = stored
            .messages
            .iter()
            .find(|m| &m.part == part)
            .ok_or_else(|| ChannelError::NotFound(part.to_string()))?;
        Ok(message.attachment.clone())
    }
}
