//! LocalDirChannel is a filesystem-backed blob channel.
//!
//! Stands in for the messaging platform when running the engine locally.
//! Layout beneath `root`:
//!
//! ```text
//! names/{shard}/{shard}/{name}          container id, claims the name
//! containers/{id}/NAME                  the name the container was created with
//! containers/{id}/messages/{seq}/{file} one attachment per message
//! ```
//!
//! Name claims use `create_new`, so two concurrent creates of the same name
//! cannot both succeed.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

use super::{
    Attachment, AttachmentInfo, BlobChannel, ChannelError, ChannelResult, ContainerRef, PartRef,
    RemoteMessage,
};

const NAME_FILE: &str = "NAME";
const MESSAGE_SEQ_WIDTH: usize = 10;
const MAX_SEND_ATTEMPTS: usize = 8;

#[derive(Clone, Debug)]
pub struct LocalDirChannel {
    root: PathBuf,
}

impl LocalDirChannel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Two-level shard for a container name: first two bytes of MD5(name).
    fn name_shards(name: &str) -> (String, String) {
        let digest = md5::compute(name);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn names_root(&self) -> PathBuf {
        self.root.join("names")
    }

    fn name_path(&self, name: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::name_shards(name);
        let mut path = self.names_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(name);
        path
    }

    fn container_path(&self, container: &ContainerRef) -> PathBuf {
        self.root.join("containers").join(container.as_str())
    }

    fn messages_path(&self, container: &ContainerRef) -> PathBuf {
        self.container_path(container).join("messages")
    }

    /// Resolve the messages directory, mapping a missing container to `NotFound`.
    async fn existing_messages_path(&self, container: &ContainerRef) -> ChannelResult<PathBuf> {
        ensure_component_safe(container.as_str())?;
        let path = self.messages_path(container);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(path),
            Ok(_) => Err(ChannelError::NotFound(container.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ChannelError::NotFound(container.to_string()))
            }
            Err(err) => Err(unavailable(err)),
        }
    }
}

/// Remove `dir` and each parent that becomes empty, never touching `root`.
async fn prune_up_to(dir: &Path, root: &Path) {
    for candidate in dir
        .ancestors()
        .take_while(|p| *p != root && p.starts_with(root))
    {
        if let Err(err) = fs::remove_dir(candidate).await {
            if !matches!(err.kind(), ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty) {
                debug!("left {} in place: {}", candidate.display(), err);
            }
            break;
        }
    }
}

#[async_trait]
impl BlobChannel for LocalDirChannel {
    async fn create_container(&self, name: &str) -> ChannelResult<ContainerRef> {
        ensure_component_safe(name)?;
        let claim = self.name_path(name);
        if let Some(parent) = claim.parent() {
            fs::create_dir_all(parent).await.map_err(unavailable)?;
        }

        let container = ContainerRef(Uuid::new_v4().simple().to_string());
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&claim)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(ChannelError::Conflict {
                    name: name.to_string(),
                    created: None,
                });
            }
            Err(err) => return Err(unavailable(err)),
        };

        let setup = async {
            file.write_all(container.as_str().as_bytes()).await?;
            file.sync_all().await?;
            fs::create_dir_all(self.messages_path(&container)).await?;
            fs::write(self.container_path(&container).join(NAME_FILE), name).await
        };
        if let Err(err) = setup.await {
            let _ = fs::remove_file(&claim).await;
            let _ = fs::remove_dir_all(self.container_path(&container)).await;
            return Err(unavailable(err));
        }

        debug!("created container {} named {}", container, name);
        Ok(container)
    }

    async fn delete_container(&self, container: &ContainerRef) -> ChannelResult<()> {
        ensure_component_safe(container.as_str())?;
        let path = self.container_path(container);
        let name = match fs::read_to_string(path.join(NAME_FILE)).await {
            Ok(name) => name,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ChannelError::NotFound(container.to_string()));
            }
            Err(err) => return Err(unavailable(err)),
        };

        fs::remove_dir_all(&path).await.map_err(unavailable)?;

        let claim = self.name_path(&name);
        match fs::read_to_string(&claim).await {
            Ok(owner) if owner == container.as_str() => {
                fs::remove_file(&claim).await.map_err(unavailable)?;
                if let Some(parent) = claim.parent() {
                    prune_up_to(parent, &self.names_root()).await;
                }
            }
            Ok(_) => debug!("name {} was claimed by another container", name),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(unavailable(err)),
        }

        debug!("deleted container {}", container);
        Ok(())
    }

    async fn send_part(
        &self,
        container: &ContainerRef,
        ordinal: u32,
        data: Bytes,
        filename: &str,
    ) -> ChannelResult<PartRef> {
        ensure_component_safe(filename)?;
        let messages = self.existing_messages_path(container).await?;

        // Claim the next sequence number; create_dir fails if another send won.
        let mut attempt = 0;
        let (part, message_dir) = loop {
            let seq = count_entries(&messages).await.map_err(unavailable)? + 1 + attempt;
            let part = PartRef(format!("{seq:0width$}", width = MESSAGE_SEQ_WIDTH));
            let dir = messages.join(part.as_str());
            match fs::create_dir(&dir).await {
                Ok(()) => break (part, dir),
                Err(err) if err.kind() == ErrorKind::AlreadyExists && attempt < MAX_SEND_ATTEMPTS => {
                    attempt += 1;
                }
                Err(err) => return Err(unavailable(err)),
            }
        };

        let tmp_path = message_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, message_dir.join(filename)).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_dir_all(&message_dir).await;
            return Err(unavailable(err));
        }

        debug!(
            "stored part {} of container {} as message {} ({} bytes)",
            ordinal,
            container,
            part,
            data.len()
        );
        Ok(part)
    }

    async fn list_messages(&self, container: &ContainerRef) -> ChannelResult<Vec<RemoteMessage>> {
        let messages = self.existing_messages_path(container).await?;
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&messages).await.map_err(unavailable)?;
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            if let Some(id) = entry.file_name().to_str() {
                ids.push(id.to_string());
            }
        }
        ids.sort();

        let mut listing = Vec::with_capacity(ids.len());
        for id in ids {
            let attachments = read_attachments(&messages.join(&id))
                .await
                .map_err(unavailable)?
                .into_iter()
                .map(|(filename, size_bytes, _)| AttachmentInfo {
                    filename,
                    size_bytes,
                })
                .collect();
            listing.push(RemoteMessage {
                part_ref: PartRef(id),
                attachments,
            });
        }
        Ok(listing)
    }

    async fn fetch_attachment(
        &self,
        container: &ContainerRef,
        part: &PartRef,
    ) -> ChannelResult<Option<Attachment>> {
        ensure_component_safe(part.as_str())?;
        let messages = self.existing_messages_path(container).await?;
        let message_dir = messages.join(part.as_str());
        let attachments = match read_attachments(&message_dir).await {
            Ok(found) => found,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ChannelError::NotFound(format!("{}/{}", container, part)));
            }
            Err(err) => return Err(unavailable(err)),
        };

        match attachments.into_iter().next() {
            Some((filename, _, path)) => {
                let data = fs::read(&path).await.map_err(unavailable)?;
                Ok(Some(Attachment {
                    filename,
                    data: Bytes::from(data),
                }))
            }
            None => Ok(None),
        }
    }
}

/// Attachments stored in a message directory, sorted by filename.
async fn read_attachments(dir: &Path) -> io::Result<Vec<(String, u64, PathBuf)>> {
    let mut found = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with(".tmp-") {
            continue;
        }
        let meta = entry.metadata().await?;
        if meta.is_file() {
            found.push((name, meta.len(), entry.path()));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

async fn count_entries(dir: &Path) -> io::Result<usize> {
    let mut count = 0;
    let mut entries = fs::read_dir(dir).await?;
    while entries.next_entry().await?.is_some() {
        count += 1;
    }
    Ok(count)
}

/// Names and ids become path components; reject anything that could escape.
fn ensure_component_safe(value: &str) -> ChannelResult<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.starts_with(".tmp-")
        || value.contains('/')
        || value.contains('\\')
        || value.bytes().any(|b| b.is_ascii_control())
    {
        return Err(ChannelError::NotFound(value.to_string()));
    }
    Ok(())
}

fn unavailable(err: io::Error) -> ChannelError {
    ChannelError::Unavailable(err.to_string())
}
