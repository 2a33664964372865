//! Per-call deadline for any [`BlobChannel`].

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use super::{
    Attachment, BlobChannel, ChannelError, ChannelResult, ContainerRef, PartRef, RemoteMessage,
};

/// Wraps a channel so that each remote call fails with
/// [`ChannelError::Unavailable`] once `limit` elapses.
#[derive(Debug)]
pub struct TimeoutChannel<C> {
    inner: C,
    limit: Duration,
}

impl<C> TimeoutChannel<C> {
    pub fn new(inner: C, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = ChannelResult<T>>,
    ) -> ChannelResult<T> {
        match tokio::time::timeout(self.limit, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} timed out after {:?}", operation, self.limit);
                Err(ChannelError::Unavailable(format!(
                    "{operation} timed out after {:?}",
                    self.limit
                )))
            }
        }
    }
}

#[async_trait]
impl<C: BlobChannel> BlobChannel for TimeoutChannel<C> {
    async fn create_container(&self, name: &str) -> ChannelResult<ContainerRef> {
        self.bounded("create_container", self.inner.create_container(name))
            .await
    }

    async fn delete_container(&self, container: &ContainerRef) -> ChannelResult<()> {
        self.bounded("delete_container", self.inner.delete_container(container))
            .await
    }

    async fn send_part(
        &self,
        container: &ContainerRef,
        ordinal: u32,
        data: Bytes,
        filename: &str,
    ) -> ChannelResult<PartRef> {
        self.bounded(
            "send_part",
            self.inner.send_part(container, ordinal, data, filename),
        )
        .await
    }

    async fn list_messages(&self, container: &ContainerRef) -> ChannelResult<Vec<RemoteMessage>> {
        self.bounded("list_messages", self.inner.list_messages(container))
            .await
    }

    async fn fetch_attachment(
        &self,
        container: &ContainerRef,
        part: &PartRef,
    ) -> ChannelResult<Option<Attachment>> {
        self.bounded(
            "fetch_attachment",
            self.inner.fetch_attachment(container, part),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;

    /// Channel whose every call takes longer than any sensible deadline.
    struct Stalled;

    #[async_trait]
    impl BlobChannel for Stalled {
        async fn create_container(&self, _name: &str) -> ChannelResult<ContainerRef> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ContainerRef("late".into()))
        }

        async fn delete_container(&self, _container: &ContainerRef) -> ChannelResult<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn send_part(
            &self,
            _container: &ContainerRef,
            _ordinal: u32,
            _data: Bytes,
            _filename: &str,
        ) -> ChannelResult<PartRef> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(PartRef("late".into()))
        }

        async fn list_messages(
            &self,
            _container: &ContainerRef,
        ) -> ChannelResult<Vec<RemoteMessage>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        async fn fetch_attachment(
            &self,
            _container: &ContainerRef,
            _part: &PartRef,
        ) -> ChannelResult<Option<Attachment>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_become_unavailable() {
        let channel = TimeoutChannel::new(Stalled, Duration::from_secs(5));
        let container = ContainerRef("c".into());

        let sent = channel
            .send_part(&container, 1, Bytes::from_static(b"x"), "x")
            .await;
        assert!(matches!(sent, Err(ChannelError::Unavailable(msg)) if msg.contains("send_part")));
        assert!(matches!(
            channel.create_container("n").await,
            Err(ChannelError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_calls_pass_through() {
        let channel = TimeoutChannel::new(MemoryChannel::new(), Duration::from_secs(5));
        let container = channel.create_container("fast").await.unwrap();
        let part = channel
            .send_part(&container, 1, Bytes::from_static(b"abc"), "fast")
            .await
            .unwrap();
        let fetched = channel
            .fetch_attachment(&container, &part)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.data.as_ref(), b"abc");
        assert_eq!(channel.inner().container_count().await, 1);
    }
}
