//! Diff channels over a duplex byte stream.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use silo_common::{SiloError, SiloResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// An ordered sequence of diffs, each a sequence of chunks.
#[async_trait]
pub trait DiffChannel: Send {
    /// Append a chunk to the diff being written.
    async fn write_chunk(&mut self, chunk: Bytes) -> SiloResult<()>;

    /// Mark the end of the diff being written.
    async fn finish(&mut self) -> SiloResult<()>;

    /// Read the next chunk of the current diff; `None` at its end.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Migration`] if the peer closes the stream
    /// mid-diff.
    async fn read_chunk(&mut self) -> SiloResult<Option<Bytes>>;
}

/// A [`DiffChannel`] over any duplex stream.
///
/// Chunks travel as length-delimited frames; an empty frame ends a diff.
#[derive(Debug)]
pub struct FramedChannel<T> {
    framed: Framed<T, LengthDelimitedCodec>,
}

impl<T> FramedChannel<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Maximum frame size accepted from the peer.
    pub const MAX_FRAME: usize = 16 * 1024 * 1024;

    /// Wrap a stream.
    pub fn new(stream: T) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(Self::MAX_FRAME)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
        }
    }

    /// Unwrap the stream.
    pub fn into_inner(self) -> T {
        self.framed.into_inner()
    }
}

#[async_trait]
impl<T> DiffChannel for FramedChannel<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn write_chunk(&mut self, chunk: Bytes) -> SiloResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.framed.send(chunk).await?;
        Ok(())
    }

    async fn finish(&mut self) -> SiloResult<()> {
        self.framed.send(Bytes::new()).await?;
        Ok(())
    }

    async fn read_chunk(&mut self) -> SiloResult<Option<Bytes>> {
        match self.framed.next().await {
            Some(Ok(frame)) if frame.is_empty() => Ok(None),
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(err)) => Err(SiloError::migration(format!("stream error: {err}"))),
            None => Err(SiloError::migration("peer closed the stream mid-diff")),
        }
    }
}

/// Read one whole diff into memory.
///
/// # Errors
///
/// Propagates channel errors.
pub async fn read_diff(channel: &mut dyn DiffChannel) -> SiloResult<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = channel.read_chunk().await? {
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn diffs_keep_their_boundaries() {
        let (a, b) = tokio::io::duplex(1024);
        let mut tx = FramedChannel::new(a);
        let mut rx = FramedChannel::new(b);

        let writer = tokio::spawn(async move {
            tx.write_chunk(Bytes::from_static(b"hello ")).await.unwrap();
            tx.write_chunk(Bytes::new()).await.unwrap();
            tx.write_chunk(Bytes::from_static(b"world")).await.unwrap();
            tx.finish().await.unwrap();
            tx.finish().await.unwrap();
            tx
        });

        assert_eq!(read_diff(&mut rx).await.unwrap(), b"hello world");
        assert_eq!(read_diff(&mut rx).await.unwrap(), b"");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn peer_closing_mid_diff_is_an_error() {
        let (a, b) = tokio::io::duplex(1024);
        let mut tx = FramedChannel::new(a);
        let mut rx = FramedChannel::new(b);

        tx.write_chunk(Bytes::from_static(b"partial")).await.unwrap();
        drop(tx);

        assert_eq!(
            rx.read_chunk().await.unwrap(),
            Some(Bytes::from_static(b"partial"))
        );
        assert!(matches!(
            rx.read_chunk().await,
            Err(SiloError::Migration { .. })
        ));
    }
}
