//! Migration transport.
//!
//! A volume travels as an ordered sequence of diffs over a [`DiffChannel`]:
//! one per user snapshot (oldest first, each relative to the previous), then
//! one for the live state, and for live migration a second one taken after
//! the instance was checkpointed.

mod channel;
mod sink;
mod source;

pub use channel::{DiffChannel, FramedChannel, read_diff};
pub use sink::{MigrationSink, NoopObserver, ReceiveObserver};
pub use source::MigrationSource;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use silo_common::SiloResult;

/// Describes the transfer that follows on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationHeader {
    /// Name of the instance on the sending side.
    pub instance: String,
    /// Storage technology of the sender.
    pub driver: String,
    /// User snapshots that follow, oldest first.
    pub snapshots: Vec<String>,
    /// Whether a post-checkpoint diff follows the live diff.
    pub live: bool,
}

impl MigrationHeader {
    /// Send the header as its own diff.
    ///
    /// # Errors
    ///
    /// Propagates channel errors.
    pub async fn write(&self, channel: &mut dyn DiffChannel) -> SiloResult<()> {
        let json = serde_json::to_vec(self)?;
        channel.write_chunk(Bytes::from(json)).await?;
        channel.finish().await
    }

    /// Receive a header sent with [`MigrationHeader::write`].
    ///
    /// # Errors
    ///
    /// Returns an error on channel failure or malformed JSON.
    pub async fn read(channel: &mut dyn DiffChannel) -> SiloResult<Self> {
        let data = read_diff(channel).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}
