//! Durable chunk storage.
//!
//! The [`ChunkArchive`] trait is the coordinator's only view of remote state: it
//! uploads sealed chunks and answers where a partition's archive currently ends.

mod store;

pub use store::{ArchivedChunk, ObjectStoreArchive};

use object_store::path::Path;

use crate::{chunk_writer::SealedChunk, error::ArchiverResult, messages::TopicPartition};

/// Confirmation that a chunk has been durably committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    /// Key of the uploaded data object.
    pub data_key: Path,
    /// Key of the uploaded index object.
    pub index_key: Path,
    /// The partition's archive now ends just before this offset.
    pub next_offset: u64,
}

/// Durable home of sealed chunks and the source of truth for resume offsets.
///
/// Implementations must make an upload visible atomically: readers either see
/// the whole chunk with its index, or nothing of it.
#[async_trait::async_trait]
pub trait ChunkArchive
where
    Self: Send + Sync + std::fmt::Debug,
{
    /// Returns the first offset that is not yet durably archived for `partition`,
    /// or `None` if nothing has ever been archived for it.
    ///
    /// # Errors
    /// Returns an error if the archive could not be reached in time or holds a
    /// corrupt index.
    async fn fetch_last_committed_offset(
        &self,
        partition: &TopicPartition,
    ) -> ArchiverResult<Option<u64>>;

    /// Uploads a sealed chunk together with its index.
    ///
    /// Uploading the same chunk twice must leave exactly one chunk behind.
    ///
    /// # Errors
    /// Returns an error if the local files could not be read or the upload
    /// did not complete.
    async fn upload_chunk(&self, chunk: &SealedChunk) -> ArchiverResult<ChunkReceipt>;
}
