//! Local chunk writers.
//!
//! A [`ChunkWriter`] owns the on-disk artifacts of one partition's current chunk.
//! Writers are created through a [`ChunkWriterFactory`] so the coordinator can be
//! exercised with any compression format.

pub mod block_gzip;
pub mod index;

use std::path::{Path, PathBuf};

use crate::{
    error::ArchiverResult,
    messages::{SinkRecord, TopicPartition},
};

/// A finalized chunk ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedChunk {
    /// The partition the chunk belongs to.
    pub partition: TopicPartition,
    /// Path of the compressed data file.
    pub data_path: PathBuf,
    /// Path of the encoded [`index::ChunkIndex`].
    pub index_path: PathBuf,
    /// Offset of the first record in the chunk.
    pub start_offset: u64,
    /// First offset after the chunk's last record.
    pub end_offset: u64,
    /// Number of records in the chunk.
    pub record_count: u64,
}

/// Streaming compressor and indexer for one partition's buffered records.
pub trait ChunkWriter
where
    Self: Send + std::fmt::Debug,
{
    /// Appends a record and returns the number of records written so far.
    ///
    /// # Errors
    /// Returns an error if the local file could not be written, or if the writer
    /// was already finalized.
    fn append(&mut self, record: &SinkRecord) -> ArchiverResult<u64>;

    /// Flushes and closes the data file, writes the index and returns the sealed
    /// artifacts.
    ///
    /// # Errors
    /// Calling this twice returns [`crate::error::ArchiverError::WriterFinalized`]
    /// and leaves the sealed files untouched.
    fn finalize(&mut self) -> ArchiverResult<SealedChunk>;

    /// Closes the writer and removes its local files.
    fn discard(&mut self) -> ArchiverResult<()>;

    /// Number of records written since the writer was created.
    fn record_count(&self) -> u64;
}

/// Creates [`ChunkWriter`]s for newly started chunks.
pub trait ChunkWriterFactory
where
    Self: Send + Sync + std::fmt::Debug,
{
    /// Creates a writer for `partition` whose first record will be `start_offset`.
    ///
    /// `block_threshold_bytes` bounds the uncompressed size of each independently
    /// readable block in the chunk.
    fn create(
        &self,
        partition: &TopicPartition,
        local_dir: &Path,
        start_offset: u64,
        block_threshold_bytes: u64,
    ) -> ArchiverResult<Box<dyn ChunkWriter>>;
}
