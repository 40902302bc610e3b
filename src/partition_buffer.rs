//! Per-partition buffering state.
use crate::{
    chunk_writer::{ChunkWriter, SealedChunk},
    error::{ArchiverError, ArchiverResult},
    messages::{SinkRecord, TopicPartition},
};

/// One partition's current chunk: its writer plus the offsets it covers.
///
/// A buffer is only ever created at an offset known to be durable, either
/// recovered from the archive or confirmed by the previous upload.
#[derive(Debug)]
pub struct PartitionBuffer {
    partition: TopicPartition,
    writer: Box<dyn ChunkWriter>,
    start_offset: u64,
    next_offset: u64,
    record_count: u64,
    first_offset: Option<u64>,
    replay_from: Option<u64>,
    sealed: Option<SealedChunk>,
}

impl PartitionBuffer {
    /// Wraps a freshly created writer starting at `start_offset`.
    pub fn new(partition: TopicPartition, writer: Box<dyn ChunkWriter>, start_offset: u64) -> Self {
        Self {
            partition,
            writer,
            start_offset,
            next_offset: start_offset,
            record_count: 0,
            first_offset: None,
            replay_from: None,
            sealed: None,
        }
    }

    /// Makes the buffer ignore records until `offset` is delivered again.
    ///
    /// Used when a failed writer is replaced mid-chunk: records retried from the
    /// failed batch would otherwise land after a hole where the lost records were.
    pub fn replaying_from(mut self, offset: Option<u64>) -> Self {
        self.replay_from = offset;
        self
    }

    /// The partition this buffer belongs to.
    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Offset of the first record this chunk contains.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    /// Offset the next appended record is expected to carry.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Records written since the buffer was created.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// The offset a replacement buffer has to replay from: the first record this
    /// chunk holds, or the one it is itself still waiting for.
    pub fn replay_offset(&self) -> Option<u64> {
        self.first_offset.or(self.replay_from)
    }

    /// Whether the chunk has been finalized and is waiting for upload.
    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    /// Appends a record, returning `false` if it was skipped as a redelivery of
    /// an offset this buffer already holds, or while waiting for a replay.
    ///
    /// # Errors
    /// Fails with [`ArchiverError::ChunkPendingUpload`] while the chunk is sealed,
    /// or with the writer's error if the local write failed.
    pub fn append(&mut self, record: &SinkRecord) -> ArchiverResult<bool> {
        if self.is_sealed() {
            return Err(ArchiverError::ChunkPendingUpload(self.partition.clone()));
        }

        if record.offset < self.next_offset {
            tracing::debug!(
                "Skipping redelivered record {} for {}, buffer is at {}",
                record.offset,
                self.partition,
                self.next_offset
            );
            return Ok(false);
        }

        if let Some(expected) = self.replay_from {
            if record.offset != expected {
                tracing::debug!(
                    "Skipping record {} for {} until replay from {}",
                    record.offset,
                    self.partition,
                    expected
                );
                return Ok(false);
            }
        }

        self.record_count = self.writer.append(record)?;
        self.next_offset = record.offset + 1;
        self.first_offset.get_or_insert(record.offset);
        self.replay_from = None;

        Ok(true)
    }

    /// Seals the chunk for upload.
    ///
    /// Idempotent: once sealed, later calls return the same artifacts without
    /// touching the writer again.
    pub fn finalize(&mut self) -> ArchiverResult<SealedChunk> {
        if let Some(sealed) = &self.sealed {
            tracing::debug!("Chunk for {} already sealed, reusing it", self.partition);
            return Ok(sealed.clone());
        }

        let sealed = self.writer.finalize()?;
        self.sealed = Some(sealed.clone());

        Ok(sealed)
    }

    /// Closes the writer and deletes its local files.
    ///
    /// Best effort: failures are logged, never returned. The buffer must not be
    /// written to afterwards.
    pub fn discard(&mut self) {
        if let Err(err) = self.writer.discard() {
            tracing::warn!(
                "Failed to delete local chunk files for {}: {:#?}",
                self.partition,
                err
            );
        }
    }
}
