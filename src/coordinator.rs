//! The partition-buffering and recovery coordinator.
//!
//! Every owned partition moves through
//!
//! ```text
//! UNASSIGNED -> RECOVERING -> ACTIVE -> (FLUSHING -> ACTIVE)* -> UNASSIGNED
//! ```
//!
//! The resume point of a partition is always derived from the archive, never from
//! a locally cached position, so a crash or rebalance replays from the last
//! committed chunk boundary.
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    archive::ChunkArchive,
    chunk_writer::ChunkWriterFactory,
    error::{ArchiverError, ArchiverResult},
    host::HostContext,
    messages::{SinkRecord, TopicPartition},
    partition_buffer::PartitionBuffer,
};

type BufferSlot = Arc<Mutex<PartitionBuffer>>;

/// Dependencies and settings of a [`SinkCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfiguration {
    /// Where sealed chunks are uploaded and offsets are recovered from.
    pub archive: Arc<dyn ChunkArchive>,
    /// Creates the writer for each new chunk.
    pub writer_factory: Arc<dyn ChunkWriterFactory>,
    /// The host runtime's control surface.
    pub host: Arc<dyn HostContext>,
    /// Scratch directory for chunks being written.
    pub buffer_dir: PathBuf,
    /// Uncompressed bytes per compressed block.
    pub block_threshold_bytes: u64,
}

/// Owns one [`PartitionBuffer`] per assigned partition and implements the
/// assignment, revocation and flush protocol.
///
/// Callbacks for the same partition are expected to be serialized by the host;
/// callbacks for different partitions may run concurrently.
#[derive(Debug)]
pub struct SinkCoordinator {
    config: CoordinatorConfiguration,
    buffers: DashMap<TopicPartition, BufferSlot>,
}

impl SinkCoordinator {
    /// Creates a coordinator that owns no partitions yet.
    pub fn new(config: CoordinatorConfiguration) -> Self {
        Self {
            config,
            buffers: DashMap::new(),
        }
    }

    /// The partitions that currently have a buffer.
    pub fn owned_partitions(&self) -> HashSet<TopicPartition> {
        self.buffers.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of records buffered but not yet uploaded for `partition`.
    pub async fn buffered_records(&self, partition: &TopicPartition) -> Option<u64> {
        let slot = self.slot(partition)?;
        let buffer = slot.lock().await;

        Some(buffer.record_count())
    }

    /// The offset the current chunk of `partition` starts at.
    pub async fn chunk_start_offset(&self, partition: &TopicPartition) -> Option<u64> {
        let slot = self.slot(partition)?;
        let buffer = slot.lock().await;

        Some(buffer.start_offset())
    }

    fn slot(&self, partition: &TopicPartition) -> Option<BufferSlot> {
        // Clone the Arc out so no map guard is held across an await.
        self.buffers.get(partition).map(|e| e.value().clone())
    }

    fn still_owns(&self, partition: &TopicPartition, slot: &BufferSlot) -> bool {
        self.buffers
            .get(partition)
            .is_some_and(|e| Arc::ptr_eq(e.value(), slot))
    }

    fn create_buffer(
        &self,
        partition: &TopicPartition,
        start_offset: u64,
    ) -> ArchiverResult<PartitionBuffer> {
        let writer = self.config.writer_factory.create(
            partition,
            &self.config.buffer_dir,
            start_offset,
            self.config.block_threshold_bytes,
        )?;

        Ok(PartitionBuffer::new(partition.clone(), writer, start_offset))
    }

    /// Swaps a buffer whose writer hit a local I/O error for a fresh one at the same
    /// start offset and seeks the host back so the lost records are delivered again.
    ///
    /// A failed writer may have lost its file or left half a record in it, so it is
    /// never written to again. Returns `err` for the caller to surface.
    fn replace_failed_writer(
        &self,
        buffer: &mut PartitionBuffer,
        err: ArchiverError,
    ) -> ArchiverError {
        if !matches!(err, ArchiverError::Io(_)) {
            return err;
        }

        let partition = buffer.partition().clone();
        let start_offset = buffer.start_offset();

        match self.create_buffer(&partition, start_offset) {
            Ok(fresh) => {
                let fresh = fresh.replaying_from(buffer.replay_offset());
                let mut failed = std::mem::replace(buffer, fresh);
                failed.discard();

                self.config.host.seek(&partition, start_offset);

                tracing::warn!(
                    "Chunk writer for {} failed, rewinding to offset {}: {:#?}",
                    partition,
                    start_offset,
                    err
                );
            }
            Err(create_err) => {
                // The broken buffer stays, so the next failing call tries again.
                tracing::error!(
                    "Failed to replace chunk writer for {}: {:#?}",
                    partition,
                    create_err
                );
            }
        }

        err
    }

    /// Handles newly assigned partitions by recovering each one from the archive.
    ///
    /// Partitions that already have a buffer are left alone. Partitions are
    /// recovered concurrently; the first failure is returned once all attempts
    /// have finished.
    #[tracing::instrument(skip_all, name = "on_assigned")]
    pub async fn on_assigned(&self, partitions: &[TopicPartition]) -> ArchiverResult<()> {
        let new_partitions = partitions
            .iter()
            .filter(|tp| !self.buffers.contains_key(*tp))
            .collect::<Vec<_>>();

        for tp in partitions.iter().filter(|tp| self.buffers.contains_key(*tp)) {
            tracing::debug!("Partition {} is already owned, skipping recovery", tp);
        }

        let results = futures::future::join_all(
            new_partitions
                .into_iter()
                .map(|tp| self.recover_partition(tp)),
        )
        .await;

        results
            .into_iter()
            .find_map(Result::err)
            .map_or(Ok(()), Err)
    }

    /// Rebuilds a partition's buffer from the last committed chunk and points the
    /// host at the matching offset. Returns the resume offset.
    ///
    /// On failure the partition stays paused and unowned.
    async fn recover_partition(&self, partition: &TopicPartition) -> ArchiverResult<u64> {
        tracing::info!("Assigned new partition {} creating buffer writer", partition);

        let host = &self.config.host;
        host.pause(std::slice::from_ref(partition));

        let offset = self
            .config
            .archive
            .fetch_last_committed_offset(partition)
            .await
            .map_err(|err| {
                tracing::error!("Failed to recover {} from the archive: {:#?}", partition, err);
                ArchiverError::Recovery {
                    partition: partition.clone(),
                    source: Box::new(err),
                }
            })?
            .unwrap_or(0);

        tracing::info!("Recovering partition {} from offset {}", partition, offset);

        let buffer = self
            .create_buffer(partition, offset)
            .map_err(|err| ArchiverError::Recovery {
                partition: partition.clone(),
                source: Box::new(err),
            })?;

        self.buffers
            .insert(partition.clone(), Arc::new(Mutex::new(buffer)));

        host.seek(partition, offset);
        host.resume(std::slice::from_ref(partition));

        Ok(offset)
    }

    /// Discards the buffers of revoked partitions.
    ///
    /// Anything buffered but not uploaded is dropped; the next assignment replays
    /// it from the archive's committed offset. Cleanup failures are logged only.
    #[tracing::instrument(skip_all, name = "on_revoked")]
    pub async fn on_revoked(&self, partitions: &[TopicPartition]) {
        for tp in partitions {
            let Some((_, slot)) = self.buffers.remove(tp) else {
                continue;
            };

            tracing::info!("Revoked partition {} deleting buffer", tp);

            // Waits for an in-flight flush of this partition to let go of the buffer.
            slot.lock().await.discard();
        }
    }

    /// Appends a batch of records to their partitions' buffers, in delivery order.
    ///
    /// Every record must belong to an owned partition; otherwise nothing from the
    /// batch is written and a [`ArchiverError::ProtocolViolation`] is returned.
    /// Records at offsets a buffer already holds are skipped, so a batch redelivered
    /// after a retriable failure is not buffered twice.
    #[tracing::instrument(skip_all, name = "put")]
    pub async fn put(&self, records: &[SinkRecord]) -> ArchiverResult<()> {
        let mut batches: HashMap<TopicPartition, Vec<&SinkRecord>> = HashMap::new();

        for record in records {
            batches
                .entry(record.topic_partition())
                .or_default()
                .push(record);
        }

        let batches = batches
            .into_iter()
            .map(|(tp, batch)| match self.slot(&tp) {
                Some(slot) => Ok((tp, slot, batch)),
                None => {
                    tracing::error!(
                        "Trying to put {} records to partition {} which doesn't exist yet",
                        batch.len(),
                        tp
                    );
                    Err(ArchiverError::ProtocolViolation(format!(
                        "records delivered for unassigned partition {}",
                        tp
                    )))
                }
            })
            .collect::<ArchiverResult<Vec<_>>>()?;

        for (tp, slot, batch) in batches {
            let mut buffer = slot.lock().await;

            if !self.still_owns(&tp, &slot) {
                return Err(ArchiverError::ProtocolViolation(format!(
                    "records delivered for revoked partition {}",
                    tp
                )));
            }

            let mut written = 0;
            for record in batch {
                match buffer.append(record) {
                    Ok(true) => written += 1,
                    Ok(false) => {}
                    Err(err) => return Err(self.replace_failed_writer(&mut buffer, err)),
                }
            }

            tracing::debug!(
                "Buffered {} records for {}, chunk now holds {}",
                written,
                tp,
                buffer.record_count()
            );
        }

        Ok(())
    }

    /// Uploads every non-empty buffer named in `checkpoints` and starts a new
    /// chunk at the checkpointed offset.
    ///
    /// Partitions flush concurrently. A buffer is only replaced once its upload
    /// has been confirmed; after a failed upload it keeps the sealed chunk, so
    /// retrying the flush uploads exactly the same chunk again.
    ///
    /// # Errors
    /// Flushing an unowned partition is a protocol violation and nothing is
    /// uploaded. Otherwise all partitions are attempted and a fatal error, if any,
    /// is returned in preference to a retriable one.
    #[tracing::instrument(skip_all, name = "flush")]
    pub async fn flush(&self, checkpoints: &HashMap<TopicPartition, u64>) -> ArchiverResult<()> {
        let slots = checkpoints
            .iter()
            .map(|(tp, checkpoint)| match self.slot(tp) {
                Some(slot) => Ok((tp, *checkpoint, slot)),
                None => {
                    tracing::error!("Trying to flush partition {} which is not assigned", tp);
                    Err(ArchiverError::ProtocolViolation(format!(
                        "flush requested for unassigned partition {}",
                        tp
                    )))
                }
            })
            .collect::<ArchiverResult<Vec<_>>>()?;

        let results = futures::future::join_all(
            slots
                .into_iter()
                .map(|(tp, checkpoint, slot)| self.flush_partition(tp, checkpoint, slot)),
        )
        .await;

        let mut retriable = None;

        for result in results {
            match result {
                Ok(()) => {}
                Err(err) if err.is_retriable() => {
                    if retriable.is_none() {
                        retriable = Some(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        retriable.map_or(Ok(()), Err)
    }

    async fn flush_partition(
        &self,
        partition: &TopicPartition,
        checkpoint: u64,
        slot: BufferSlot,
    ) -> ArchiverResult<()> {
        let mut buffer = slot.lock().await;

        if !self.still_owns(partition, &slot) {
            tracing::warn!("Partition {} was revoked before it could be flushed", partition);
            return Ok(());
        }

        if buffer.record_count() == 0 {
            tracing::info!("No new records for partition {}", partition);
            return Ok(());
        }

        let chunk = match buffer.finalize() {
            Ok(chunk) => chunk,
            Err(err) => return Err(self.replace_failed_writer(&mut buffer, err)),
        };

        if chunk.end_offset != checkpoint {
            tracing::warn!(
                "Checkpoint {} for {} does not match the end of its chunk [{}, {})",
                checkpoint,
                partition,
                chunk.start_offset,
                chunk.end_offset
            );
        }

        let receipt = self
            .config
            .archive
            .upload_chunk(&chunk)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    "Failed to upload chunk [{}, {}) for {}: {:#?}",
                    chunk.start_offset,
                    chunk.end_offset,
                    partition,
                    err
                );
            })?;

        if !self.still_owns(partition, &slot) {
            // The next assignment recovers from the archive either way.
            tracing::warn!(
                "Partition {} was revoked during upload of {}, ignoring the result",
                partition,
                receipt.data_key
            );
            return Ok(());
        }

        let next = self.create_buffer(partition, checkpoint)?;
        let mut uploaded = std::mem::replace(&mut *buffer, next);
        uploaded.discard();

        tracing::info!(
            "Successfully uploaded chunk for {} now at offset {}",
            partition,
            checkpoint
        );

        Ok(())
    }

    /// Releases every owned partition, deleting local buffers.
    ///
    /// Buffered records are not uploaded; they are replayed from the archive's
    /// committed offsets when the partitions are assigned again.
    #[tracing::instrument(skip_all, name = "stop")]
    pub async fn stop(&self) {
        let owned = self.owned_partitions().into_iter().collect::<Vec<_>>();

        self.on_revoked(&owned).await;
    }
}
