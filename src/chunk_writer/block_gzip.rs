//! Block-gzip chunk writer.
//!
//! Records are written as newline-terminated lines into a sequence of gzip
//! members. A member is closed once its uncompressed size reaches the block
//! threshold, so every member listed in the chunk's [`ChunkIndex`] can be
//! fetched and decompressed on its own.
use std::{
    fmt,
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use flate2::{Compression, write::GzEncoder};

use crate::{
    error::{ArchiverError, ArchiverResult},
    messages::{SinkRecord, TopicPartition},
};

use super::{
    ChunkWriter, ChunkWriterFactory, SealedChunk,
    index::{BlockIndexEntry, ChunkIndex},
};

/// Tracks how many bytes have been handed to the underlying file.
#[derive(Debug)]
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

type ChunkFile = CountingWriter<BufWriter<File>>;

#[derive(Debug)]
struct OpenBlock {
    byte_offset: u64,
    first_record_offset: u64,
    num_records: u32,
    uncompressed_bytes: u64,
}

/// Writes one partition's chunk as a block-gzip data file plus a binary index.
pub struct BlockGzipWriter {
    partition: TopicPartition,
    data_path: PathBuf,
    index_path: PathBuf,
    start_offset: u64,
    next_offset: u64,
    block_threshold_bytes: u64,
    file: Option<ChunkFile>,
    block: Option<(GzEncoder<ChunkFile>, OpenBlock)>,
    blocks: Vec<BlockIndexEntry>,
    record_count: u64,
    finalized: bool,
}

impl fmt::Debug for BlockGzipWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockGzipWriter")
            .field("partition", &self.partition)
            .field("data_path", &self.data_path)
            .field("start_offset", &self.start_offset)
            .field("record_count", &self.record_count)
            .field("blocks", &self.blocks.len())
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl BlockGzipWriter {
    /// Creates the data file for a new chunk inside `local_dir`.
    ///
    /// Side effect: if `local_dir` does not exist, this simply creates it.
    pub fn create(
        partition: &TopicPartition,
        local_dir: &Path,
        start_offset: u64,
        block_threshold_bytes: u64,
    ) -> ArchiverResult<Self> {
        std::fs::create_dir_all(local_dir)?;

        // The uuid keeps a new writer from reusing a stale writer's files when a
        // partition is reassigned at the same offset.
        let name = format!(
            "{}-{:05}-{:020}-{}",
            partition.topic(),
            partition.partition(),
            start_offset,
            uuid::Uuid::new_v4().simple()
        );

        let data_path = local_dir.join(format!("{}.gz", name));
        let index_path = local_dir.join(format!("{}.index", name));

        let file = File::create(&data_path)?;

        tracing::debug!("Created chunk file {:?} for {}", data_path, partition);

        Ok(Self {
            partition: partition.clone(),
            data_path,
            index_path,
            start_offset,
            next_offset: start_offset,
            block_threshold_bytes: block_threshold_bytes.max(1),
            file: Some(CountingWriter {
                inner: BufWriter::new(file),
                written: 0,
            }),
            block: None,
            blocks: vec![],
            record_count: 0,
            finalized: false,
        })
    }

    /// Path of the compressed data file.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Path the index is written to on finalize.
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    fn lost_file(&self) -> ArchiverError {
        ArchiverError::Io(io::Error::other(format!(
            "chunk file {:?} was lost after a failed block flush",
            self.data_path
        )))
    }

    /// Returns the open block, starting a new gzip member if none is open.
    fn current_block(
        &mut self,
        first_record_offset: u64,
    ) -> ArchiverResult<&mut (GzEncoder<ChunkFile>, OpenBlock)> {
        if self.block.is_none() {
            let file = self.file.take().ok_or_else(|| self.lost_file())?;
            let byte_offset = file.written;

            self.block = Some((
                GzEncoder::new(file, Compression::default()),
                OpenBlock {
                    byte_offset,
                    first_record_offset,
                    num_records: 0,
                    uncompressed_bytes: 0,
                },
            ));
        }

        let lost = self.lost_file();
        self.block.as_mut().ok_or(lost)
    }

    /// Finishes the open gzip member, if any, and records it in the index.
    fn close_block(&mut self) -> ArchiverResult<()> {
        if let Some((encoder, open)) = self.block.take() {
            let file = encoder.finish()?;

            self.blocks.push(BlockIndexEntry {
                byte_offset: open.byte_offset,
                byte_length: file.written - open.byte_offset,
                first_record_offset: open.first_record_offset,
                num_records: open.num_records,
            });

            self.file = Some(file);
        }

        Ok(())
    }
}

impl ChunkWriter for BlockGzipWriter {
    fn append(&mut self, record: &SinkRecord) -> ArchiverResult<u64> {
        if self.finalized {
            return Err(ArchiverError::WriterFinalized(self.partition.clone()));
        }

        let block_full = self
            .block
            .as_ref()
            .is_some_and(|(_, open)| open.uncompressed_bytes >= self.block_threshold_bytes);

        if block_full {
            self.close_block()?;
        }

        let (encoder, open) = self.current_block(record.offset)?;

        encoder.write_all(&record.value)?;
        encoder.write_all(b"\n")?;

        open.num_records += 1;
        open.uncompressed_bytes += record.value.len() as u64 + 1;

        self.record_count += 1;
        self.next_offset = record.offset + 1;

        Ok(self.record_count)
    }

    fn finalize(&mut self) -> ArchiverResult<SealedChunk> {
        if self.finalized {
            return Err(ArchiverError::WriterFinalized(self.partition.clone()));
        }

        self.close_block()?;

        let file = self.file.as_mut().ok_or_else(|| {
            ArchiverError::Io(io::Error::other("chunk file missing during finalize"))
        })?;

        file.flush()?;
        file.inner.get_ref().sync_all()?;

        let index = ChunkIndex {
            start_offset: self.start_offset,
            end_offset: self.next_offset,
            blocks: self.blocks.clone(),
        };

        std::fs::write(&self.index_path, index.to_bytes()?)?;

        self.file = None;
        self.finalized = true;

        tracing::debug!(
            "Finalized chunk for {} covering [{}, {}) in {} blocks",
            self.partition,
            self.start_offset,
            self.next_offset,
            self.blocks.len()
        );

        Ok(SealedChunk {
            partition: self.partition.clone(),
            data_path: self.data_path.clone(),
            index_path: self.index_path.clone(),
            start_offset: self.start_offset,
            end_offset: self.next_offset,
            record_count: self.record_count,
        })
    }

    fn discard(&mut self) -> ArchiverResult<()> {
        self.block = None;
        self.file = None;
        self.finalized = true;

        for path in [&self.data_path, &self.index_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    fn record_count(&self) -> u64 {
        self.record_count
    }
}

/// Creates a [`BlockGzipWriter`] per chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockGzipWriterFactory;

impl ChunkWriterFactory for BlockGzipWriterFactory {
    fn create(
        &self,
        partition: &TopicPartition,
        local_dir: &Path,
        start_offset: u64,
        block_threshold_bytes: u64,
    ) -> ArchiverResult<Box<dyn ChunkWriter>> {
        Ok(Box::new(BlockGzipWriter::create(
            partition,
            local_dir,
            start_offset,
            block_threshold_bytes,
        )?))
    }
}
