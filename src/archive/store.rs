use std::{future::Future, io::Read, sync::Arc, time::Duration};

use bytes::Bytes;
use flate2::read::GzDecoder;
use object_store::{ObjectStore, PutPayload, RetryConfig, aws::AmazonS3Builder, path::Path};

use crate::{
    chunk_writer::{SealedChunk, index::ChunkIndex},
    config::SinkConfig,
    error::{ArchiverError, ArchiverResult},
    messages::TopicPartition,
};

use super::{ChunkArchive, ChunkReceipt};

const CURSOR_NAME: &str = "last_chunk_index";

/// A chunk read back from the archive.
#[derive(Debug, Clone)]
pub struct ArchivedChunk {
    /// The chunk's decoded index.
    pub index: ChunkIndex,
    /// Every record payload in the chunk, in offset order.
    pub records: Vec<Bytes>,
}

/// [`ChunkArchive`] backed by any [`ObjectStore`].
///
/// Objects are laid out per partition:
///
/// ```text
/// {prefix}/{topic}/{partition:05}/{start_offset:020}.gz
/// {prefix}/{topic}/{partition:05}/{start_offset:020}.index
/// {prefix}/{topic}/{partition:05}/last_chunk_index
/// ```
///
/// The cursor object holds the key of the most recently committed index and is
/// written last, which makes it the commit point of an upload.
#[derive(Debug, Clone)]
pub struct ObjectStoreArchive {
    object_store: Arc<dyn ObjectStore>,
    prefix: Path,
    request_timeout: Duration,
}

impl ObjectStoreArchive {
    /// Creates an archive rooted at `prefix` within `object_store`.
    pub fn new(object_store: Arc<dyn ObjectStore>, prefix: &str, request_timeout: Duration) -> Self {
        Self {
            object_store,
            prefix: Path::from(prefix),
            request_timeout,
        }
    }

    /// Builds an S3-backed archive from the task configuration.
    ///
    /// Credentials and region are taken from the standard AWS environment variables.
    pub fn from_config(config: &SinkConfig) -> ArchiverResult<Self> {
        let object_store = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_retry(RetryConfig {
                max_retries: config.max_retries,
                retry_timeout: config.request_timeout,
                ..Default::default()
            })
            .build()
            .map_err(|e| ArchiverError::Config(format!("Failed to build S3 client: {}", e)))?;

        Ok(Self::new(
            Arc::new(object_store),
            &config.prefix,
            config.request_timeout,
        ))
    }

    fn partition_dir(&self, partition: &TopicPartition) -> Path {
        self.prefix
            .child(partition.topic())
            .child(format!("{:05}", partition.partition()))
    }

    /// Key of the data object for the chunk starting at `start_offset`.
    pub fn data_key(&self, partition: &TopicPartition, start_offset: u64) -> Path {
        self.partition_dir(partition)
            .child(format!("{:020}.gz", start_offset))
    }

    /// Key of the index object for the chunk starting at `start_offset`.
    pub fn index_key(&self, partition: &TopicPartition, start_offset: u64) -> Path {
        self.partition_dir(partition)
            .child(format!("{:020}.index", start_offset))
    }

    /// Key of the partition's cursor object.
    pub fn cursor_key(&self, partition: &TopicPartition) -> Path {
        self.partition_dir(partition).child(CURSOR_NAME)
    }

    /// Runs an object store request under the configured timeout.
    async fn timed<T, F>(&self, operation: &str, request: F) -> ArchiverResult<T>
    where
        F: Future<Output = object_store::Result<T>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => Ok(result?),
            Err(_elapsed) => Err(ArchiverError::Timeout(operation.to_string())),
        }
    }

    async fn get_bytes(&self, operation: &str, key: &Path) -> ArchiverResult<Bytes> {
        self.timed(operation, async {
            self.object_store.get(key).await?.bytes().await
        })
        .await
    }

    /// Reads the index the partition's cursor points at.
    ///
    /// Returns `None` when nothing has been committed for the partition yet.
    pub async fn read_committed_index(
        &self,
        partition: &TopicPartition,
    ) -> ArchiverResult<Option<(Path, ChunkIndex)>> {
        let cursor = match self.get_bytes("get cursor", &self.cursor_key(partition)).await {
            Ok(cursor) => cursor,
            Err(ArchiverError::ObjectStore(object_store::Error::NotFound { .. })) => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let index_key = std::str::from_utf8(&cursor)
            .map_err(|e| ArchiverError::UnableToParseIndex(format!("cursor is not utf-8: {}", e)))
            .and_then(|key| Path::parse(key.trim()).map_err(|e| object_store::Error::from(e).into()))?;

        let index = ChunkIndex::try_from(self.get_bytes("get index", &index_key).await?)?;

        Ok(Some((index_key, index)))
    }

    /// Downloads and decompresses the chunk starting at `start_offset`.
    pub async fn read_chunk(
        &self,
        partition: &TopicPartition,
        start_offset: u64,
    ) -> ArchiverResult<ArchivedChunk> {
        let index = ChunkIndex::try_from(
            self.get_bytes("get index", &self.index_key(partition, start_offset))
                .await?,
        )?;
        let data = self
            .get_bytes("get chunk data", &self.data_key(partition, start_offset))
            .await?;

        // A corrupt record count must not turn into a huge allocation.
        let capacity = usize::try_from(index.record_count())
            .unwrap_or(usize::MAX)
            .min(data.len());
        let mut records = Vec::with_capacity(capacity);

        for block in &index.blocks {
            let start = usize::try_from(block.byte_offset).unwrap_or(usize::MAX);
            let end = block
                .byte_offset
                .checked_add(block.byte_length)
                .and_then(|end| usize::try_from(end).ok())
                .ok_or_else(|| {
                    ArchiverError::UnableToParseIndex(format!(
                        "block at byte {} with length {} overflows",
                        block.byte_offset, block.byte_length
                    ))
                })?;

            if end > data.len() {
                return Err(ArchiverError::UnableToParseIndex(format!(
                    "block [{}, {}) exceeds data object of {} bytes",
                    start,
                    end,
                    data.len()
                )));
            }

            let mut lines = Vec::new();
            GzDecoder::new(&data[start..end]).read_to_end(&mut lines)?;

            let lines = Bytes::from(lines);
            let mut position = 0;

            for _ in 0..block.num_records {
                let length = lines[position..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .ok_or_else(|| {
                        ArchiverError::UnableToParseIndex(format!(
                            "block at byte {} holds fewer than {} records",
                            block.byte_offset, block.num_records
                        ))
                    })?;

                records.push(lines.slice(position..position + length));
                position += length + 1;
            }
        }

        Ok(ArchivedChunk { index, records })
    }
}

#[async_trait::async_trait]
impl ChunkArchive for ObjectStoreArchive {
    #[tracing::instrument(skip_all, name = "fetch_last_committed_offset", fields(partition = %partition))]
    async fn fetch_last_committed_offset(
        &self,
        partition: &TopicPartition,
    ) -> ArchiverResult<Option<u64>> {
        let committed = self.read_committed_index(partition).await?;

        match committed {
            Some((index_key, index)) => {
                tracing::info!(
                    "Last committed chunk for {} is {} ending at offset {}",
                    partition,
                    index_key,
                    index.end_offset
                );
                Ok(Some(index.end_offset))
            }
            None => {
                tracing::info!("No committed chunks found for {}", partition);
                Ok(None)
            }
        }
    }

    #[tracing::instrument(skip_all, name = "upload_chunk", fields(partition = %chunk.partition))]
    async fn upload_chunk(&self, chunk: &SealedChunk) -> ArchiverResult<ChunkReceipt> {
        let data = tokio::fs::read(&chunk.data_path).await?;
        let index_bytes = Bytes::from(tokio::fs::read(&chunk.index_path).await?);

        let index = ChunkIndex::try_from(index_bytes.clone())?;

        if index.start_offset != chunk.start_offset || index.end_offset != chunk.end_offset {
            return Err(ArchiverError::UnableToParseIndex(format!(
                "index covers [{}, {}) but chunk covers [{}, {})",
                index.start_offset, index.end_offset, chunk.start_offset, chunk.end_offset
            )));
        }

        let data_key = self.data_key(&chunk.partition, chunk.start_offset);
        let index_key = self.index_key(&chunk.partition, chunk.start_offset);

        self.timed(
            "put chunk data",
            self.object_store.put(&data_key, PutPayload::from(data)),
        )
        .await?;

        self.timed(
            "put chunk index",
            self.object_store
                .put(&index_key, PutPayload::from(index_bytes)),
        )
        .await?;

        // Moving the cursor commits the chunk.
        self.timed(
            "put cursor",
            self.object_store.put(
                &self.cursor_key(&chunk.partition),
                PutPayload::from(index_key.to_string()),
            ),
        )
        .await?;

        tracing::info!(
            "Uploaded chunk {} covering [{}, {}) with {} records",
            data_key,
            chunk.start_offset,
            chunk.end_offset,
            chunk.record_count
        );

        Ok(ChunkReceipt {
            data_key,
            index_key,
            next_offset: chunk.end_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_writer::{ChunkWriter, block_gzip::BlockGzipWriter};
    use crate::chunk_writer::index::BlockIndexEntry;
    use crate::messages::SinkRecord;
    use flate2::{Compression, write::GzEncoder};
    use object_store::memory::InMemory;
    use std::io::Write;
    use std::path::PathBuf;
    use tracing_test::traced_test;

    fn set_up_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir(&dir).expect("");

        dir
    }

    fn tear_down_dir(dir: PathBuf) {
        std::fs::remove_dir_all(&dir).expect("");
    }

    fn archive(store: Arc<InMemory>) -> ObjectStoreArchive {
        ObjectStoreArchive::new(store, "archive/raw", Duration::from_secs(5))
    }

    fn seal(dir: &std::path::Path, tp: &TopicPartition, offsets: std::ops::Range<u64>) -> SealedChunk {
        let mut writer = BlockGzipWriter::create(tp, dir, offsets.start, 16).expect("");

        for offset in offsets {
            writer
                .append(&SinkRecord::new(
                    tp.topic(),
                    tp.partition(),
                    offset,
                    format!("value-{}", offset),
                ))
                .expect("");
        }

        writer.finalize().expect("")
    }

    #[test]
    fn test_keys_are_partition_scoped_and_sortable() {
        let archive = archive(Arc::new(InMemory::new()));
        let tp = TopicPartition::new("events", 7);

        assert_eq!(
            archive.data_key(&tp, 42).to_string(),
            "archive/raw/events/00007/00000000000000000042.gz"
        );
        assert_eq!(
            archive.index_key(&tp, 42).to_string(),
            "archive/raw/events/00007/00000000000000000042.index"
        );
        assert_eq!(
            archive.cursor_key(&tp).to_string(),
            "archive/raw/events/00007/last_chunk_index"
        );
    }

    #[test]
    fn test_root_prefix() {
        let archive = ObjectStoreArchive::new(Arc::new(InMemory::new()), "", Duration::from_secs(1));

        assert_eq!(
            archive.cursor_key(&TopicPartition::new("t", 0)).to_string(),
            "t/00000/last_chunk_index"
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fetch_offset_for_empty_archive() {
        let archive = archive(Arc::new(InMemory::new()));

        let offset = archive
            .fetch_last_committed_offset(&TopicPartition::new("events", 0))
            .await
            .expect("");

        assert_eq!(offset, None);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_upload_moves_cursor() {
        let dir = set_up_dir();
        let store = Arc::new(InMemory::new());
        let archive = archive(store.clone());
        let tp = TopicPartition::new("events", 0);

        let first = seal(&dir, &tp, 0..10);
        let receipt = archive.upload_chunk(&first).await.expect("");

        assert_eq!(receipt.next_offset, 10);
        assert_eq!(receipt.data_key, archive.data_key(&tp, 0));
        assert_eq!(
            archive.fetch_last_committed_offset(&tp).await.expect(""),
            Some(10)
        );

        let second = seal(&dir, &tp, 10..25);
        archive.upload_chunk(&second).await.expect("");

        assert_eq!(
            archive.fetch_last_committed_offset(&tp).await.expect(""),
            Some(25)
        );

        // Other partitions are unaffected.
        assert_eq!(
            archive
                .fetch_last_committed_offset(&TopicPartition::new("events", 1))
                .await
                .expect(""),
            None
        );

        tear_down_dir(dir);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reupload_overwrites_same_chunk() {
        let dir = set_up_dir();
        let store = Arc::new(InMemory::new());
        let archive = archive(store.clone());
        let tp = TopicPartition::new("events", 0);

        let chunk = seal(&dir, &tp, 0..10);
        archive.upload_chunk(&chunk).await.expect("");
        archive.upload_chunk(&chunk).await.expect("");

        let listed = store
            .list_with_delimiter(Some(&archive.partition_dir(&tp)))
            .await
            .expect("");

        assert_eq!(listed.objects.len(), 3);

        tear_down_dir(dir);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_read_chunk_returns_records_in_order() {
        let dir = set_up_dir();
        let archive = archive(Arc::new(InMemory::new()));
        let tp = TopicPartition::new("events", 3);

        let chunk = seal(&dir, &tp, 5..12);
        archive.upload_chunk(&chunk).await.expect("");

        let archived = archive.read_chunk(&tp, 5).await.expect("");

        // Tiny threshold forces several blocks.
        assert!(archived.index.blocks.len() > 1);
        assert_eq!(archived.index.start_offset, 5);
        assert_eq!(archived.index.end_offset, 12);
        assert_eq!(
            archived.records,
            (5..12)
                .map(|o| Bytes::from(format!("value-{}", o)))
                .collect::<Vec<_>>()
        );

        tear_down_dir(dir);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_corrupt_cursor_target_is_an_error() {
        let store = Arc::new(InMemory::new());
        let archive = archive(store.clone());
        let tp = TopicPartition::new("events", 0);

        store
            .put(&archive.cursor_key(&tp), PutPayload::from("archive/raw/events/00000/bogus.index"))
            .await
            .expect("");
        store
            .put(
                &Path::from("archive/raw/events/00000/bogus.index"),
                PutPayload::from_static(b"not an index"),
            )
            .await
            .expect("");

        let result = archive.fetch_last_committed_offset(&tp).await;

        assert!(matches!(result, Err(ArchiverError::InvalidMagicNumber(_))));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_local_files_fail_upload() {
        let archive = archive(Arc::new(InMemory::new()));
        let tp = TopicPartition::new("events", 0);

        let chunk = SealedChunk {
            partition: tp.clone(),
            data_path: PathBuf::from("/nonexistent/chunk.gz"),
            index_path: PathBuf::from("/nonexistent/chunk.index"),
            start_offset: 0,
            end_offset: 1,
            record_count: 1,
        };

        let err = archive.upload_chunk(&chunk).await.expect_err("");

        assert!(matches!(err, ArchiverError::Io(_)));
        assert!(err.is_retriable());
        assert_eq!(archive.fetch_last_committed_offset(&tp).await.expect(""), None);
    }

    async fn store_raw_chunk(
        store: &InMemory,
        archive: &ObjectStoreArchive,
        tp: &TopicPartition,
        blocks: Vec<BlockIndexEntry>,
        data: Vec<u8>,
    ) {
        let index = ChunkIndex {
            start_offset: 0,
            end_offset: 1,
            blocks,
        };

        store
            .put(&archive.index_key(tp, 0), PutPayload::from(index.to_bytes().expect("")))
            .await
            .expect("");
        store
            .put(&archive.data_key(tp, 0), PutPayload::from(data))
            .await
            .expect("");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_read_chunk_rejects_overflowing_block() {
        let store = Arc::new(InMemory::new());
        let archive = archive(store.clone());
        let tp = TopicPartition::new("events", 0);

        store_raw_chunk(
            &store,
            &archive,
            &tp,
            vec![BlockIndexEntry {
                byte_offset: u64::MAX,
                byte_length: 2,
                first_record_offset: 0,
                num_records: 1,
            }],
            vec![0; 4],
        )
        .await;

        let result = archive.read_chunk(&tp, 0).await;

        assert!(matches!(result, Err(ArchiverError::UnableToParseIndex(_))));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_read_chunk_rejects_inflated_record_count() {
        let store = Arc::new(InMemory::new());
        let archive = archive(store.clone());
        let tp = TopicPartition::new("events", 0);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"only-record\n").expect("");
        let data = encoder.finish().expect("");

        store_raw_chunk(
            &store,
            &archive,
            &tp,
            vec![BlockIndexEntry {
                byte_offset: 0,
                byte_length: data.len() as u64,
                first_record_offset: 0,
                num_records: u32::MAX,
            }],
            data,
        )
        .await;

        let result = archive.read_chunk(&tp, 0).await;

        assert!(
            matches!(result, Err(ArchiverError::UnableToParseIndex(ref msg)) if msg.contains("fewer than"))
        );
    }
}
