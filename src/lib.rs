//! Chunk Archiver
//!
//! Archives records delivered by a partitioned streaming host into an object store
//! as compressed, indexed chunks, and recovers each partition's position from the
//! archive itself so nothing is lost or duplicated across crashes and rebalances.
//!
//! example usage:
//!
//! ```rust,ignore
//! let props = HashMap::from([
//!     ("s3.bucket".to_string(), "archive".to_string()),
//!     ("local.buffer.dir".to_string(), "/var/lib/archiver".to_string()),
//! ]);
//!
//! let coordinator = chunk_archiver::start(&props, host.clone()).await?;
//!
//! coordinator
//!     .put(&[SinkRecord::new("events", 0, 0, "hello")])
//!     .await?;
//!
//! coordinator
//!     .flush(&HashMap::from([(TopicPartition::new("events", 0), 1)]))
//!     .await?;
//!
//! coordinator.stop().await;
//! ```
#![deny(missing_docs)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::unwrap_used)]

pub mod archive;
pub mod chunk_writer;
pub mod config;
pub mod error;
pub mod host;
pub mod messages;

mod coordinator;
mod partition_buffer;

use std::{collections::HashMap, sync::Arc};

pub use archive::{ChunkArchive, ChunkReceipt, ObjectStoreArchive};
pub use chunk_writer::{
    ChunkWriter, ChunkWriterFactory, SealedChunk, block_gzip::BlockGzipWriterFactory,
};
pub use config::SinkConfig;
pub use coordinator::{CoordinatorConfiguration, SinkCoordinator};
pub use error::{ArchiverError, ArchiverResult};
pub use host::HostContext;
pub use messages::{SinkRecord, TopicPartition};
pub use object_store;
pub use partition_buffer::PartitionBuffer;

/// The crate version, reported to the host runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Starts a sink task from its property map.
///
/// Builds the S3-backed archive described by `props` and recovers every partition
/// the host currently has assigned before returning.
///
/// # Errors
/// Returns [`ArchiverError::Config`] for invalid properties, or the recovery
/// error of the first partition that could not be restored.
#[tracing::instrument(skip_all, name = "start")]
pub async fn start(
    props: &HashMap<String, String>,
    host: Arc<dyn HostContext>,
) -> ArchiverResult<SinkCoordinator> {
    let config = SinkConfig::from_props(props)?;

    tracing::info!("Starting chunk archiver {} with {:#?}", VERSION, config);

    let archive = ObjectStoreArchive::from_config(&config)?;

    let coordinator = SinkCoordinator::new(CoordinatorConfiguration {
        archive: Arc::new(archive),
        writer_factory: Arc::new(BlockGzipWriterFactory),
        host: host.clone(),
        buffer_dir: config.buffer_dir.clone(),
        block_threshold_bytes: config.block_threshold_bytes,
    });

    let assigned = host.assignment().into_iter().collect::<Vec<_>>();

    coordinator.on_assigned(&assigned).await?;

    Ok(coordinator)
}
