//! Error types shared by every layer of the archiver.
use std::{array::TryFromSliceError, num::TryFromIntError};

use thiserror::Error;

use crate::messages::TopicPartition;

/// Result alias used throughout the crate.
pub type ArchiverResult<T> = Result<T, ArchiverError>;

/// Errors raised by the coordinator and its collaborators.
///
/// Use [`ArchiverError::is_retriable`] to decide whether the host should retry the
/// call that produced the error or treat the task as failed.
#[derive(Error, Debug)]
pub enum ArchiverError {
    /// Invalid or missing configuration. Raised at startup.
    #[error("Configuration error: {0}")]
    Config(String),
    /// The host broke the callback contract, eg. delivered records for a partition
    /// that was never assigned.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    /// Offset discovery failed while (re)assigning a partition.
    #[error("Failed to recover partition {partition} from the archive")]
    Recovery {
        /// The partition that could not be recovered.
        partition: TopicPartition,
        /// What went wrong talking to the archive.
        #[source]
        source: Box<ArchiverError>,
    },
    /// The partition's chunk is sealed and waiting for a successful upload.
    #[error("Chunk for partition {0} is sealed and pending upload")]
    ChunkPendingUpload(TopicPartition),
    /// A writer was used after it had already been finalized.
    #[error("Chunk writer for partition {0} is already finalized")]
    WriterFinalized(TopicPartition),
    /// An object store call did not complete in time.
    #[error("Timed out during {0}")]
    Timeout(String),

    // Inferred
    /// Remote object store failure.
    #[error("ObjectStore Error")]
    ObjectStore(#[from] object_store::Error),
    /// Local buffer I/O failure.
    #[error("IO Error")]
    Io(#[from] std::io::Error),
    /// Integer conversion overflowed.
    #[error("TryFromInt Conversion Error")]
    TryFromIntConversion(#[from] TryFromIntError),
    /// Slice had the wrong length for a fixed-size field.
    #[error("TryFromSlice Conversion Error")]
    TryFromSliceConversion(#[from] TryFromSliceError),

    // Chunk index errors.
    /// The index header does not start with the expected magic number.
    #[error("Invalid Magic Number: {0}")]
    InvalidMagicNumber(u32),
    /// The index bytes are truncated or inconsistent.
    #[error("Unable to Parse Index: {0}")]
    UnableToParseIndex(String),
    /// The index was written by an unknown format version.
    #[error("Invalid Index Version Number: {0}")]
    InvalidIndexVersion(u32),
}

impl ArchiverError {
    /// Whether the host may retry the failed call with the same input.
    ///
    /// Local I/O and remote storage failures are transient. Configuration errors,
    /// protocol violations, recovery failures and corrupt artifacts are not.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ArchiverError::Io(_)
                | ArchiverError::ObjectStore(_)
                | ArchiverError::Timeout(_)
                | ArchiverError::ChunkPendingUpload(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_and_remote_failures_are_retriable() {
        let io = ArchiverError::from(std::io::Error::other("disk full"));
        assert!(io.is_retriable());

        let remote = ArchiverError::from(object_store::Error::NotImplemented);
        assert!(remote.is_retriable());

        assert!(ArchiverError::Timeout("upload".to_string()).is_retriable());
        assert!(
            ArchiverError::ChunkPendingUpload(TopicPartition::new("t", 0)).is_retriable()
        );
    }

    #[test]
    fn test_structural_failures_are_fatal() {
        assert!(!ArchiverError::Config("s3.bucket".to_string()).is_retriable());
        assert!(!ArchiverError::ProtocolViolation("unassigned".to_string()).is_retriable());
        assert!(!ArchiverError::InvalidMagicNumber(7).is_retriable());
        assert!(!ArchiverError::WriterFinalized(TopicPartition::new("t", 0)).is_retriable());

        let recovery = ArchiverError::Recovery {
            partition: TopicPartition::new("t", 0),
            source: Box::new(ArchiverError::Timeout("fetch".to_string())),
        };
        assert!(!recovery.is_retriable());
    }

    #[test]
    fn test_recovery_error_keeps_source() {
        let err = ArchiverError::Recovery {
            partition: TopicPartition::new("events", 3),
            source: Box::new(ArchiverError::Timeout("fetch cursor".to_string())),
        };

        assert_eq!(
            err.to_string(),
            "Failed to recover partition events-3 from the archive"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
