//! Control surface the host streaming runtime exposes to the coordinator.
use std::collections::HashSet;

use crate::messages::TopicPartition;

/// Callbacks into the host runtime.
///
/// The host delivers records and lifecycle events to the [`crate::SinkCoordinator`];
/// this trait is the way back, used while recovering a partition.
pub trait HostContext
where
    Self: Send + Sync + std::fmt::Debug,
{
    /// The partitions currently assigned to this task.
    fn assignment(&self) -> HashSet<TopicPartition>;

    /// Stops delivering records for the given partitions.
    fn pause(&self, partitions: &[TopicPartition]);

    /// Resumes delivering records for the given partitions.
    fn resume(&self, partitions: &[TopicPartition]);

    /// Moves the partition's read cursor so the next delivered record is `offset`.
    fn seek(&self, partition: &TopicPartition, offset: u64);
}
