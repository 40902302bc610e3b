use bytes::Bytes;

use super::TopicPartition;

/// A record delivered by the host runtime for archiving.
///
/// The payload is opaque to the archiver: it is stored as one line of the
/// partition's current chunk.
#[derive(Debug, Clone)]
pub struct SinkRecord {
    /// Topic the record was consumed from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
    /// The serialized record value.
    pub value: Bytes,
}

impl SinkRecord {
    /// Creates a record for the given topic/partition at `offset`.
    pub fn new(topic: impl Into<String>, partition: u32, offset: u64, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            value: value.into(),
        }
    }

    /// The topic/partition this record belongs to.
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition(self.topic.clone(), self.partition)
    }
}
