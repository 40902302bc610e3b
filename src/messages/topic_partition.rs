use std::fmt;

/// Merged Topic/Partition identification struct.
///
/// Uniquely identifies one ordered record stream and is the key of every
/// per-partition table in the crate.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Default, PartialOrd, Ord)]
pub struct TopicPartition(pub String, pub u32);

impl TopicPartition {
    /// Creates a new topic/partition pair.
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self(topic.into(), partition)
    }

    /// The topic name.
    pub fn topic(&self) -> &str {
        &self.0
    }

    /// The partition number within the topic.
    pub fn partition(&self) -> u32 {
        self.1
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.0, self.1)
    }
}
