//! Data structures exchanged between the host runtime and the coordinator.

mod sink_record;
mod topic_partition;

pub use sink_record::*;
pub use topic_partition::*;
