//! In-process driver: key hashing, the grouping operator and a two-phase
//! partitioned runner.

pub mod block_hash;
pub mod operator;
pub mod partitioned;

pub use block_hash::LongBlockHash;
pub use operator::{AggregateSpec, GroupingAggregationOperator, TimeRangeSource};
pub use partitioned::PartitionedAggregation;
