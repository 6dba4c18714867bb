pub mod aggregation;
pub mod block;
pub mod config;
pub mod driver;
pub mod error;
pub mod memory;

pub use aggregation::groups_accumulator::RateGroupsAccumulator;
pub use aggregation::rate::{RateGroupingAggregatorFunction, RateGroupingState, RateState};
pub use aggregation::{
    aggregator_registry, AggregatorMode, EvaluationContext, GroupingAggregator,
    GroupingAggregatorFunction, TimeRange,
};
pub use config::AggregationConfig;
pub use driver::{AggregateSpec, GroupingAggregationOperator, PartitionedAggregation};
pub use error::{AggregationError, Result};
pub use memory::{MemoryPool, MemoryReservation, MemoryTenant, OperatorId};
