//! Counter rate per group.
//!
//! Raw input is a `(value, timestamp)` pair per row; timestamps are in
//! milliseconds and the final rate is per second.

pub mod evaluate;
pub mod function;
pub mod grouping;
pub mod state;

pub use evaluate::{compute_rate_without_extrapolate, extrapolate_rate};
pub use function::RateGroupingAggregatorFunction;
pub use grouping::{RateGroupingState, RateIntermediateBlock, RateIntermediateEntry};
pub use state::RateState;

use arrow::datatypes::{Float32Type, Float64Type, Int32Type, Int64Type};

pub type RateIntGroupingState = RateGroupingState<Int32Type>;
pub type RateLongGroupingState = RateGroupingState<Int64Type>;
pub type RateFloatGroupingState = RateGroupingState<Float32Type>;
pub type RateDoubleGroupingState = RateGroupingState<Float64Type>;

#[cfg(test)]
mod rate_tests;
