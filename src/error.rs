use arrow::error::ArrowError;
use thiserror::Error as ThisError;

use crate::memory::OperatorId;

pub type Result<T, E = AggregationError> = std::result::Result<T, E>;

/// Errors raised by the aggregators, the memory pool and the driver.
#[derive(Debug, ThisError)]
pub enum AggregationError {
    /// The memory pool refused a reservation. Nothing was mutated.
    #[error(
        "memory limit exceeded for {consumer}: requested {requested} bytes, used {used} of {limit} bytes"
    )]
    ResourceLimitExceeded {
        consumer: String,
        requested: usize,
        used: usize,
        limit: usize,
    },

    #[error("invalid intermediate state: {0}")]
    InvalidIntermediateState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported aggregate {name} for {data_type}")]
    UnsupportedAggregate { name: String, data_type: String },

    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

impl AggregationError {
    pub(crate) fn resource_limit(
        operator: &OperatorId,
        requested: usize,
        used: usize,
        limit: usize,
    ) -> Self {
        Self::ResourceLimitExceeded {
            consumer: operator.to_string(),
            requested,
            used,
            limit,
        }
    }

    pub(crate) fn intermediate(msg: impl Into<String>) -> Self {
        Self::InvalidIntermediateState(msg.into())
    }

    pub(crate) fn input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::ResourceLimitExceeded { .. })
    }
}
