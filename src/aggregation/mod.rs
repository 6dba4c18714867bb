use std::fmt::{self, Debug};

use arrow::array::{ArrayRef, RecordBatch, UInt32Array};
use arrow::datatypes::{DataType, Field};
use serde::{Deserialize, Serialize};

use crate::block::GroupIds;
use crate::error::Result;

pub mod count_distinct;
pub mod groups_accumulator;
pub mod min_max;
pub mod numeric;
pub mod percentile;
pub mod rate;
pub mod registry;
pub mod slots;
pub mod top;

pub use numeric::{ElementType, NumericType};
pub use registry::{aggregator_registry, AggregatorArgs, AggregatorParams, AggregatorRegistry};

/// Inclusive-exclusive logical time range of one group, in timestamp units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

/// Per-group range boundaries supplied by the caller at evaluation time.
pub trait GroupTimeRanges: Send + Sync {
    /// `None` means the group has no known range and is evaluated without extrapolation.
    fn range_for(&self, group_id: u32) -> Option<TimeRange>;
}

impl GroupTimeRanges for TimeRange {
    fn range_for(&self, _group_id: u32) -> Option<TimeRange> {
        Some(*self)
    }
}

/// Time buckets of a fixed width, one bucket start per group id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketTimeRanges {
    bucket_starts: Vec<i64>,
    interval: i64,
}

impl BucketTimeRanges {
    pub fn new(bucket_starts: Vec<i64>, interval: i64) -> Self {
        Self {
            bucket_starts,
            interval,
        }
    }
}

impl GroupTimeRanges for BucketTimeRanges {
    fn range_for(&self, group_id: u32) -> Option<TimeRange> {
        self.bucket_starts
            .get(group_id as usize)
            .map(|start| TimeRange::new(*start, start.saturating_add(self.interval)))
    }
}

#[derive(Clone, Copy)]
pub enum EvaluationContext<'a> {
    Plain,
    RangeBounded(&'a dyn GroupTimeRanges),
}

impl Debug for EvaluationContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => f.write_str("Plain"),
            Self::RangeBounded(_) => f.write_str("RangeBounded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregatorMode {
    /// raw input, intermediate output
    Initial,
    /// intermediate input, intermediate output
    Intermediate,
    /// intermediate input, final output
    Final,
    /// raw input, final output
    Single,
}

impl AggregatorMode {
    pub fn is_input_partial(&self) -> bool {
        matches!(self, Self::Intermediate | Self::Final)
    }

    pub fn is_output_partial(&self) -> bool {
        matches!(self, Self::Initial | Self::Intermediate)
    }
}

/// A grouping aggregation over columnar pages.
///
/// Raw input channels are read from the page at the positions the function was
/// built with. Intermediate input uses the same channels, one per intermediate
/// field, in `intermediate_fields` order.
pub trait GroupingAggregatorFunction: Send + Debug {
    /// Short description, e.g. `rate of longs`.
    fn describe(&self) -> String;

    fn intermediate_fields(&self) -> Vec<Field>;

    fn final_data_type(&self) -> DataType;

    fn add_raw_input(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()>;

    fn add_intermediate_input(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()>;

    fn evaluate_intermediate(&self, selected: &UInt32Array) -> Result<Vec<ArrayRef>>;

    fn evaluate_final(&self, selected: &UInt32Array, ctx: &EvaluationContext<'_>) -> Result<ArrayRef>;

    /// Bytes currently reserved by this function's state.
    fn memory_used(&self) -> usize;
}

/// A function bound to the mode deciding its input and output shape.
#[derive(Debug)]
pub struct GroupingAggregator {
    function: Box<dyn GroupingAggregatorFunction>,
    mode: AggregatorMode,
}

impl GroupingAggregator {
    pub fn new(function: Box<dyn GroupingAggregatorFunction>, mode: AggregatorMode) -> Self {
        Self { function, mode }
    }

    pub fn mode(&self) -> AggregatorMode {
        self.mode
    }

    pub fn function(&self) -> &dyn GroupingAggregatorFunction {
        self.function.as_ref()
    }

    pub fn add_page(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()> {
        if self.mode.is_input_partial() {
            self.function.add_intermediate_input(groups, page)
        } else {
            self.function.add_raw_input(groups, page)
        }
    }

    /// Output fields named `{label}_{field}` for partial output, `label` otherwise.
    pub fn output_fields(&self, label: &str) -> Vec<Field> {
        if self.mode.is_output_partial() {
            self.function
                .intermediate_fields()
                .into_iter()
                .map(|f| {
                    Field::new(
                        format!("{label}_{}", f.name()),
                        f.data_type().clone(),
                        f.is_nullable(),
                    )
                })
                .collect()
        } else {
            vec![Field::new(label, self.function.final_data_type(), true)]
        }
    }

    pub fn evaluate(&self, selected: &UInt32Array, ctx: &EvaluationContext<'_>) -> Result<Vec<ArrayRef>> {
        if self.mode.is_output_partial() {
            self.function.evaluate_intermediate(selected)
        } else {
            Ok(vec![self.function.evaluate_final(selected, ctx)?])
        }
    }
}
