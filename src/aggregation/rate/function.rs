use std::sync::Arc;

use arrow::array::{Array, ArrayRef, RecordBatch, UInt32Array};
use arrow::datatypes::{DataType, Field, Int64Type};

use crate::aggregation::rate::grouping::{RateGroupingState, RateIntermediateBlock};
use crate::aggregation::{EvaluationContext, GroupingAggregatorFunction, NumericType};
use crate::block::{raw_primitive, GroupIds};
use crate::error::{AggregationError, Result};
use crate::memory::MemoryReservation;

/// Page plumbing around [`RateGroupingState`].
///
/// Raw channels: `[value, timestamp]`. Intermediate channels:
/// `[timestamps, values, sample_counts, resets]`.
#[derive(Debug)]
pub struct RateGroupingAggregatorFunction<T: NumericType> {
    channels: Vec<usize>,
    state: RateGroupingState<T>,
}

impl<T: NumericType> RateGroupingAggregatorFunction<T> {
    pub fn new(channels: Vec<usize>, reservation: MemoryReservation, initial_capacity: usize) -> Result<Self> {
        Ok(Self {
            channels,
            state: RateGroupingState::with_capacity(reservation, initial_capacity)?,
        })
    }

    pub fn state(&self) -> &RateGroupingState<T> {
        &self.state
    }

    pub fn intermediate_state_fields() -> Vec<Field> {
        vec![
            Field::new("timestamps", DataType::new_list(DataType::Int64, true), true),
            Field::new("values", DataType::new_list(T::DATA_TYPE, true), true),
            Field::new("sample_counts", DataType::Int32, false),
            Field::new("resets", DataType::Float64, false),
        ]
    }

    fn raw_channel(&self, index: usize) -> Result<usize> {
        self.channels.get(index).copied().ok_or_else(|| {
            AggregationError::input(format!(
                "rate needs 2 input channels, got {}",
                self.channels.len()
            ))
        })
    }
}

impl<T: NumericType> GroupingAggregatorFunction for RateGroupingAggregatorFunction<T> {
    fn describe(&self) -> String {
        format!("rate of {}s", T::ELEMENT.name())
    }

    fn intermediate_fields(&self) -> Vec<Field> {
        Self::intermediate_state_fields()
    }

    fn final_data_type(&self) -> DataType {
        DataType::Float64
    }

    fn add_raw_input(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()> {
        groups.ensure_aligned(page)?;
        let values = raw_primitive::<T>(page, self.raw_channel(0)?, "value")?;
        let timestamps = raw_primitive::<Int64Type>(page, self.raw_channel(1)?, "timestamp")?;
        for p in 0..page.num_rows() {
            if values.is_null(p) || timestamps.is_null(p) {
                continue;
            }
            let (timestamp, value) = (timestamps.value(p), values.value(p));
            groups.for_each_group(p, |g| self.state.append(g, timestamp, value))?;
        }
        Ok(())
    }

    fn add_intermediate_input(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()> {
        groups.ensure_aligned(page)?;
        let block = RateIntermediateBlock::<T>::try_new(page, &self.channels)?;
        for p in 0..block.len() {
            groups.for_each_group(p, |g| self.state.combine_intermediate(g, &block, p))?;
        }
        Ok(())
    }

    fn evaluate_intermediate(&self, selected: &UInt32Array) -> Result<Vec<ArrayRef>> {
        Ok(self.state.to_intermediate(selected).into())
    }

    fn evaluate_final(&self, selected: &UInt32Array, ctx: &EvaluationContext<'_>) -> Result<ArrayRef> {
        Ok(Arc::new(self.state.evaluate_final(selected, ctx)))
    }

    fn memory_used(&self) -> usize {
        self.state.ram_bytes_used()
    }
}
