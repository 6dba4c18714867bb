use std::mem::size_of;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray, UInt32Array};
use arrow::datatypes::{Float64Type, Int32Type, Int64Type};
use datafusion::error::{DataFusionError, Result};
use datafusion::logical_expr::{EmitTo, GroupsAccumulator};

use crate::aggregation::rate::{RateGroupingState, RateIntermediateBlock};
use crate::aggregation::{EvaluationContext, NumericType, TimeRange};
use crate::block::selected_range;
use crate::error::AggregationError;
use crate::memory::MemoryReservation;

fn df_error(e: AggregationError) -> DataFusionError {
    DataFusionError::External(Box::new(e))
}

fn exec_error(msg: impl Into<String>) -> DataFusionError {
    DataFusionError::Execution(msg.into())
}

/// Counter rate as a datafusion [`GroupsAccumulator`].
///
/// Input columns are `[value, timestamp]`; state columns are
/// `[timestamps, values, sample_counts, resets]`.
#[derive(Debug)]
pub struct RateGroupsAccumulator<T: NumericType> {
    state: RateGroupingState<T>,
    range: Option<TimeRange>,
    num_groups: usize,
}

impl<T: NumericType> RateGroupsAccumulator<T> {
    pub fn try_new(reservation: MemoryReservation) -> Result<Self> {
        Ok(Self {
            state: RateGroupingState::new(reservation).map_err(df_error)?,
            range: None,
            num_groups: 0,
        })
    }

    /// Extrapolate every group to `range` when evaluating.
    pub fn with_range(mut self, range: TimeRange) -> Self {
        self.range = Some(range);
        self
    }

    fn group_id(index: usize) -> Result<u32> {
        u32::try_from(index).map_err(|_| exec_error(format!("group index {index} out of range")))
    }

    fn selected(&self, emit_to: EmitTo) -> UInt32Array {
        let n = match emit_to {
            EmitTo::All => self.num_groups,
            EmitTo::First(n) => n.min(self.num_groups),
        };
        selected_range(n as u32)
    }

    fn emitted(&mut self, emit_to: EmitTo, n: usize) {
        match emit_to {
            EmitTo::All => {
                self.state.drop_first(self.num_groups);
                self.num_groups = 0;
            }
            EmitTo::First(_) => {
                self.state.drop_first(n);
                self.num_groups -= n;
            }
        }
    }
}

#[inline]
fn filtered_out(opt_filter: Option<&BooleanArray>, row: usize) -> bool {
    opt_filter.is_some_and(|f| !f.is_valid(row) || !f.value(row))
}

impl<T: NumericType> GroupsAccumulator for RateGroupsAccumulator<T> {
    fn update_batch(
        &mut self,
        values: &[ArrayRef],
        group_indices: &[usize],
        opt_filter: Option<&BooleanArray>,
        total_num_groups: usize,
    ) -> Result<()> {
        let [value, timestamp] = values else {
            return Err(exec_error(format!(
                "rate expects value and timestamp columns, got {}",
                values.len()
            )));
        };
        let value = value
            .as_primitive_opt::<T>()
            .ok_or_else(|| exec_error(format!("rate value must be {}", T::DATA_TYPE)))?;
        let timestamp = timestamp
            .as_primitive_opt::<Int64Type>()
            .ok_or_else(|| exec_error("rate timestamp must be Int64"))?;
        self.num_groups = self.num_groups.max(total_num_groups);
        for (row, &group_index) in group_indices.iter().enumerate() {
            if filtered_out(opt_filter, row) || value.is_null(row) || timestamp.is_null(row) {
                continue;
            }
            self.state
                .append(Self::group_id(group_index)?, timestamp.value(row), value.value(row))
                .map_err(df_error)?;
        }
        Ok(())
    }

    fn evaluate(&mut self, emit_to: EmitTo) -> Result<ArrayRef> {
        let selected = self.selected(emit_to);
        let rates = match &self.range {
            Some(range) => self
                .state
                .evaluate_final(&selected, &EvaluationContext::RangeBounded(range)),
            None => self.state.evaluate_final(&selected, &EvaluationContext::Plain),
        };
        self.emitted(emit_to, selected.len());
        Ok(Arc::new(rates))
    }

    fn state(&mut self, emit_to: EmitTo) -> Result<Vec<ArrayRef>> {
        let selected = self.selected(emit_to);
        let state = self.state.to_intermediate(&selected);
        self.emitted(emit_to, selected.len());
        Ok(state.into())
    }

    fn merge_batch(
        &mut self,
        values: &[ArrayRef],
        group_indices: &[usize],
        opt_filter: Option<&BooleanArray>,
        total_num_groups: usize,
    ) -> Result<()> {
        let [timestamps, vs, sample_counts, resets] = values else {
            return Err(exec_error(format!("rate expects 4 state columns, got {}", values.len())));
        };
        let block = RateIntermediateBlock::<T>::from_arrays(
            timestamps
                .as_list_opt::<i32>()
                .ok_or_else(|| exec_error("rate timestamps state must be a list"))?,
            vs.as_list_opt::<i32>()
                .ok_or_else(|| exec_error("rate values state must be a list"))?,
            sample_counts
                .as_primitive_opt::<Int32Type>()
                .ok_or_else(|| exec_error("rate sample_counts state must be Int32"))?,
            resets
                .as_primitive_opt::<Float64Type>()
                .ok_or_else(|| exec_error("rate resets state must be Float64"))?,
        )
        .map_err(df_error)?;
        self.num_groups = self.num_groups.max(total_num_groups);
        for (row, &group_index) in group_indices.iter().enumerate() {
            if filtered_out(opt_filter, row) {
                continue;
            }
            self.state
                .combine_intermediate(Self::group_id(group_index)?, &block, row)
                .map_err(df_error)?;
        }
        Ok(())
    }

    fn size(&self) -> usize {
        size_of::<Self>() + self.state.ram_bytes_used()
    }
}
