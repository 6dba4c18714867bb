use std::mem;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Float64Array, Float64Builder, Int32Array, Int32Builder, Int64Array,
    Int64Builder, ListArray, ListBuilder, PrimitiveArray, PrimitiveBuilder, RecordBatch,
    UInt32Array,
};
use arrow::datatypes::{Float64Type, Int32Type, Int64Type};
use tracing::debug;

use crate::aggregation::rate::evaluate::{compute_rate_without_extrapolate, extrapolate_rate};
use crate::aggregation::rate::state::{is_descending, RateState};
use crate::aggregation::slots::GroupSlots;
use crate::aggregation::{EvaluationContext, NumericType};
use crate::block::{intermediate_list, intermediate_primitive, list_range, list_values};
use crate::error::{AggregationError, Result};
use crate::memory::{MemoryReservation, MemoryTenant};

/// Rate states of every group seen by one operator instance.
///
/// Single owner; driven by one pipeline at a time. Every state buffer is
/// charged to `reservation` before it is allocated and released as soon as it
/// is replaced, so `reservation.size()` always equals the sum of
/// [`RateState::bytes_used`] over live states.
#[derive(Debug)]
pub struct RateGroupingState<T: NumericType> {
    states: GroupSlots<RateState<T>>,
    reservation: MemoryReservation,
}

impl<T: NumericType> RateGroupingState<T> {
    pub fn new(reservation: MemoryReservation) -> Result<Self> {
        Self::with_capacity(reservation, 1)
    }

    pub fn with_capacity(reservation: MemoryReservation, initial_capacity: usize) -> Result<Self> {
        let slots = reservation.sibling(MemoryTenant::GroupSlots);
        Ok(Self {
            states: GroupSlots::new(slots, initial_capacity)?,
            reservation,
        })
    }

    pub fn get(&self, group_id: u32) -> Option<&RateState<T>> {
        self.states.get(group_id)
    }

    pub fn group_capacity(&self) -> usize {
        self.states.capacity()
    }

    /// Bytes charged for state buffers.
    pub fn state_bytes(&self) -> usize {
        self.reservation.size()
    }

    /// Bytes the live states account for; equals [`Self::state_bytes`].
    pub fn live_state_bytes(&self) -> usize {
        self.states
            .iter()
            .map(|(_, s)| RateState::<T>::bytes_used(s.entries()))
            .sum()
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.reservation.size() + self.states.reserved_bytes()
    }

    /// Fold one raw sample into `group_id`.
    pub fn append(&mut self, group_id: u32, timestamp: i64, value: T::Native) -> Result<()> {
        self.states.ensure_capacity(group_id)?;
        match self.states.slot_mut(group_id) {
            slot @ None => {
                let pending = self.reservation.try_scoped(RateState::<T>::bytes_used(1))?;
                *slot = Some(RateState::single(timestamp, value));
                self.reservation.absorb(pending);
            }
            Some(state) => {
                if state.try_collapse(timestamp, value) {
                    return Ok(());
                }
                let pending = self
                    .reservation
                    .try_scoped(RateState::<T>::bytes_used(state.entries() + 1))?;
                let merged = state.merged_with(&[timestamp], &[value], 1, 0.0);
                let old = mem::replace(state, merged);
                self.reservation.absorb(pending);
                self.reservation
                    .shrink(RateState::<T>::bytes_used(old.entries()));
            }
        }
        Ok(())
    }

    /// Merge a descending run of samples with its counters into `group_id`.
    pub fn merge_samples(
        &mut self,
        group_id: u32,
        timestamps: &[i64],
        values: &[T::Native],
        sample_count: i32,
        reset: f64,
    ) -> Result<()> {
        if timestamps.len() != values.len() {
            return Err(AggregationError::intermediate(format!(
                "{} timestamps but {} values",
                timestamps.len(),
                values.len()
            )));
        }
        if timestamps.is_empty() {
            return Ok(());
        }
        self.states.ensure_capacity(group_id)?;
        match self.states.slot_mut(group_id) {
            slot @ None => {
                let pending = self
                    .reservation
                    .try_scoped(RateState::<T>::bytes_used(timestamps.len()))?;
                *slot = Some(RateState::from_parts(
                    timestamps.to_vec(),
                    values.to_vec(),
                    sample_count,
                    reset,
                ));
                self.reservation.absorb(pending);
            }
            Some(state) => {
                let pending = self.reservation.try_scoped(RateState::<T>::bytes_used(
                    state.entries() + timestamps.len(),
                ))?;
                let merged = state.merged_with(timestamps, values, sample_count, reset);
                let old = mem::replace(state, merged);
                self.reservation.absorb(pending);
                self.reservation
                    .shrink(RateState::<T>::bytes_used(old.entries()));
            }
        }
        Ok(())
    }

    /// Merge position `position` of an intermediate block into `group_id`.
    ///
    /// The position is validated in full before anything is reserved or
    /// mutated.
    pub fn combine_intermediate(
        &mut self,
        group_id: u32,
        block: &RateIntermediateBlock<'_, T>,
        position: usize,
    ) -> Result<()> {
        match block.position(position)? {
            None => Ok(()),
            Some(entry) => self.merge_samples(
                group_id,
                entry.timestamps,
                entry.values,
                entry.sample_count,
                entry.reset,
            ),
        }
    }

    /// State-to-state merge of `other`'s `other_group_id` into `group_id`.
    pub fn merge_group_from(&mut self, group_id: u32, other: &Self, other_group_id: u32) -> Result<()> {
        match other.get(other_group_id) {
            None => Ok(()),
            Some(s) => self.merge_samples(
                group_id,
                s.timestamps(),
                s.values(),
                s.sample_count(),
                s.reset(),
            ),
        }
    }

    /// Timestamps, values, sample counts and resets of the selected groups.
    ///
    /// Absent groups get null lists and zero counters: zero is the identity of
    /// the later merge, a null list means there is nothing to merge.
    pub fn to_intermediate(&self, selected: &UInt32Array) -> [ArrayRef; 4] {
        let positions = selected.len();
        let mut timestamps =
            ListBuilder::with_capacity(Int64Builder::with_capacity(positions * 2), positions);
        let mut values = ListBuilder::with_capacity(
            PrimitiveBuilder::<T>::with_capacity(positions * 2),
            positions,
        );
        let mut sample_counts = Int32Builder::with_capacity(positions);
        let mut resets = Float64Builder::with_capacity(positions);
        for p in 0..positions {
            let state = if selected.is_valid(p) {
                self.states.get(selected.value(p))
            } else {
                None
            };
            match state {
                Some(state) => {
                    timestamps.values().append_slice(state.timestamps());
                    timestamps.append(true);
                    values.values().append_slice(state.values());
                    values.append(true);
                    sample_counts.append_value(state.sample_count());
                    resets.append_value(state.reset());
                }
                None => {
                    timestamps.append_null();
                    values.append_null();
                    sample_counts.append_value(0);
                    resets.append_value(0.0);
                }
            }
        }
        [
            Arc::new(timestamps.finish()),
            Arc::new(values.finish()),
            Arc::new(sample_counts.finish()),
            Arc::new(resets.finish()),
        ]
    }

    /// Rates of the selected groups; null where no rate is defined.
    pub fn evaluate_final(&self, selected: &UInt32Array, ctx: &EvaluationContext<'_>) -> Float64Array {
        let state_at = |p: usize| {
            if selected.is_valid(p) {
                self.states.get(selected.value(p)).map(|s| (selected.value(p), s))
            } else {
                None
            }
        };
        let positions = selected.len();
        let mut rates = Float64Builder::with_capacity(positions);
        match ctx {
            EvaluationContext::Plain => {
                for p in 0..positions {
                    let rate = state_at(p).and_then(|(_, s)| compute_rate_without_extrapolate(s));
                    rates.append_option(rate);
                }
            }
            EvaluationContext::RangeBounded(ranges) => {
                for p in 0..positions {
                    let rate = state_at(p).and_then(|(g, s)| match ranges.range_for(g) {
                        Some(range) => extrapolate_rate(s, range),
                        None => compute_rate_without_extrapolate(s),
                    });
                    rates.append_option(rate);
                }
            }
        }
        rates.finish()
    }

    /// Drop the first `n` groups, shifting the remaining ids down by `n`.
    pub(crate) fn drop_first(&mut self, n: usize) {
        let bytes: usize = self
            .states
            .take_first(n)
            .iter()
            .flatten()
            .map(|s| RateState::<T>::bytes_used(s.entries()))
            .sum();
        self.reservation.shrink(bytes);
    }

    /// Release every state and the memory they hold.
    pub fn close(self) {
        debug!(
            operator = %self.reservation.operator(),
            groups = self.states.live_count(),
            state_bytes = self.reservation.size(),
            slot_bytes = self.states.reserved_bytes(),
            "closing rate grouping state"
        );
    }
}

/// One position of a validated intermediate block.
#[derive(Debug)]
pub struct RateIntermediateEntry<'a, T: NumericType> {
    pub timestamps: &'a [i64],
    pub values: &'a [T::Native],
    pub sample_count: i32,
    pub reset: f64,
}

/// The four intermediate channels of a rate aggregation, typed.
#[derive(Debug)]
pub struct RateIntermediateBlock<'a, T: NumericType> {
    timestamps: &'a ListArray,
    timestamp_values: &'a Int64Array,
    values: &'a ListArray,
    value_values: &'a PrimitiveArray<T>,
    sample_counts: &'a Int32Array,
    resets: &'a Float64Array,
}

impl<'a, T: NumericType> RateIntermediateBlock<'a, T> {
    pub fn try_new(page: &'a RecordBatch, channels: &[usize]) -> Result<Self> {
        if channels.len() != 4 {
            return Err(AggregationError::intermediate(format!(
                "rate expects 4 intermediate channels, got {}",
                channels.len()
            )));
        }
        let timestamps = intermediate_list(page, channels[0], "timestamps")?;
        let values = intermediate_list(page, channels[1], "values")?;
        let sample_counts = intermediate_primitive::<Int32Type>(page, channels[2], "sample_counts")?;
        let resets = intermediate_primitive::<Float64Type>(page, channels[3], "resets")?;
        Self::from_arrays(timestamps, values, sample_counts, resets)
    }

    pub fn from_arrays(
        timestamps: &'a ListArray,
        values: &'a ListArray,
        sample_counts: &'a Int32Array,
        resets: &'a Float64Array,
    ) -> Result<Self> {
        let len = timestamps.len();
        if values.len() != len || sample_counts.len() != len || resets.len() != len {
            return Err(AggregationError::intermediate(format!(
                "channel lengths differ: timestamps={len} values={} sample_counts={} resets={}",
                values.len(),
                sample_counts.len(),
                resets.len()
            )));
        }
        Ok(Self {
            timestamps,
            timestamp_values: list_values::<Int64Type>(timestamps, "timestamps")?,
            values,
            value_values: list_values::<T>(values, "values")?,
            sample_counts,
            resets,
        })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The samples at `position`, `None` when there is nothing to merge.
    pub fn position(&self, position: usize) -> Result<Option<RateIntermediateEntry<'a, T>>> {
        let ts_range = list_range(self.timestamps, position);
        let vs_range = list_range(self.values, position);
        let ((ts_start, ts_end), (vs_start, vs_end)) = match (ts_range, vs_range) {
            (None, None) => return Ok(None),
            (Some(ts), Some(vs)) => (ts, vs),
            _ => {
                return Err(AggregationError::intermediate(format!(
                    "timestamps and values disagree on null at position {position}"
                )))
            }
        };
        let count = ts_end - ts_start;
        if count != vs_end - vs_start {
            return Err(AggregationError::intermediate(format!(
                "{count} timestamps but {} values at position {position}",
                vs_end - vs_start
            )));
        }
        if count == 0 {
            return Ok(None);
        }
        if self.sample_counts.is_null(position) || self.resets.is_null(position) {
            return Err(AggregationError::intermediate(format!(
                "null sample count or reset at position {position}"
            )));
        }
        let sample_count = self.sample_counts.value(position);
        if sample_count < 0 || (sample_count as usize) < count {
            return Err(AggregationError::intermediate(format!(
                "sample count {sample_count} below {count} retained samples at position {position}"
            )));
        }
        if (ts_start..ts_end).any(|i| self.timestamp_values.is_null(i))
            || (vs_start..vs_end).any(|i| self.value_values.is_null(i))
        {
            return Err(AggregationError::intermediate(format!(
                "null sample at position {position}"
            )));
        }
        let timestamps = &self.timestamp_values.values()[ts_start..ts_end];
        if !is_descending(timestamps) {
            return Err(AggregationError::intermediate(format!(
                "timestamps not descending at position {position}"
            )));
        }
        Ok(Some(RateIntermediateEntry {
            timestamps,
            values: &self.value_values.values()[vs_start..vs_end],
            sample_count,
            reset: self.resets.value(position),
        }))
    }
}
