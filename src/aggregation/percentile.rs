//! Approximate percentile per group over a t-digest.

use std::marker::PhantomData;
use std::mem::{self, size_of};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BinaryBuilder, Float64Builder, RecordBatch, UInt32Array,
};
use arrow::datatypes::{DataType, Field};
use serde::{Deserialize, Serialize};
use tdigest::TDigest;
use tracing::debug;

use crate::aggregation::slots::GroupSlots;
use crate::aggregation::{EvaluationContext, GroupingAggregatorFunction, NumericType};
use crate::block::{intermediate_column, raw_primitive, GroupIds};
use crate::error::{AggregationError, Result};
use crate::memory::{MemoryReservation, MemoryTenant};

/// Digest of one group plus the raw values not yet folded into it.
///
/// Values are buffered until `compression` of them are pending, then merged
/// into the digest in one sort.
#[derive(Debug, Clone)]
pub struct PercentileState {
    digest: TDigest,
    pending: Vec<f64>,
    count: u64,
}

/// Wire form of a [`PercentileState`]: the digest with every pending value
/// folded in.
#[derive(Debug, Serialize, Deserialize)]
struct EncodedDigest {
    count: u64,
    digest: TDigest,
}

impl PercentileState {
    pub fn new(compression: usize) -> Self {
        Self {
            digest: TDigest::new_with_size(compression),
            pending: Vec::with_capacity(compression),
            count: 0,
        }
    }

    /// Upper bound of the bytes held by a state: `compression` centroids of
    /// two `f64` each and a full pending buffer.
    pub fn bytes_used(compression: usize) -> usize {
        size_of::<Self>() + compression * 3 * size_of::<f64>()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// NaN has no rank and is ignored.
    pub fn add(&mut self, value: f64, compression: usize) {
        if value.is_nan() {
            return;
        }
        self.pending.push(value);
        self.count += 1;
        if self.pending.len() >= compression {
            let pending = mem::replace(&mut self.pending, Vec::with_capacity(compression));
            self.digest = self.digest.merge_unsorted(pending);
        }
    }

    pub fn digest(&self) -> TDigest {
        if self.pending.is_empty() {
            self.digest.clone()
        } else {
            self.digest.merge_unsorted(self.pending.clone())
        }
    }

    pub fn merge(&mut self, count: u64, other: TDigest) {
        if count == 0 {
            return;
        }
        self.digest = if self.count == 0 {
            other
        } else {
            TDigest::merge_digests(vec![self.digest(), other])
        };
        self.pending.clear();
        self.count += count;
    }

    /// Value at `quantile` in `[0, 1]`, `None` while nothing was added.
    pub fn estimate(&self, quantile: f64) -> Option<f64> {
        (self.count > 0).then(|| self.digest().estimate_quantile(quantile))
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(&EncodedDigest {
            count: self.count,
            digest: self.digest(),
        })
    }

    fn decode(bytes: &[u8]) -> bincode::Result<(u64, TDigest)> {
        let encoded: EncodedDigest = bincode::deserialize(bytes)?;
        Ok((encoded.count, encoded.digest))
    }
}

/// Intermediate channel: `[quart]`, the bincode-encoded digest or null for a
/// group that saw no value. The final value is an `f64`, null for empty
/// groups.
#[derive(Debug)]
pub struct PercentileGroupingAggregatorFunction<T: NumericType> {
    channels: Vec<usize>,
    percentile: f64,
    compression: usize,
    states: GroupSlots<PercentileState>,
    reservation: MemoryReservation,
    _type: PhantomData<T>,
}

impl<T: NumericType> PercentileGroupingAggregatorFunction<T> {
    pub fn new(
        channels: Vec<usize>,
        reservation: MemoryReservation,
        initial_capacity: usize,
        percentile: f64,
        compression: usize,
    ) -> Result<Self> {
        if !(0.0..=100.0).contains(&percentile) {
            return Err(AggregationError::input(format!(
                "percentile must be between 0 and 100, got {percentile}"
            )));
        }
        if compression == 0 {
            return Err(AggregationError::input("percentile compression must be > 0"));
        }
        let slots = reservation.sibling(MemoryTenant::GroupSlots);
        Ok(Self {
            channels,
            percentile,
            compression,
            states: GroupSlots::new(slots, initial_capacity)?,
            reservation,
            _type: PhantomData,
        })
    }

    pub fn intermediate_state_fields() -> Vec<Field> {
        vec![Field::new("quart", DataType::Binary, true)]
    }

    pub fn estimate(&self, group_id: u32) -> Option<f64> {
        self.states
            .get(group_id)
            .and_then(|s| s.estimate(self.percentile / 100.0))
    }

    fn state_mut(&mut self, group_id: u32) -> Result<&mut PercentileState> {
        self.states.ensure_capacity(group_id)?;
        if self.states.get(group_id).is_none() {
            self.reservation
                .try_grow(PercentileState::bytes_used(self.compression))?;
            *self.states.slot_mut(group_id) = Some(PercentileState::new(self.compression));
        }
        self.states
            .get_mut(group_id)
            .ok_or_else(|| AggregationError::input(format!("no percentile state for group {group_id}")))
    }

    fn channel(&self) -> Result<usize> {
        self.channels
            .first()
            .copied()
            .ok_or_else(|| AggregationError::input("percentile needs one input channel"))
    }
}

impl<T: NumericType> GroupingAggregatorFunction for PercentileGroupingAggregatorFunction<T> {
    fn describe(&self) -> String {
        format!("percentile {} of {}s", self.percentile, T::ELEMENT.name())
    }

    fn intermediate_fields(&self) -> Vec<Field> {
        Self::intermediate_state_fields()
    }

    fn final_data_type(&self) -> DataType {
        DataType::Float64
    }

    fn add_raw_input(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()> {
        groups.ensure_aligned(page)?;
        let values = raw_primitive::<T>(page, self.channel()?, "value")?;
        let compression = self.compression;
        for p in 0..page.num_rows() {
            if values.is_null(p) {
                continue;
            }
            let value = T::to_f64(values.value(p));
            groups.for_each_group(p, |g| {
                self.state_mut(g)?.add(value, compression);
                Ok(())
            })?;
        }
        Ok(())
    }

    fn add_intermediate_input(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()> {
        groups.ensure_aligned(page)?;
        let column = intermediate_column(page, self.channel()?, "quart")?;
        let states = column.as_any().downcast_ref::<BinaryArray>().ok_or_else(|| {
            AggregationError::intermediate(format!(
                "quart channel must be Binary, got {}",
                column.data_type()
            ))
        })?;
        for p in 0..states.len() {
            if states.is_null(p) {
                continue;
            }
            let (count, digest) = PercentileState::decode(states.value(p)).map_err(|e| {
                AggregationError::intermediate(format!("undecodable digest at position {p}: {e}"))
            })?;
            groups.for_each_group(p, |g| {
                self.state_mut(g)?.merge(count, digest.clone());
                Ok(())
            })?;
        }
        Ok(())
    }

    fn evaluate_intermediate(&self, selected: &UInt32Array) -> Result<Vec<ArrayRef>> {
        let mut states = BinaryBuilder::with_capacity(selected.len(), 0);
        for group_id in selected.iter() {
            match group_id.and_then(|g| self.states.get(g)).filter(|s| s.count() > 0) {
                Some(state) => {
                    let bytes = state.to_bytes().map_err(|e| {
                        AggregationError::intermediate(format!("encode digest: {e}"))
                    })?;
                    states.append_value(bytes);
                }
                None => states.append_null(),
            }
        }
        Ok(vec![Arc::new(states.finish())])
    }

    fn evaluate_final(&self, selected: &UInt32Array, _ctx: &EvaluationContext<'_>) -> Result<ArrayRef> {
        let mut out = Float64Builder::with_capacity(selected.len());
        for group_id in selected.iter() {
            out.append_option(group_id.and_then(|g| self.estimate(g)));
        }
        Ok(Arc::new(out.finish()))
    }

    fn memory_used(&self) -> usize {
        self.reservation.size() + self.states.reserved_bytes()
    }
}

impl<T: NumericType> Drop for PercentileGroupingAggregatorFunction<T> {
    fn drop(&mut self) {
        debug!(
            operator = %self.reservation.operator(),
            groups = self.states.live_count(),
            bytes = self.reservation.size(),
            "closing percentile"
        );
    }
}
