//! Approximate distinct count per group.

pub mod sketch;

use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use ahash::RandomState;
use arrow::array::{
    Array, ArrayRef, BinaryArray, BinaryBuilder, Int64Array, RecordBatch, UInt32Array,
};
use arrow::datatypes::{DataType, Field};
use tracing::debug;

use crate::aggregation::slots::GroupSlots;
use crate::aggregation::{EvaluationContext, GroupingAggregatorFunction, NumericType};
use crate::block::{intermediate_column, raw_primitive, GroupIds};
use crate::config::AggregationConfig;
use crate::error::{AggregationError, Result};
use crate::memory::{MemoryReservation, MemoryTenant};

pub use sketch::{DistinctSketch, HyperLogLog, HLL_PRECISION};

/// Intermediate channel: `[hll]`, the bincode-encoded [`DistinctSketch`] or
/// null for a group that saw no value.
#[derive(Debug)]
pub struct CountDistinctGroupingAggregatorFunction<T: NumericType> {
    channels: Vec<usize>,
    precision_threshold: usize,
    hasher: RandomState,
    sketches: GroupSlots<DistinctSketch>,
    reservation: MemoryReservation,
    _type: PhantomData<T>,
}

impl<T: NumericType> CountDistinctGroupingAggregatorFunction<T> {
    pub fn new(
        channels: Vec<usize>,
        reservation: MemoryReservation,
        initial_capacity: usize,
        precision_threshold: usize,
    ) -> Result<Self> {
        if precision_threshold > AggregationConfig::MAX_PRECISION_THRESHOLD {
            return Err(AggregationError::input(format!(
                "precision threshold {precision_threshold} above {}",
                AggregationConfig::MAX_PRECISION_THRESHOLD
            )));
        }
        let slots = reservation.sibling(MemoryTenant::GroupSlots);
        Ok(Self {
            channels,
            precision_threshold,
            hasher: RandomState::with_seeds(0, 0, 0, 0),
            sketches: GroupSlots::new(slots, initial_capacity)?,
            reservation,
            _type: PhantomData,
        })
    }

    pub fn intermediate_state_fields() -> Vec<Field> {
        vec![Field::new("hll", DataType::Binary, true)]
    }

    pub fn cardinality(&self, group_id: u32) -> i64 {
        self.sketches.get(group_id).map_or(0, DistinctSketch::cardinality)
    }

    fn collect(&mut self, group_id: u32, hash: u64) -> Result<()> {
        self.sketches.ensure_capacity(group_id)?;
        let threshold = self.precision_threshold;
        let slot = self.sketches.slot_mut(group_id);
        let (before, after) = match slot.as_ref() {
            Some(sketch) => (sketch.bytes_used(), sketch.bytes_after_insert(hash, threshold)),
            None => {
                let empty = DistinctSketch::new();
                (0, empty.bytes_after_insert(hash, threshold))
            }
        };
        if after > before {
            self.reservation.try_grow(after - before)?;
        }
        slot.get_or_insert_with(DistinctSketch::new)
            .insert(hash, threshold);
        if before > after {
            self.reservation.shrink(before - after);
        }
        Ok(())
    }

    fn combine(&mut self, group_id: u32, other: &DistinctSketch) -> Result<()> {
        self.sketches.ensure_capacity(group_id)?;
        let slot = self.sketches.slot_mut(group_id);
        let (merged, before) = match slot.as_ref() {
            Some(sketch) => (sketch.merged(other, self.precision_threshold), sketch.bytes_used()),
            None => (other.clone(), 0),
        };
        let after = merged.bytes_used();
        if after > before {
            self.reservation.try_grow(after - before)?;
        }
        let old = mem::replace(slot, Some(merged));
        if before > after {
            self.reservation.shrink(before - after);
        }
        drop(old);
        Ok(())
    }

    fn channel(&self) -> Result<usize> {
        self.channels
            .first()
            .copied()
            .ok_or_else(|| AggregationError::input("count_distinct needs one input channel"))
    }
}

impl<T: NumericType> GroupingAggregatorFunction for CountDistinctGroupingAggregatorFunction<T> {
    fn describe(&self) -> String {
        format!("count_distinct of {}s", T::ELEMENT.name())
    }

    fn intermediate_fields(&self) -> Vec<Field> {
        Self::intermediate_state_fields()
    }

    fn final_data_type(&self) -> DataType {
        DataType::Int64
    }

    fn add_raw_input(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()> {
        groups.ensure_aligned(page)?;
        let values = raw_primitive::<T>(page, self.channel()?, "value")?;
        for p in 0..page.num_rows() {
            if values.is_null(p) {
                continue;
            }
            let hash = self.hasher.hash_one(T::hash_bits(values.value(p)));
            groups.for_each_group(p, |g| self.collect(g, hash))?;
        }
        Ok(())
    }

    fn add_intermediate_input(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()> {
        groups.ensure_aligned(page)?;
        let column = intermediate_column(page, self.channel()?, "hll")?;
        let states = column.as_any().downcast_ref::<BinaryArray>().ok_or_else(|| {
            AggregationError::intermediate(format!(
                "hll channel must be Binary, got {}",
                column.data_type()
            ))
        })?;
        for p in 0..states.len() {
            if states.is_null(p) {
                continue;
            }
            let sketch = DistinctSketch::from_bytes(states.value(p)).map_err(|e| {
                AggregationError::intermediate(format!("undecodable sketch at position {p}: {e}"))
            })?;
            if let DistinctSketch::Approximate(hll) = &sketch {
                if !hll.is_well_formed() {
                    return Err(AggregationError::intermediate(format!(
                        "sketch at position {p} has the wrong register count"
                    )));
                }
            }
            groups.for_each_group(p, |g| self.combine(g, &sketch))?;
        }
        Ok(())
    }

    fn evaluate_intermediate(&self, selected: &UInt32Array) -> Result<Vec<ArrayRef>> {
        let mut states = BinaryBuilder::with_capacity(selected.len(), 0);
        for group_id in selected.iter() {
            match group_id.and_then(|g| self.sketches.get(g)) {
                Some(sketch) => {
                    let bytes = sketch.to_bytes().map_err(|e| {
                        AggregationError::intermediate(format!("encode sketch: {e}"))
                    })?;
                    states.append_value(bytes);
                }
                None => states.append_null(),
            }
        }
        Ok(vec![Arc::new(states.finish())])
    }

    fn evaluate_final(&self, selected: &UInt32Array, _ctx: &EvaluationContext<'_>) -> Result<ArrayRef> {
        let counts: Int64Array = selected
            .iter()
            .map(|g| g.map_or(0, |g| self.cardinality(g)))
            .map(Some)
            .collect();
        Ok(Arc::new(counts))
    }

    fn memory_used(&self) -> usize {
        self.reservation.size() + self.sketches.reserved_bytes()
    }
}

impl<T: NumericType> Drop for CountDistinctGroupingAggregatorFunction<T> {
    fn drop(&mut self) {
        debug!(
            operator = %self.reservation.operator(),
            groups = self.sketches.live_count(),
            bytes = self.reservation.size(),
            "closing count_distinct"
        );
    }
}
