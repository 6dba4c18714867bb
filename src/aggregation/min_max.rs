use std::cmp::Ordering;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, PrimitiveArray, RecordBatch, UInt32Array};
use arrow::datatypes::{DataType, Field};

use crate::aggregation::slots::GroupSlots;
use crate::aggregation::{EvaluationContext, GroupingAggregatorFunction, NumericType};
use crate::block::{intermediate_column, intermediate_primitive, raw_primitive, GroupIds};
use crate::error::{AggregationError, Result};
use crate::memory::MemoryReservation;

/// Which end of the order a [`MinMaxGroupingAggregatorFunction`] keeps.
pub trait Extreme: Debug + Send + Sync + 'static {
    const NAME: &'static str;

    /// Whether `candidate` replaces `current` given `candidate.cmp(current)`.
    fn replaces(ordering: Ordering) -> bool;
}

#[derive(Debug)]
pub struct Min;

#[derive(Debug)]
pub struct Max;

impl Extreme for Min {
    const NAME: &'static str = "min";

    fn replaces(ordering: Ordering) -> bool {
        ordering == Ordering::Less
    }
}

impl Extreme for Max {
    const NAME: &'static str = "max";

    fn replaces(ordering: Ordering) -> bool {
        ordering == Ordering::Greater
    }
}

/// Per-group minimum or maximum.
///
/// Intermediate channels: `[value, seen]`. Unseen groups carry the type's
/// default value with `seen = false` and evaluate to null.
#[derive(Debug)]
pub struct MinMaxGroupingAggregatorFunction<T: NumericType, E: Extreme> {
    channels: Vec<usize>,
    values: GroupSlots<T::Native>,
    _extreme: PhantomData<E>,
}

pub type MinGroupingAggregatorFunction<T> = MinMaxGroupingAggregatorFunction<T, Min>;
pub type MaxGroupingAggregatorFunction<T> = MinMaxGroupingAggregatorFunction<T, Max>;

impl<T: NumericType, E: Extreme> MinMaxGroupingAggregatorFunction<T, E> {
    pub fn new(channels: Vec<usize>, reservation: MemoryReservation, initial_capacity: usize) -> Result<Self> {
        Ok(Self {
            channels,
            values: GroupSlots::new(reservation, initial_capacity)?,
            _extreme: PhantomData,
        })
    }

    pub fn intermediate_state_fields() -> Vec<Field> {
        vec![
            Field::new(E::NAME, T::DATA_TYPE, false),
            Field::new("seen", DataType::Boolean, false),
        ]
    }

    pub fn value(&self, group_id: u32) -> Option<T::Native> {
        self.values.get(group_id).copied()
    }

    fn combine(&mut self, group_id: u32, value: T::Native) -> Result<()> {
        self.values.ensure_capacity(group_id)?;
        let slot = self.values.slot_mut(group_id);
        let keep = matches!(*slot, Some(current) if !E::replaces(T::total_cmp(value, current)));
        if !keep {
            *slot = Some(value);
        }
        Ok(())
    }

    fn channel(&self, index: usize, what: &str) -> Result<usize> {
        self.channels.get(index).copied().ok_or_else(|| {
            AggregationError::input(format!("{} has no {what} channel", E::NAME))
        })
    }
}

impl<T: NumericType, E: Extreme> GroupingAggregatorFunction for MinMaxGroupingAggregatorFunction<T, E> {
    fn describe(&self) -> String {
        format!("{} of {}s", E::NAME, T::ELEMENT.name())
    }

    fn intermediate_fields(&self) -> Vec<Field> {
        Self::intermediate_state_fields()
    }

    fn final_data_type(&self) -> DataType {
        T::DATA_TYPE
    }

    fn add_raw_input(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()> {
        groups.ensure_aligned(page)?;
        let values = raw_primitive::<T>(page, self.channel(0, "value")?, "value")?;
        for p in 0..page.num_rows() {
            if values.is_null(p) {
                continue;
            }
            let value = values.value(p);
            groups.for_each_group(p, |g| self.combine(g, value))?;
        }
        Ok(())
    }

    fn add_intermediate_input(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()> {
        groups.ensure_aligned(page)?;
        let values = intermediate_primitive::<T>(page, self.channel(0, "value")?, E::NAME)?;
        let seen = intermediate_column(page, self.channel(1, "seen")?, "seen")?;
        let seen = seen.as_any().downcast_ref::<BooleanArray>().ok_or_else(|| {
            AggregationError::intermediate(format!(
                "seen channel must be Boolean, got {}",
                seen.data_type()
            ))
        })?;
        for p in 0..page.num_rows() {
            if seen.is_null(p) || values.is_null(p) {
                return Err(AggregationError::intermediate(format!(
                    "null {} state at position {p}",
                    E::NAME
                )));
            }
            if !seen.value(p) {
                continue;
            }
            let value = values.value(p);
            groups.for_each_group(p, |g| self.combine(g, value))?;
        }
        Ok(())
    }

    fn evaluate_intermediate(&self, selected: &UInt32Array) -> Result<Vec<ArrayRef>> {
        let states: Vec<Option<T::Native>> = selected
            .iter()
            .map(|g| g.and_then(|g| self.value(g)))
            .collect();
        let values = PrimitiveArray::<T>::from_iter_values(states.iter().map(|v| v.unwrap_or_default()));
        let seen: BooleanArray = states.iter().map(|v| Some(v.is_some())).collect();
        Ok(vec![Arc::new(values), Arc::new(seen)])
    }

    fn evaluate_final(&self, selected: &UInt32Array, _ctx: &EvaluationContext<'_>) -> Result<ArrayRef> {
        let values: PrimitiveArray<T> = selected
            .iter()
            .map(|g| g.and_then(|g| self.value(g)))
            .collect();
        Ok(Arc::new(values))
    }

    fn memory_used(&self) -> usize {
        self.values.reserved_bytes()
    }
}
