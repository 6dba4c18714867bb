use std::cmp::Ordering;
use std::mem::size_of;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, ListBuilder, PrimitiveBuilder, RecordBatch, UInt32Array};
use arrow::datatypes::{DataType, Field};
use tracing::debug;

use crate::aggregation::slots::GroupSlots;
use crate::aggregation::{EvaluationContext, GroupingAggregatorFunction, NumericType};
use crate::block::{intermediate_list, list_range, list_values, raw_primitive, GroupIds};
use crate::error::{AggregationError, Result};
use crate::memory::{MemoryReservation, MemoryTenant};

/// The `limit` smallest (ascending) or largest (descending) values per group.
///
/// Every group owns a sorted buffer of at most `limit` values, allocated and
/// charged in full when the group is first seen. Duplicates are kept.
#[derive(Debug)]
pub struct TopGroupingAggregatorFunction<T: NumericType> {
    channels: Vec<usize>,
    limit: usize,
    ascending: bool,
    buckets: GroupSlots<Vec<T::Native>>,
    reservation: MemoryReservation,
}

impl<T: NumericType> TopGroupingAggregatorFunction<T> {
    pub fn new(
        channels: Vec<usize>,
        reservation: MemoryReservation,
        initial_capacity: usize,
        limit: usize,
        ascending: bool,
    ) -> Result<Self> {
        if limit == 0 {
            return Err(AggregationError::input("top limit must be > 0"));
        }
        let slots = reservation.sibling(MemoryTenant::GroupSlots);
        Ok(Self {
            channels,
            limit,
            ascending,
            buckets: GroupSlots::new(slots, initial_capacity)?,
            reservation,
        })
    }

    pub fn intermediate_state_fields() -> Vec<Field> {
        vec![Field::new("top", DataType::new_list(T::DATA_TYPE, true), true)]
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn values(&self, group_id: u32) -> Option<&[T::Native]> {
        self.buckets.get(group_id).map(Vec::as_slice)
    }

    fn bucket_bytes(&self) -> usize {
        self.limit * size_of::<T::Native>()
    }

    fn collect(&mut self, group_id: u32, value: T::Native) -> Result<()> {
        self.buckets.ensure_capacity(group_id)?;
        if self.buckets.get(group_id).is_none() {
            self.reservation.try_grow(self.bucket_bytes())?;
            *self.buckets.slot_mut(group_id) = Some(Vec::with_capacity(self.limit));
        }
        let (limit, ascending) = (self.limit, self.ascending);
        let Some(bucket) = self.buckets.get_mut(group_id) else {
            return Ok(());
        };
        // the first `limit` values under this order are kept
        let order = |a: T::Native, b: T::Native| {
            let ordering = T::total_cmp(a, b);
            if ascending {
                ordering
            } else {
                ordering.reverse()
            }
        };
        if bucket.len() == limit {
            match bucket.last() {
                Some(&worst) if order(value, worst) == Ordering::Less => {
                    bucket.pop();
                }
                _ => return Ok(()),
            }
        }
        let at = bucket.partition_point(|&v| order(v, value) != Ordering::Greater);
        bucket.insert(at, value);
        Ok(())
    }

    fn channel(&self, index: usize) -> Result<usize> {
        self.channels
            .get(index)
            .copied()
            .ok_or_else(|| AggregationError::input("top needs one input channel"))
    }

    fn build_lists(&self, selected: &UInt32Array) -> ArrayRef {
        let mut lists = ListBuilder::with_capacity(
            PrimitiveBuilder::<T>::with_capacity(selected.len() * self.limit),
            selected.len(),
        );
        for group_id in selected.iter() {
            match group_id.and_then(|g| self.values(g)).filter(|v| !v.is_empty()) {
                Some(values) => {
                    lists.values().append_slice(values);
                    lists.append(true);
                }
                None => lists.append_null(),
            }
        }
        Arc::new(lists.finish())
    }
}

impl<T: NumericType> GroupingAggregatorFunction for TopGroupingAggregatorFunction<T> {
    fn describe(&self) -> String {
        let direction = if self.ascending { "asc" } else { "desc" };
        format!("top {} {direction} of {}s", self.limit, T::ELEMENT.name())
    }

    fn intermediate_fields(&self) -> Vec<Field> {
        Self::intermediate_state_fields()
    }

    fn final_data_type(&self) -> DataType {
        DataType::new_list(T::DATA_TYPE, true)
    }

    fn add_raw_input(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()> {
        groups.ensure_aligned(page)?;
        let values = raw_primitive::<T>(page, self.channel(0)?, "value")?;
        for p in 0..page.num_rows() {
            if values.is_null(p) {
                continue;
            }
            let value = values.value(p);
            groups.for_each_group(p, |g| self.collect(g, value))?;
        }
        Ok(())
    }

    fn add_intermediate_input(&mut self, groups: &GroupIds<'_>, page: &RecordBatch) -> Result<()> {
        groups.ensure_aligned(page)?;
        let lists = intermediate_list(page, self.channel(0)?, "top")?;
        let values = list_values::<T>(lists, "top")?;
        for p in 0..page.num_rows() {
            let Some((start, end)) = list_range(lists, p) else {
                continue;
            };
            if values.null_count() > 0 && (start..end).any(|i| values.is_null(i)) {
                return Err(AggregationError::intermediate(format!(
                    "null value in top state at position {p}"
                )));
            }
            for i in start..end {
                let value = values.value(i);
                groups.for_each_group(p, |g| self.collect(g, value))?;
            }
        }
        Ok(())
    }

    fn evaluate_intermediate(&self, selected: &UInt32Array) -> Result<Vec<ArrayRef>> {
        Ok(vec![self.build_lists(selected)])
    }

    fn evaluate_final(&self, selected: &UInt32Array, _ctx: &EvaluationContext<'_>) -> Result<ArrayRef> {
        Ok(self.build_lists(selected))
    }

    fn memory_used(&self) -> usize {
        self.reservation.size() + self.buckets.reserved_bytes()
    }
}

impl<T: NumericType> Drop for TopGroupingAggregatorFunction<T> {
    fn drop(&mut self) {
        debug!(
            operator = %self.reservation.operator(),
            groups = self.buckets.live_count(),
            bytes = self.reservation.size(),
            "closing top"
        );
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{AsArray, Int32Array};
    use arrow::datatypes::{Int32Type, Schema};

    use super::*;
    use crate::block::selected_range;
    use crate::memory::MemoryPool;

    fn int_page(values: Vec<Option<i32>>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap()
    }

    fn top(pool: &Arc<MemoryPool>, limit: usize, ascending: bool) -> TopGroupingAggregatorFunction<Int32Type> {
        TopGroupingAggregatorFunction::new(
            vec![0],
            pool.reservation("top", MemoryTenant::AggregationState),
            1,
            limit,
            ascending,
        )
        .unwrap()
    }

    fn lists(array: &ArrayRef) -> Vec<Option<Vec<i32>>> {
        array
            .as_list::<i32>()
            .iter()
            .map(|l| l.map(|l| l.as_primitive::<Int32Type>().values().to_vec()))
            .collect()
    }

    #[test]
    fn test_ascending_keeps_smallest_with_duplicates() {
        let pool = MemoryPool::unbounded();
        let mut agg = top(&pool, 3, true);
        let page = int_page(vec![Some(5), Some(1), None, Some(9), Some(1), Some(3), Some(0)]);
        let groups = UInt32Array::from(vec![0; 7]);
        agg.add_raw_input(&GroupIds::vector(&groups), &page).unwrap();
        assert_eq!(agg.values(0), Some(&[0, 1, 1][..]));
    }

    #[test]
    fn test_descending_and_empty_groups() {
        let pool = MemoryPool::unbounded();
        let mut agg = top(&pool, 2, false);
        let page = int_page(vec![Some(5), Some(1), Some(9), Some(7)]);
        let groups = UInt32Array::from(vec![0, 2, 0, 0]);
        agg.add_raw_input(&GroupIds::vector(&groups), &page).unwrap();
        let out = agg
            .evaluate_final(&selected_range(3), &EvaluationContext::Plain)
            .unwrap();
        assert_eq!(lists(&out), vec![Some(vec![9, 7]), None, Some(vec![1])]);
        assert_eq!(agg.describe(), "top 2 desc of ints");
    }

    #[test]
    fn test_intermediate_merge() {
        let pool = MemoryPool::unbounded();
        let mut left = top(&pool, 3, true);
        let mut right = top(&pool, 3, true);
        left.add_raw_input(
            &GroupIds::vector(&UInt32Array::from(vec![0, 0, 1])),
            &int_page(vec![Some(4), Some(8), Some(2)]),
        )
        .unwrap();
        right
            .add_raw_input(
                &GroupIds::vector(&UInt32Array::from(vec![0, 0, 0])),
                &int_page(vec![Some(6), Some(3), Some(10)]),
            )
            .unwrap();

        let schema = Arc::new(Schema::new(right.intermediate_fields()));
        let state = RecordBatch::try_new(schema, right.evaluate_intermediate(&selected_range(2)).unwrap()).unwrap();
        left.add_intermediate_input(&GroupIds::vector(&UInt32Array::from(vec![0, 1])), &state)
            .unwrap();
        let out = left
            .evaluate_final(&selected_range(2), &EvaluationContext::Plain)
            .unwrap();
        assert_eq!(lists(&out), vec![Some(vec![3, 4, 6]), Some(vec![2])]);
    }

    #[test]
    fn test_buckets_are_charged_up_front() {
        let pool = MemoryPool::unbounded();
        let mut agg = top(&pool, 4, true);
        agg.add_raw_input(
            &GroupIds::vector(&UInt32Array::from(vec![0, 3, 3])),
            &int_page(vec![Some(1), Some(2), Some(3)]),
        )
        .unwrap();
        assert_eq!(pool.used_for_tenant(MemoryTenant::AggregationState), 2 * 4 * 4);
        assert_eq!(agg.memory_used(), pool.total_used());
        drop(agg);
        assert_eq!(pool.total_used(), 0);
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let pool = MemoryPool::unbounded();
        let err = TopGroupingAggregatorFunction::<Int32Type>::new(
            vec![0],
            pool.reservation("top", MemoryTenant::AggregationState),
            1,
            0,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, AggregationError::InvalidInput(_)));
    }
}
