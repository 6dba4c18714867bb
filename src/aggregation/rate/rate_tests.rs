use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, Float64Array, Int32Array, Int64Array, Int64Builder, ListBuilder,
    RecordBatch, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Float64Type, Int32Type, Int64Type, Schema};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::aggregation::{
    BucketTimeRanges, EvaluationContext, GroupTimeRanges, GroupingAggregatorFunction, TimeRange,
};
use crate::block::{selected_range, GroupIds};
use crate::error::AggregationError;
use crate::memory::{MemoryPool, MemoryTenant};

fn new_state(pool: &Arc<MemoryPool>) -> RateLongGroupingState {
    RateGroupingState::new(pool.reservation("rate", MemoryTenant::AggregationState)).unwrap()
}

fn rate_of(state: &RateLongGroupingState, group_id: u32) -> Option<f64> {
    let rates = state.evaluate_final(&UInt32Array::from(vec![group_id]), &EvaluationContext::Plain);
    rates.is_valid(0).then(|| rates.value(0))
}

fn assert_close(got: Option<f64>, expected: f64) {
    let got = got.expect("expected a rate");
    assert!(
        (got - expected).abs() <= 1e-9 * expected.abs().max(1.0),
        "got={got} expected={expected}"
    );
}

fn intermediate_page(arrays: [ArrayRef; 4]) -> RecordBatch {
    let schema = Arc::new(Schema::new(
        RateGroupingAggregatorFunction::<Int64Type>::intermediate_state_fields(),
    ));
    RecordBatch::try_new(schema, arrays.to_vec()).unwrap()
}

/// Random counter samples with occasional resets, ascending timestamps.
fn counter_samples(rng: &mut StdRng, count: usize) -> Vec<(i64, i64)> {
    let mut ts = rng.gen_range(0..1_000);
    let mut value: i64 = rng.gen_range(0..100);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push((ts, value));
        ts += rng.gen_range(1..5_000);
        if rng.gen_bool(0.1) {
            value = rng.gen_range(0..10);
        } else {
            value += rng.gen_range(0..50);
        }
    }
    out
}

#[test]
fn test_sample_count_and_retained_length_on_sorted_appends() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    for (i, ts) in (0..50i64).map(|i| i * 1000).enumerate() {
        state.append(0, ts, i as i64 * 3).unwrap();
        let s = state.get(0).unwrap();
        assert_eq!(s.sample_count(), i as i32 + 1);
        assert!(s.entries() <= 2);
    }
}

#[test]
fn test_fewer_than_two_samples_is_null() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    state.append(1, 100, 7).unwrap();
    let rates = state.evaluate_final(&UInt32Array::from(vec![0, 1, 5]), &EvaluationContext::Plain);
    assert_eq!(rates.len(), 3);
    assert_eq!(rates.null_count(), 3);
}

#[test]
fn test_monotonic_counter_uses_plain_delta() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    for (ts, v) in [(1_000, 5), (2_000, 9), (4_000, 20), (11_000, 60)] {
        state.append(0, ts, v).unwrap();
    }
    assert_eq!(rate_of(&state, 0), Some((60.0 - 5.0) * 1000.0 / 10_000.0));
}

#[test]
fn test_single_reset_is_corrected() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    for (ts, v) in [(0, 10), (1_000, 2), (2_000, 5)] {
        state.append(0, ts, v).unwrap();
    }
    assert_eq!(rate_of(&state, 0), Some(2.5));
}

#[test]
fn test_out_of_order_append_goes_through_merge() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    for (ts, v) in [(0, 10), (2_000, 30), (1_000, 20)] {
        state.append(0, ts, v).unwrap();
    }
    let s = state.get(0).unwrap();
    assert_eq!(s.timestamps(), &[2_000, 1_000, 0]);
    assert_eq!(s.sample_count(), 3);
    assert_eq!(rate_of(&state, 0), Some(10.0));
    assert_eq!(state.state_bytes(), state.live_state_bytes());
}

#[test]
fn test_descending_appends_collapse_too() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    for (ts, v) in [(3_000, 40), (2_000, 30), (1_000, 5), (0, 0)] {
        state.append(0, ts, v).unwrap();
    }
    let s = state.get(0).unwrap();
    assert_eq!(s.entries(), 2);
    assert_eq!(s.timestamps(), &[3_000, 0]);
    assert_close(rate_of(&state, 0), 40.0 * 1000.0 / 3_000.0);
}

#[test]
fn test_in_order_appends_stay_bounded_after_a_duplicate_timestamp() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    for (ts, v) in [(0, 10), (1_000, 20), (1_000, 20)] {
        state.append(0, ts, v).unwrap();
    }
    assert_eq!(state.get(0).unwrap().entries(), 3);
    let bytes = state.state_bytes();
    for i in 1..=100i64 {
        state.append(0, 1_000 + i * 1_000, 20 + i * 5).unwrap();
        assert_eq!(state.get(0).unwrap().entries(), 3);
    }
    let s = state.get(0).unwrap();
    assert_eq!(s.timestamps(), &[101_000, 1_000, 0]);
    assert_eq!(s.sample_count(), 103);
    assert_eq!(state.state_bytes(), bytes);
    assert_eq!(state.state_bytes(), state.live_state_bytes());
    assert_close(rate_of(&state, 0), 510.0 * 1000.0 / 101_000.0);
}

#[test]
fn test_merge_matches_direct_accumulation() {
    let mut rng = StdRng::seed_from_u64(7);
    for round in 0..50 {
        let len = rng.gen_range(2..40);
        let samples = counter_samples(&mut rng, len);
        let pool = MemoryPool::unbounded();

        let mut direct = new_state(&pool);
        for (ts, v) in &samples {
            direct.append(0, *ts, *v).unwrap();
        }

        // older samples on one side, newer on the other
        let cut = rng.gen_range(1..=samples.len());
        let mut older = new_state(&pool);
        let mut newer = new_state(&pool);
        for (ts, v) in &samples[..cut] {
            older.append(0, *ts, *v).unwrap();
        }
        for (ts, v) in &samples[cut..] {
            newer.append(0, *ts, *v).unwrap();
        }
        let (mut left, right) = if rng.gen_bool(0.5) {
            (older, newer)
        } else {
            (newer, older)
        };
        left.merge_group_from(0, &right, 0).unwrap();

        let expected = rate_of(&direct, 0).unwrap();
        assert_close(rate_of(&left, 0), expected);
        assert_eq!(
            left.get(0).unwrap().sample_count() as usize,
            samples.len(),
            "round {round}"
        );
    }
}

#[test]
fn test_intermediate_round_trip() {
    let mut rng = StdRng::seed_from_u64(11);
    let pool = MemoryPool::unbounded();
    let mut source = new_state(&pool);
    for g in 0..8u32 {
        for (ts, v) in counter_samples(&mut rng, 1 + g as usize * 3) {
            source.append(g, ts, v).unwrap();
        }
    }
    // group 9 is never written
    let selected = UInt32Array::from((0..10).collect::<Vec<u32>>());
    let page = intermediate_page(source.to_intermediate(&selected));

    let mut target = new_state(&pool);
    let block = RateIntermediateBlock::<Int64Type>::try_new(&page, &[0, 1, 2, 3]).unwrap();
    for p in 0..block.len() {
        target.combine_intermediate(p as u32, &block, p).unwrap();
    }

    let expected = source.evaluate_final(&selected, &EvaluationContext::Plain);
    let got = target.evaluate_final(&selected, &EvaluationContext::Plain);
    assert_eq!(expected, got);
    assert!(target.get(9).is_none());
}

#[test]
fn test_intermediate_absent_groups_are_null_lists_and_zero_scalars() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    state.append(0, 10, 1).unwrap();
    state.append(0, 20, 2).unwrap();
    let [timestamps, values, counts, resets] = state.to_intermediate(&UInt32Array::from(vec![3, 0]));

    let timestamps = timestamps.as_list::<i32>();
    assert!(timestamps.is_null(0));
    assert_eq!(
        timestamps.value(1).as_primitive::<Int64Type>().values().to_vec(),
        vec![20, 10]
    );
    assert!(values.is_null(0));
    let counts = counts.as_primitive::<Int32Type>();
    assert_eq!(counts.null_count(), 0);
    assert_eq!(counts.values().to_vec(), vec![0, 2]);
    let resets = resets.as_primitive::<Float64Type>();
    assert_eq!(resets.null_count(), 0);
    assert_eq!(resets.value(0), 0.0);
}

#[test]
fn test_intermediate_keeps_more_than_two_points() {
    let pool = MemoryPool::unbounded();
    let mut a = new_state(&pool);
    let mut b = new_state(&pool);
    for (ts, v) in [(0, 1), (2_000, 3)] {
        a.append(0, ts, v).unwrap();
    }
    for (ts, v) in [(1_000, 50), (3_000, 4)] {
        b.append(0, ts, v).unwrap();
    }
    a.merge_group_from(0, &b, 0).unwrap();
    assert_eq!(a.get(0).unwrap().entries(), 4);

    let [timestamps, ..] = a.to_intermediate(&UInt32Array::from(vec![0]));
    assert_eq!(timestamps.as_list::<i32>().value_length(0), 4);
}

#[test]
fn test_memory_accounting_tracks_live_states() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    let mut other = new_state(&pool);
    for (i, g) in [0u32, 3, 17, 3, 0, 0].into_iter().enumerate() {
        state.append(g, i as i64 * 1000, i as i64).unwrap();
        assert_eq!(state.state_bytes(), state.live_state_bytes());
    }
    for ts in [500, 1500, 2500] {
        other.append(3, ts, 2).unwrap();
    }
    state.merge_group_from(3, &other, 3).unwrap();
    state.merge_group_from(40, &other, 3).unwrap();
    assert_eq!(state.state_bytes(), state.live_state_bytes());
    assert_eq!(
        pool.used_for_tenant(MemoryTenant::AggregationState),
        state.live_state_bytes() + other.live_state_bytes()
    );
    assert!(state.group_capacity() >= 41);

    state.close();
    other.close();
    assert_eq!(pool.total_used(), 0);
}

#[test]
fn test_denied_reservation_leaves_group_untouched() {
    let pool = MemoryPool::unbounded();
    let mut big = new_state(&pool);
    for ts in [0, 1000, 2000] {
        big.append(0, ts, ts).unwrap();
    }
    let mut extra = new_state(&pool);
    for ts in [500, 1500] {
        extra.append(0, ts, 1).unwrap();
    }
    big.merge_group_from(0, &extra, 0).unwrap();
    let entries_before = big.get(0).unwrap().entries();

    // a pool with room for the slots and the current state only
    let tight = MemoryPool::new(
        big.ram_bytes_used() + RateState::<Int64Type>::bytes_used(1),
    );
    let mut state = RateLongGroupingState::new(tight.reservation("tight", MemoryTenant::AggregationState)).unwrap();
    state.append(0, 0, 1).unwrap();
    state.append(0, 1000, 2).unwrap();
    let used_before = tight.total_used();
    let err = state.merge_group_from(0, &big, 0).unwrap_err();
    assert!(err.is_resource_limit());
    let s = state.get(0).unwrap();
    assert_eq!(s.entries(), 2);
    assert_eq!(s.sample_count(), 2);
    assert_eq!(tight.total_used(), used_before);
    assert_eq!(state.state_bytes(), state.live_state_bytes());
    assert_eq!(entries_before, 4);
}

#[test]
fn test_extrapolated_rate_is_at_least_plain_rate() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    for i in 0..10i64 {
        state.append(0, 10_000 + i * 10_000, 1_000 + i * 100).unwrap();
    }
    let plain = rate_of(&state, 0).unwrap();
    let range = TimeRange::new(0, 120_000);
    let rates = state.evaluate_final(&UInt32Array::from(vec![0]), &EvaluationContext::RangeBounded(&range));
    let extrapolated = rates.value(0);
    // average interval 9s: both gaps exceed 9.9s and are capped to 4.5s
    let slope = 0.01;
    let expected = (900.0 + 4.5 * 1000.0 * slope + 4.5 * 1000.0 * slope) * 1000.0 / 120_000.0;
    assert!((extrapolated - expected).abs() < 1e-9, "got {extrapolated}");
    assert!(plain > 0.0);
    assert!(extrapolated * 120.0 >= plain * 90.0);
}

#[test]
fn test_bucket_ranges_per_group() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    for g in 0..2u32 {
        let base = g as i64 * 60_000;
        for i in 0..6i64 {
            state.append(g, base + i * 10_000, i * 10).unwrap();
        }
    }
    let ranges = BucketTimeRanges::new(vec![0, 60_000], 60_000);
    let rates = state.evaluate_final(&UInt32Array::from(vec![0, 1, 2]), &EvaluationContext::RangeBounded(&ranges));
    // no start gap; the 10s end gap exceeds 1.1 * 50/6 s and is halved to 25/6 s
    let average = 50_000.0 / 6.0;
    let expected = (50.0 + average / 2.0 * (50.0 / 50_000.0)) * 1000.0 / 60_000.0;
    assert!((rates.value(0) - expected).abs() < 1e-9);
    assert!((rates.value(1) - expected).abs() < 1e-9);
    assert!(rates.is_null(2));
}

#[test]
fn test_full_i64_timestamp_range() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    state.append(0, i64::MIN, 1).unwrap();
    state.append(0, i64::MAX, 2).unwrap();
    let rate = rate_of(&state, 0).unwrap();
    assert!(rate > 0.0 && rate.is_finite(), "rate={rate}");

    let ranges = BucketTimeRanges::new(vec![i64::MAX - 10], 60_000);
    assert_eq!(ranges.range_for(0), Some(TimeRange::new(i64::MAX - 10, i64::MAX)));
    let rates = state.evaluate_final(&UInt32Array::from(vec![0]), &EvaluationContext::RangeBounded(&ranges));
    assert!(rates.value(0).is_finite());
}

fn int64_list(entries: &[Option<Vec<i64>>]) -> ArrayRef {
    let mut builder = ListBuilder::new(Int64Builder::new());
    for entry in entries {
        match entry {
            Some(values) => {
                builder.values().append_slice(values);
                builder.append(true);
            }
            None => builder.append_null(),
        }
    }
    Arc::new(builder.finish())
}

#[test]
fn test_malformed_intermediate_is_rejected_without_mutation() {
    let pool = MemoryPool::unbounded();
    let mut state = new_state(&pool);
    state.append(0, 0, 1).unwrap();

    let cases: Vec<[ArrayRef; 4]> = vec![
        // mismatched list lengths
        [
            int64_list(&[Some(vec![20, 10])]),
            int64_list(&[Some(vec![2])]),
            Arc::new(Int32Array::from(vec![2])),
            Arc::new(Float64Array::from(vec![0.0])),
        ],
        // null timestamps with values present
        [
            int64_list(&[None]),
            int64_list(&[Some(vec![2])]),
            Arc::new(Int32Array::from(vec![1])),
            Arc::new(Float64Array::from(vec![0.0])),
        ],
        // ascending timestamps
        [
            int64_list(&[Some(vec![10, 20])]),
            int64_list(&[Some(vec![1, 2])]),
            Arc::new(Int32Array::from(vec![2])),
            Arc::new(Float64Array::from(vec![0.0])),
        ],
        // fewer samples than retained points
        [
            int64_list(&[Some(vec![20, 10])]),
            int64_list(&[Some(vec![1, 2])]),
            Arc::new(Int32Array::from(vec![1])),
            Arc::new(Float64Array::from(vec![0.0])),
        ],
    ];
    for arrays in cases {
        let page = intermediate_page(arrays);
        let block = RateIntermediateBlock::<Int64Type>::try_new(&page, &[0, 1, 2, 3]).unwrap();
        let err = state.combine_intermediate(0, &block, 0).unwrap_err();
        assert!(matches!(err, AggregationError::InvalidIntermediateState(_)), "{err}");
        assert_eq!(state.get(0).unwrap().sample_count(), 1);
    }

    // channel lengths disagree
    let timestamps = int64_list(&[Some(vec![1]), None]);
    let values = int64_list(&[Some(vec![1])]);
    let counts = Int32Array::from(vec![1, 0]);
    let resets = Float64Array::from(vec![0.0, 0.0]);
    let err = RateIntermediateBlock::<Int64Type>::from_arrays(
        timestamps.as_list::<i32>(),
        values.as_list::<i32>(),
        &counts,
        &resets,
    )
    .unwrap_err();
    assert!(matches!(err, AggregationError::InvalidIntermediateState(_)));

    // wrong value type
    let schema = Arc::new(Schema::new(vec![
        Field::new("timestamps", DataType::new_list(DataType::Int64, true), true),
        Field::new("values", DataType::Int64, false),
        Field::new("sample_counts", DataType::Int32, false),
        Field::new("resets", DataType::Float64, false),
    ]));
    let page = RecordBatch::try_new(
        schema,
        vec![
            int64_list(&[Some(vec![1])]),
            Arc::new(Int64Array::from(vec![1])),
            Arc::new(Int32Array::from(vec![1])),
            Arc::new(Float64Array::from(vec![0.0])),
        ],
    )
    .unwrap();
    assert!(matches!(
        RateIntermediateBlock::<Int64Type>::try_new(&page, &[0, 1, 2, 3]),
        Err(AggregationError::InvalidIntermediateState(_))
    ));
}

#[test]
fn test_function_raw_and_intermediate_pages() {
    let pool = MemoryPool::unbounded();
    let reservation = pool.reservation("fn", MemoryTenant::AggregationState);
    let mut initial = RateGroupingAggregatorFunction::<Float64Type>::new(vec![0, 1], reservation, 4).unwrap();
    assert_eq!(initial.describe(), "rate of doubles");

    let schema = Arc::new(Schema::new(vec![
        Field::new("value", DataType::Float64, true),
        Field::new("ts", DataType::Int64, true),
    ]));
    let page = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Float64Array::from(vec![Some(1.0), Some(5.0), None, Some(3.0), Some(9.0)])),
            Arc::new(Int64Array::from(vec![Some(0), Some(0), Some(500), Some(2_000), Some(4_000)])),
        ],
    )
    .unwrap();
    let groups = UInt32Array::from(vec![Some(0), Some(1), Some(0), Some(0), Some(1)]);
    initial.add_raw_input(&GroupIds::vector(&groups), &page).unwrap();

    let selected = selected_range(2);
    let intermediate = initial.evaluate_intermediate(&selected).unwrap();
    let schema = Arc::new(Schema::new(initial.intermediate_fields()));
    let intermediate_page = RecordBatch::try_new(schema, intermediate).unwrap();

    let reservation = pool.reservation("fn-final", MemoryTenant::AggregationState);
    let mut last = RateGroupingAggregatorFunction::<Float64Type>::new(vec![0, 1, 2, 3], reservation, 1).unwrap();
    // reverse the group mapping on the way in
    let remap = UInt32Array::from(vec![1, 0]);
    last.add_intermediate_input(&GroupIds::vector(&remap), &intermediate_page).unwrap();

    let rates = last.evaluate_final(&selected, &EvaluationContext::Plain).unwrap();
    let rates = rates.as_primitive::<Float64Type>();
    assert!((rates.value(0) - 1.0).abs() < 1e-12);
    assert!((rates.value(1) - 1.0).abs() < 1e-12);
    assert!(last.memory_used() > 0);

    let short_groups = UInt32Array::from(vec![0]);
    assert!(matches!(
        initial.add_raw_input(&GroupIds::vector(&short_groups), &page),
        Err(AggregationError::InvalidInput(_))
    ));
}

#[test]
fn test_int_rate_keeps_integer_values() {
    let pool = MemoryPool::unbounded();
    let mut state = RateIntGroupingState::new(pool.reservation("int", MemoryTenant::AggregationState)).unwrap();
    state.append(0, 0, i32::MAX - 10).unwrap();
    state.append(0, 1_000, i32::MAX).unwrap();
    let rates = state.evaluate_final(&UInt32Array::from(vec![0]), &EvaluationContext::Plain);
    assert_eq!(rates.value(0), 10.0);
    let [_, values, ..] = state.to_intermediate(&UInt32Array::from(vec![0]));
    assert_eq!(values.as_list::<i32>().values().data_type(), &DataType::Int32);
}
