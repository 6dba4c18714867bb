use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, AsArray, Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use volga_aggregation::aggregation::AggregatorParams;
use volga_aggregation::driver::TimeRangeSource;
use volga_aggregation::{
    AggregateSpec, AggregationConfig, AggregatorMode, GroupingAggregationOperator, MemoryPool,
    PartitionedAggregation, TimeRange,
};

const HOSTS: i64 = 12;

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("host", DataType::Int64, true),
        Field::new("requests", DataType::Int64, true),
        Field::new("@timestamp", DataType::Int64, false),
    ]))
}

/// Per-host counters with occasional resets, sliced into batches of
/// consecutive rows.
fn counter_batches(seed: u64, rows: usize, batch_rows: usize) -> Vec<RecordBatch> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut counters: Vec<i64> = (0..HOSTS).map(|_| rng.gen_range(0..1_000)).collect();
    let mut hosts = Vec::with_capacity(rows);
    let mut values = Vec::with_capacity(rows);
    let mut timestamps = Vec::with_capacity(rows);
    for row in 0..rows {
        let host = rng.gen_range(0..HOSTS);
        if rng.gen_bool(0.05) {
            counters[host as usize] = rng.gen_range(0..100);
        } else {
            counters[host as usize] += rng.gen_range(0..500);
        }
        hosts.push(Some(host));
        values.push(if rng.gen_bool(0.02) { None } else { Some(counters[host as usize]) });
        timestamps.push(row as i64 * 250);
    }
    let batch = RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int64Array::from(hosts)),
            Arc::new(Int64Array::from(values)),
            Arc::new(Int64Array::from(timestamps)),
        ],
    )
    .unwrap();
    (0..rows)
        .step_by(batch_rows)
        .map(|offset| batch.slice(offset, batch_rows.min(rows - offset)))
        .collect()
}

fn specs() -> Vec<AggregateSpec> {
    vec![
        AggregateSpec::new("rate", "rate", DataType::Int64, vec![1, 2]),
        AggregateSpec::new("max", "max", DataType::Int64, vec![1]),
        AggregateSpec::new("distinct", "count_distinct", DataType::Int64, vec![1]),
        AggregateSpec::new("latest", "top", DataType::Int64, vec![1]).with_params(AggregatorParams {
            limit: Some(3),
            descending: true,
            ..AggregatorParams::default()
        }),
        AggregateSpec::new("p90", "percentile", DataType::Int64, vec![1]).with_params(AggregatorParams {
            percentile: Some(90.0),
            ..AggregatorParams::default()
        }),
    ]
}

fn by_host(batch: &RecordBatch) -> HashMap<i64, usize> {
    let keys = batch.column(0).as_primitive::<Int64Type>();
    (0..batch.num_rows()).map(|row| (keys.value(row), row)).collect()
}

fn single_run(config: &AggregationConfig, input: &[RecordBatch], range: TimeRange) -> RecordBatch {
    let pool = MemoryPool::new(config.memory_limit_bytes);
    let mut op = GroupingAggregationOperator::try_new(
        "single",
        &pool,
        config,
        "host",
        0,
        AggregatorMode::Single,
        &specs(),
    )
    .unwrap()
    .with_time_ranges(TimeRangeSource::Fixed(range));
    for batch in input {
        op.add_input(batch).unwrap();
    }
    op.finish().unwrap()
}

#[test]
fn partitioned_run_matches_single_run() {
    let config = AggregationConfig {
        partitions: 4,
        page_size: 7,
        ..AggregationConfig::default()
    };
    let input = counter_batches(42, 2_000, 64);
    let range = TimeRange::new(0, 2_000 * 250);

    let pool = MemoryPool::new(config.memory_limit_bytes);
    let partitioned = PartitionedAggregation::new("rates", config, pool.clone(), "host", 0, specs())
        .with_time_ranges(TimeRangeSource::Fixed(range))
        .run(&input)
        .unwrap();
    assert_eq!(pool.total_used(), 0);
    assert!(pool.peak_used() > 0);

    let single = single_run(&config, &input, range);
    assert_eq!(partitioned.num_rows(), HOSTS as usize);
    assert_eq!(partitioned.schema(), single.schema());

    let single_rows = by_host(&single);
    for (host, row) in by_host(&partitioned) {
        let other = single_rows[&host];
        let rate = partitioned.column(1).as_primitive::<Float64Type>().value(row);
        let expected = single.column(1).as_primitive::<Float64Type>().value(other);
        assert!(
            (rate - expected).abs() <= 1e-9 * expected.abs().max(1.0),
            "host {host}: {rate} vs {expected}"
        );
        for column in 2..single.num_columns() {
            assert_eq!(
                partitioned.column(column).slice(row, 1).to_data(),
                single.column(column).slice(other, 1).to_data(),
                "host {host} column {column}"
            );
        }
    }
}

#[test]
fn counter_resets_survive_partitioning() {
    let samples = [(0, 10), (1_000, 11), (2_000, 2), (3_000, 12), (4_000, 5)];
    let input: Vec<RecordBatch> = samples
        .iter()
        .map(|(ts, v)| {
            RecordBatch::try_new(
                schema(),
                vec![
                    Arc::new(Int64Array::from(vec![Some(7)])),
                    Arc::new(Int64Array::from(vec![Some(*v)])),
                    Arc::new(Int64Array::from(vec![*ts])),
                ],
            )
            .unwrap()
        })
        .collect();
    let config = AggregationConfig {
        partitions: 2,
        ..AggregationConfig::default()
    };
    let rate_spec = vec![AggregateSpec::new("rate", "rate", DataType::Int64, vec![1, 2])];
    let output = PartitionedAggregation::new("resets", config, MemoryPool::unbounded(), "host", 0, rate_spec)
        .run(&input)
        .unwrap();
    assert_eq!(output.num_rows(), 1);
    // 10 -> 11 -> 2 (reset) -> 12 -> 5 (reset) is an increase of 1 + 2 + 10 + 5 over 4s
    assert_eq!(output.column(1).as_primitive::<Float64Type>().value(0), 4.5);
}

#[test]
fn memory_limit_fails_the_run_and_releases_everything() {
    let config = AggregationConfig {
        partitions: 2,
        page_size: 16,
        memory_limit_bytes: 4 * 1024,
        ..AggregationConfig::default()
    };
    let input = counter_batches(7, 4_000, 100);
    let pool = MemoryPool::new(config.memory_limit_bytes);
    let err = PartitionedAggregation::new("tight", config, pool.clone(), "host", 0, specs())
        .run(&input)
        .unwrap_err();
    assert!(err.is_resource_limit(), "{err}");
    assert_eq!(pool.total_used(), 0);
    assert!(pool.denied_reservations() > 0);
}

#[test]
fn rates_are_null_for_hosts_with_one_sample() {
    let batch = RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int64Array::from(vec![Some(1), Some(2), Some(1), None])),
            Arc::new(Int64Array::from(vec![Some(5), Some(9), Some(15), Some(1)])),
            Arc::new(Int64Array::from(vec![0, 1_000, 2_000, 3_000])),
        ],
    )
    .unwrap();
    let config = AggregationConfig {
        partitions: 2,
        ..AggregationConfig::default()
    };
    let output = PartitionedAggregation::new(
        "sparse",
        config,
        MemoryPool::unbounded(),
        "host",
        0,
        vec![AggregateSpec::new("rate", "rate", DataType::Int64, vec![1, 2])],
    )
    .run(&[batch])
    .unwrap();
    let rows = by_host_nullable(&output);
    let rates = output.column(1).as_primitive::<Float64Type>();
    assert_eq!(rates.value(rows[&Some(1)]), 5.0);
    assert!(rates.is_null(rows[&Some(2)]));
    assert!(rates.is_null(rows[&None]));
}

fn by_host_nullable(batch: &RecordBatch) -> HashMap<Option<i64>, usize> {
    let keys = batch.column(0).as_primitive::<Int64Type>();
    keys.iter().enumerate().map(|(row, key)| (key, row)).collect()
}
