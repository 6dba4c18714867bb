use std::hash::BuildHasher;
use std::sync::Arc;

use ahash::RandomState;
use arrow::array::{RecordBatch, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::datatypes::Int64Type;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::aggregation::AggregatorMode;
use crate::block::raw_primitive;
use crate::config::AggregationConfig;
use crate::driver::operator::{AggregateSpec, GroupingAggregationOperator, TimeRangeSource};
use crate::error::Result;
use crate::memory::{MemoryPool, OperatorId};

/// Two-phase aggregation over a set of batches.
///
/// Rows are routed to one of `config.partitions` partitions by the hash of
/// their key, so every key lives in exactly one partition and sees its rows in
/// input order. Each partition runs an `Initial` operator on the rayon pool;
/// their intermediate batches are combined by a single `Final` operator.
#[derive(Debug)]
pub struct PartitionedAggregation {
    name: OperatorId,
    config: AggregationConfig,
    pool: Arc<MemoryPool>,
    key_name: String,
    key_channel: usize,
    specs: Vec<AggregateSpec>,
    time_ranges: Option<TimeRangeSource>,
}

impl PartitionedAggregation {
    pub fn new(
        name: impl Into<OperatorId>,
        config: AggregationConfig,
        pool: Arc<MemoryPool>,
        key_name: impl Into<String>,
        key_channel: usize,
        specs: Vec<AggregateSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            pool,
            key_name: key_name.into(),
            key_channel,
            specs,
            time_ranges: None,
        }
    }

    pub fn with_time_ranges(mut self, source: TimeRangeSource) -> Self {
        self.time_ranges = Some(source);
        self
    }

    pub fn run(&self, input: &[RecordBatch]) -> Result<RecordBatch> {
        let partitions = self.config.partitions.max(1);
        let mut assigned: Vec<Vec<RecordBatch>> = vec![Vec::new(); partitions];
        for batch in input {
            for (partition, rows) in self.split_by_key(batch, partitions)?.into_iter().enumerate() {
                if rows.num_rows() > 0 {
                    assigned[partition].push(rows);
                }
            }
        }

        let intermediate: Vec<RecordBatch> = assigned
            .into_par_iter()
            .enumerate()
            .map(|(partition, batches)| self.run_initial(partition, &batches))
            .collect::<Result<_>>()?;

        let mut last = GroupingAggregationOperator::try_new(
            format!("{}/final", self.name),
            &self.pool,
            &self.config,
            self.key_name.clone(),
            0,
            AggregatorMode::Final,
            &self.specs,
        )?;
        if let Some(source) = self.time_ranges {
            last = last.with_time_ranges(source);
        }
        for batch in &intermediate {
            last.add_input(batch)?;
        }
        let output = last.finish()?;
        info!(
            operator = %self.name,
            partitions,
            input_batches = input.len(),
            groups = output.num_rows(),
            peak_memory_bytes = self.pool.peak_used(),
            "partitioned aggregation finished"
        );
        Ok(output)
    }

    /// Partition of a key; the null key goes to partition 0.
    fn partition_of(hasher: &RandomState, key: Option<i64>, partitions: usize) -> usize {
        key.map_or(0, |k| (hasher.hash_one(k) % partitions as u64) as usize)
    }

    /// Rows of `batch` for every partition, keeping their relative order.
    fn split_by_key(&self, batch: &RecordBatch, partitions: usize) -> Result<Vec<RecordBatch>> {
        if partitions == 1 {
            return Ok(vec![batch.clone()]);
        }
        let keys = raw_primitive::<Int64Type>(batch, self.key_channel, "key")?;
        let hasher = RandomState::with_seeds(0, 0, 0, 0);
        let mut indices: Vec<Vec<u32>> = vec![Vec::new(); partitions];
        for (row, key) in keys.iter().enumerate() {
            indices[Self::partition_of(&hasher, key, partitions)].push(row as u32);
        }
        indices
            .into_iter()
            .map(|rows| Ok(take_record_batch(batch, &UInt32Array::from(rows))?))
            .collect()
    }

    fn run_initial(&self, partition: usize, batches: &[RecordBatch]) -> Result<RecordBatch> {
        let mut op = GroupingAggregationOperator::try_new(
            format!("{}/initial-{partition}", self.name),
            &self.pool,
            &self.config,
            self.key_name.clone(),
            self.key_channel,
            AggregatorMode::Initial,
            &self.specs,
        )?;
        let page_size = self.config.page_size.max(1);
        for batch in batches {
            let mut offset = 0;
            while offset < batch.num_rows() {
                let len = page_size.min(batch.num_rows() - offset);
                op.add_input(&batch.slice(offset, len))?;
                offset += len;
            }
        }
        debug!(partition, groups = op.group_count(), "partition done");
        op.finish()
    }
}
