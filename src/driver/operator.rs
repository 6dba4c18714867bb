use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array, RecordBatch, UInt32Array};
use arrow::datatypes::{DataType, Field, Int64Type, Schema};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregation::{
    aggregator_registry, AggregatorArgs, AggregatorMode, AggregatorParams, EvaluationContext,
    GroupTimeRanges, GroupingAggregator, TimeRange,
};
use crate::block::{raw_primitive, selected_range, GroupIds};
use crate::config::AggregationConfig;
use crate::driver::block_hash::LongBlockHash;
use crate::error::Result;
use crate::memory::{MemoryPool, MemoryTenant, OperatorId};

/// One aggregate computed by the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    /// Output column name, or prefix of the intermediate columns.
    pub label: String,
    pub name: String,
    pub data_type: DataType,
    /// Raw input channels; ignored when the operator consumes intermediate pages.
    pub channels: Vec<usize>,
    pub params: AggregatorParams,
}

impl AggregateSpec {
    pub fn new(label: impl Into<String>, name: impl Into<String>, data_type: DataType, channels: Vec<usize>) -> Self {
        Self {
            label: label.into(),
            name: name.into(),
            data_type,
            channels,
            params: AggregatorParams::default(),
        }
    }

    pub fn with_params(mut self, params: AggregatorParams) -> Self {
        self.params = params;
        self
    }
}

/// Where the rate extrapolation boundaries of a group come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeRangeSource {
    /// Every group shares one range.
    Fixed(TimeRange),
    /// The group key is the start of a bucket of `interval` width.
    KeyBuckets { interval: i64 },
}

/// Buckets keyed by the grouping key, resolved per group id.
struct KeyBucketRanges<'a> {
    keys: &'a Int64Array,
    interval: i64,
}

impl GroupTimeRanges for KeyBucketRanges<'_> {
    fn range_for(&self, group_id: u32) -> Option<TimeRange> {
        let g = group_id as usize;
        if g >= self.keys.len() || self.keys.is_null(g) {
            return None;
        }
        let start = self.keys.value(g);
        Some(TimeRange::new(start, start.saturating_add(self.interval)))
    }
}

/// Hash aggregation of `i64` keys over a stream of pages.
#[derive(Debug)]
pub struct GroupingAggregationOperator {
    operator: OperatorId,
    key_channel: usize,
    key_name: String,
    mode: AggregatorMode,
    hash: LongBlockHash,
    aggregators: Vec<(String, GroupingAggregator)>,
    time_ranges: Option<TimeRangeSource>,
    pages: usize,
    rows: usize,
}

impl GroupingAggregationOperator {
    pub fn new(
        operator: impl Into<OperatorId>,
        pool: &Arc<MemoryPool>,
        key_channel: usize,
        key_name: impl Into<String>,
        mode: AggregatorMode,
    ) -> Self {
        let operator = operator.into();
        Self {
            hash: LongBlockHash::new(pool.reservation(operator.clone(), MemoryTenant::BlockHash)),
            operator,
            key_channel,
            key_name: key_name.into(),
            mode,
            aggregators: Vec::new(),
            time_ranges: None,
            pages: 0,
            rows: 0,
        }
    }

    /// Build an operator for `specs`, reading intermediate input laid out as
    /// this operator's own partial output when `mode` consumes partial input.
    pub fn try_new(
        operator: impl Into<OperatorId>,
        pool: &Arc<MemoryPool>,
        config: &AggregationConfig,
        key_name: impl Into<String>,
        key_channel: usize,
        mode: AggregatorMode,
        specs: &[AggregateSpec],
    ) -> Result<Self> {
        let mut op = Self::new(operator, pool, key_channel, key_name, mode);
        let mut next_channel = key_channel + 1;
        for spec in specs {
            let channels = if mode.is_input_partial() {
                let width = intermediate_width(spec, pool, config)?;
                let channels: Vec<usize> = (next_channel..next_channel + width).collect();
                next_channel += width;
                channels
            } else {
                spec.channels.clone()
            };
            op.add_aggregator(pool, config, spec, channels)?;
        }
        Ok(op)
    }

    pub fn with_time_ranges(mut self, source: TimeRangeSource) -> Self {
        self.time_ranges = Some(source);
        self
    }

    pub fn add_aggregator(
        &mut self,
        pool: &Arc<MemoryPool>,
        config: &AggregationConfig,
        spec: &AggregateSpec,
        channels: Vec<usize>,
    ) -> Result<()> {
        let reservation = pool.reservation(
            format!("{}/{}", self.operator, spec.label),
            MemoryTenant::AggregationState,
        );
        let args = AggregatorArgs::new(channels, reservation, *config).with_params(spec.params);
        let function = aggregator_registry().create(&spec.name, &spec.data_type, args)?;
        self.aggregators
            .push((spec.label.clone(), GroupingAggregator::new(function, self.mode)));
        Ok(())
    }

    pub fn group_count(&self) -> usize {
        self.hash.len()
    }

    pub fn memory_used(&self) -> usize {
        self.hash.memory_used()
            + self
                .aggregators
                .iter()
                .map(|(_, a)| a.function().memory_used())
                .sum::<usize>()
    }

    pub fn output_schema(&self) -> Schema {
        let mut fields = vec![Field::new(&self.key_name, DataType::Int64, true)];
        for (label, aggregator) in &self.aggregators {
            fields.extend(aggregator.output_fields(label));
        }
        Schema::new(fields)
    }

    pub fn add_input(&mut self, page: &RecordBatch) -> Result<()> {
        let keys = raw_primitive::<Int64Type>(page, self.key_channel, "key")?;
        let ids = self.hash.add(keys)?;
        let groups = GroupIds::vector(&ids);
        for (_, aggregator) in &mut self.aggregators {
            aggregator.add_page(&groups, page)?;
        }
        self.pages += 1;
        self.rows += page.num_rows();
        Ok(())
    }

    /// Key column followed by every aggregator's output, one row per group.
    pub fn finish(self) -> Result<RecordBatch> {
        let keys = self.hash.keys();
        let selected: UInt32Array = selected_range(self.hash.len() as u32);
        let buckets;
        let ctx = match self.time_ranges {
            None => EvaluationContext::Plain,
            Some(TimeRangeSource::Fixed(ref range)) => EvaluationContext::RangeBounded(range),
            Some(TimeRangeSource::KeyBuckets { interval }) => {
                buckets = KeyBucketRanges {
                    keys: &keys,
                    interval,
                };
                EvaluationContext::RangeBounded(&buckets)
            }
        };
        let mut columns: Vec<ArrayRef> = vec![Arc::new(keys.clone())];
        for (_, aggregator) in &self.aggregators {
            columns.extend(aggregator.evaluate(&selected, &ctx)?);
        }
        let batch = RecordBatch::try_new(Arc::new(self.output_schema()), columns)?;
        info!(
            operator = %self.operator,
            mode = ?self.mode,
            pages = self.pages,
            rows = self.rows,
            groups = batch.num_rows(),
            memory_bytes = self.memory_used(),
            "grouping aggregation finished"
        );
        Ok(batch)
    }
}

/// Number of intermediate columns `spec` produces.
fn intermediate_width(spec: &AggregateSpec, pool: &Arc<MemoryPool>, config: &AggregationConfig) -> Result<usize> {
    let probe = AggregatorArgs::new(
        spec.channels.clone(),
        pool.reservation("schema-probe", MemoryTenant::AggregationState),
        AggregationConfig {
            initial_group_capacity: 0,
            ..*config
        },
    )
    .with_params(spec.params);
    let function = aggregator_registry().create(&spec.name, &spec.data_type, probe)?;
    Ok(function.intermediate_fields().len())
}
