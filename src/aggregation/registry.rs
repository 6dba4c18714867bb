use std::collections::HashMap;
use std::sync::OnceLock;

use arrow::datatypes::DataType;
use serde::{Deserialize, Serialize};

use crate::aggregation::count_distinct::CountDistinctGroupingAggregatorFunction;
use crate::aggregation::min_max::{MaxGroupingAggregatorFunction, MinGroupingAggregatorFunction};
use crate::aggregation::percentile::PercentileGroupingAggregatorFunction;
use crate::aggregation::rate::RateGroupingAggregatorFunction;
use crate::aggregation::top::TopGroupingAggregatorFunction;
use crate::aggregation::{ElementType, GroupingAggregatorFunction, NumericType};
use crate::config::AggregationConfig;
use crate::dispatch_element_type;
use crate::error::{AggregationError, Result};
use crate::memory::MemoryReservation;

/// Per-call knobs; unset values fall back to the [`AggregationConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AggregatorParams {
    pub limit: Option<usize>,
    #[serde(default)]
    pub descending: bool,
    pub precision_threshold: Option<usize>,
    /// Percentile in `[0, 100]`; required by `percentile`.
    pub percentile: Option<f64>,
}

/// Everything a factory needs to build one aggregator function.
#[derive(Debug)]
pub struct AggregatorArgs {
    pub channels: Vec<usize>,
    pub reservation: MemoryReservation,
    pub config: AggregationConfig,
    pub params: AggregatorParams,
}

impl AggregatorArgs {
    pub fn new(channels: Vec<usize>, reservation: MemoryReservation, config: AggregationConfig) -> Self {
        Self {
            channels,
            reservation,
            config,
            params: AggregatorParams::default(),
        }
    }

    pub fn with_params(mut self, params: AggregatorParams) -> Self {
        self.params = params;
        self
    }
}

pub type AggregatorFactory = fn(AggregatorArgs) -> Result<Box<dyn GroupingAggregatorFunction>>;

const ELEMENT_TYPES: [ElementType; 4] = [
    ElementType::Int,
    ElementType::Long,
    ElementType::Float,
    ElementType::Double,
];

/// Grouping aggregators by `(name, element type)`.
pub struct AggregatorRegistry {
    factories: HashMap<(String, ElementType), AggregatorFactory>,
}

impl Default for AggregatorRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register_supported_aggregators();
        registry
    }
}

impl AggregatorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    fn register_supported_aggregators(&mut self) {
        for element in ELEMENT_TYPES {
            dispatch_element_type!(element, T => {
                self.register("rate", element, rate::<T>);
                self.register("min", element, min::<T>);
                self.register("max", element, max::<T>);
                self.register("top", element, top::<T>);
                self.register("count_distinct", element, count_distinct::<T>);
                self.register("percentile", element, percentile::<T>);
            });
        }
    }

    pub fn register(&mut self, name: &str, element: ElementType, factory: AggregatorFactory) {
        self.factories.insert((name.to_lowercase(), element), factory);
    }

    pub fn is_supported(&self, name: &str, data_type: &DataType) -> bool {
        ElementType::from_data_type(data_type)
            .is_some_and(|e| self.factories.contains_key(&(name.to_lowercase(), e)))
    }

    pub fn supported_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().map(|(name, _)| name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn create(
        &self,
        name: &str,
        data_type: &DataType,
        args: AggregatorArgs,
    ) -> Result<Box<dyn GroupingAggregatorFunction>> {
        let factory = ElementType::from_data_type(data_type)
            .and_then(|e| self.factories.get(&(name.to_lowercase(), e)))
            .ok_or_else(|| AggregationError::UnsupportedAggregate {
                name: name.to_string(),
                data_type: data_type.to_string(),
            })?;
        factory(args)
    }
}

pub fn aggregator_registry() -> &'static AggregatorRegistry {
    static REGISTRY: OnceLock<AggregatorRegistry> = OnceLock::new();
    REGISTRY.get_or_init(AggregatorRegistry::default)
}

fn rate<T: NumericType>(args: AggregatorArgs) -> Result<Box<dyn GroupingAggregatorFunction>> {
    Ok(Box::new(RateGroupingAggregatorFunction::<T>::new(
        args.channels,
        args.reservation,
        args.config.initial_group_capacity,
    )?))
}

fn min<T: NumericType>(args: AggregatorArgs) -> Result<Box<dyn GroupingAggregatorFunction>> {
    Ok(Box::new(MinGroupingAggregatorFunction::<T>::new(
        args.channels,
        args.reservation,
        args.config.initial_group_capacity,
    )?))
}

fn max<T: NumericType>(args: AggregatorArgs) -> Result<Box<dyn GroupingAggregatorFunction>> {
    Ok(Box::new(MaxGroupingAggregatorFunction::<T>::new(
        args.channels,
        args.reservation,
        args.config.initial_group_capacity,
    )?))
}

fn top<T: NumericType>(args: AggregatorArgs) -> Result<Box<dyn GroupingAggregatorFunction>> {
    Ok(Box::new(TopGroupingAggregatorFunction::<T>::new(
        args.channels,
        args.reservation,
        args.config.initial_group_capacity,
        args.params.limit.unwrap_or(args.config.top_limit),
        !args.params.descending,
    )?))
}

fn count_distinct<T: NumericType>(args: AggregatorArgs) -> Result<Box<dyn GroupingAggregatorFunction>> {
    Ok(Box::new(CountDistinctGroupingAggregatorFunction::<T>::new(
        args.channels,
        args.reservation,
        args.config.initial_group_capacity,
        args.params
            .precision_threshold
            .unwrap_or(args.config.count_distinct_precision_threshold),
    )?))
}

fn percentile<T: NumericType>(args: AggregatorArgs) -> Result<Box<dyn GroupingAggregatorFunction>> {
    let percentile = args
        .params
        .percentile
        .ok_or_else(|| AggregationError::input("percentile needs a percentile parameter"))?;
    Ok(Box::new(PercentileGroupingAggregatorFunction::<T>::new(
        args.channels,
        args.reservation,
        args.config.initial_group_capacity,
        percentile,
        args.config.percentile_compression,
    )?))
}
