use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Knobs shared by the aggregators and the in-process driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Hard limit of the worker memory pool.
    pub memory_limit_bytes: usize,
    /// Slots pre-allocated by every grouping table.
    pub initial_group_capacity: usize,
    /// Values retained per group by `top`.
    pub top_limit: usize,
    /// Distinct values counted exactly before `count_distinct` switches to a sketch.
    pub count_distinct_precision_threshold: usize,
    /// Centroids kept per group by `percentile`.
    pub percentile_compression: usize,
    /// Partitions used by the partitioned driver.
    pub partitions: usize,
    /// Rows per page when the driver slices its input.
    pub page_size: usize,
}

impl AggregationConfig {
    pub const MAX_PRECISION_THRESHOLD: usize = 40_000;

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("parse aggregation config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.memory_limit_bytes == 0 {
            bail!("memory_limit_bytes must be > 0");
        }
        if self.top_limit == 0 {
            bail!("top_limit must be > 0");
        }
        if self.count_distinct_precision_threshold > Self::MAX_PRECISION_THRESHOLD {
            bail!(
                "count_distinct_precision_threshold must be <= {}",
                Self::MAX_PRECISION_THRESHOLD
            );
        }
        if self.percentile_compression == 0 {
            bail!("percentile_compression must be > 0");
        }
        if self.partitions == 0 {
            bail!("partitions must be > 0");
        }
        if self.page_size == 0 {
            bail!("page_size must be > 0");
        }
        Ok(())
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 256 * 1024 * 1024,
            initial_group_capacity: 1,
            top_limit: 10,
            count_distinct_precision_threshold: 3_000,
            percentile_compression: 100,
            partitions: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .max(1),
            page_size: 8 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        AggregationConfig::default().validate().unwrap();
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let config = AggregationConfig::from_yaml_str(
            "memory_limit_bytes: 1048576\ntop_limit: 3\npartitions: 2\n",
        )
        .unwrap();
        assert_eq!(config.memory_limit_bytes, 1_048_576);
        assert_eq!(config.top_limit, 3);
        assert_eq!(config.partitions, 2);
        assert_eq!(
            config.count_distinct_precision_threshold,
            AggregationConfig::default().count_distinct_precision_threshold
        );
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(AggregationConfig::from_yaml_str("top_limit: 0\n").is_err());
        assert!(AggregationConfig::from_yaml_str("count_distinct_precision_threshold: 50000\n").is_err());
        assert!(AggregationConfig::from_yaml_str("percentile_compression: 0\n").is_err());
        let config = AggregationConfig {
            page_size: 0,
            ..AggregationConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }
}
