use std::time::Duration;

/// Configuration for a segmented table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// How many of the youngest mutable segments stay writable (default: 8)
    pub min_mutable_segments: usize,

    /// Minimum age of a mutable segment's files before it may be compacted
    /// (default: 1 minute)
    pub min_compaction_age: Duration,

    /// Maximum number of immutable segments open at once (default: 64)
    pub max_open_segments: usize,

    /// How often the background task runs a compaction pass (default: 30s)
    pub compaction_interval: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            min_mutable_segments: 8,
            min_compaction_age: Duration::from_secs(60),
            max_open_segments: 64,
            compaction_interval: Duration::from_secs(30),
        }
    }
}

impl TableConfig {
    /// Set the number of youngest mutable segments kept writable
    pub fn min_mutable_segments(mut self, count: usize) -> Self {
        self.min_mutable_segments = count;
        self
    }

    /// Set the minimum file age before compaction
    pub fn min_compaction_age(mut self, age: Duration) -> Self {
        self.min_compaction_age = age;
        self
    }

    /// Set the maximum number of simultaneously open immutable segments
    pub fn max_open_segments(mut self, count: usize) -> Self {
        self.max_open_segments = count;
        self
    }

    /// Set the background compaction pass interval
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TableConfig::default();
        assert_eq!(config.min_mutable_segments, 8);
        assert_eq!(config.min_compaction_age, Duration::from_secs(60));
        assert_eq!(config.max_open_segments, 64);
        assert_eq!(config.compaction_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = TableConfig::default()
            .min_mutable_segments(2)
            .min_compaction_age(Duration::ZERO)
            .max_open_segments(4)
            .compaction_interval(Duration::from_secs(5));

        assert_eq!(config.min_mutable_segments, 2);
        assert_eq!(config.min_compaction_age, Duration::ZERO);
        assert_eq!(config.max_open_segments, 4);
        assert_eq!(config.compaction_interval, Duration::from_secs(5));
    }
}
