//! Client configuration

use serde::{Deserialize, Serialize};

/// Per-client settings for cross-partition execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Request unit cap per logical operation (none = unlimited)
    #[serde(default)]
    pub max_ru_per_operation: Option<f64>,
    /// Concurrent partition requests per operation (0 = unbounded)
    #[serde(default)]
    pub max_degree_of_parallelism: usize,
    /// Retries of a throttled or transiently failing partition request
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Fixed wait between retries
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Page size hint forwarded with each partition request
    #[serde(default)]
    pub max_item_count: Option<u32>,
    /// Ask the backend for index utilization headers
    #[serde(default)]
    pub populate_index_metrics: bool,
}

fn default_max_retry_attempts() -> u32 {
    9
}

fn default_retry_interval_ms() -> u64 {
    1000
}

impl ClientConfig {
    pub fn with_max_ru_per_operation(mut self, cap: f64) -> Self {
        self.max_ru_per_operation = Some(cap);
        self
    }

    pub fn with_max_degree_of_parallelism(mut self, dop: usize) -> Self {
        self.max_degree_of_parallelism = dop;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, interval_ms: u64) -> Self {
        self.max_retry_attempts = max_attempts;
        self.retry_interval_ms = interval_ms;
        self
    }

    pub fn with_max_item_count(mut self, max_item_count: u32) -> Self {
        self.max_item_count = Some(max_item_count);
        self
    }

    pub fn with_index_metrics(mut self, enabled: bool) -> Self {
        self.populate_index_metrics = enabled;
        self
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Whether `consumed` has gone past the configured cap
    pub fn ru_cap_exceeded(&self, consumed: f64) -> bool {
        self.max_ru_per_operation
            .is_some_and(|cap| consumed > cap)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_ru_per_operation: None,
            max_degree_of_parallelism: 0,
            max_retry_attempts: default_max_retry_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
            max_item_count: None,
            populate_index_metrics: false,
        }
    }
}
