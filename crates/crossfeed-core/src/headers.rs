//! Response headers exchanged with the gateway

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const REQUEST_CHARGE: &str = "x-ms-request-charge";
pub const ACTIVITY_ID: &str = "x-ms-activity-id";
pub const CONTINUATION: &str = "x-ms-continuation";
pub const INDEX_UTILIZATION: &str = "x-ms-cosmos-index-utilization";
pub const QUERY_METRICS: &str = "x-ms-documentdb-query-metrics";
pub const SUB_STATUS: &str = "x-ms-substatus";
pub const PARTITION_KEY_RANGE_ID: &str = "x-ms-documentdb-partitionkeyrangeid";

/// Case-insensitive header map
///
/// Keys are stored lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Request charge header, 0 when absent or unparsable
    pub fn request_charge(&self) -> f64 {
        self.get(REQUEST_CHARGE)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
    }

    pub fn activity_id(&self) -> Option<&str> {
        self.get(ACTIVITY_ID)
    }

    pub fn continuation(&self) -> Option<&str> {
        self.get(CONTINUATION).filter(|v| !v.is_empty())
    }

    pub fn sub_status(&self) -> Option<u32> {
        self.get(SUB_STATUS).and_then(|v| v.trim().parse().ok())
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}
