//! Collaborator seams: partition metadata and partitioned data requests
//!
//! Neither trait knows about HTTP. Implementations wrap whatever transport
//! the application uses and report each physical call as a
//! [`GatewayCallRecord`] so it can be attributed in diagnostics.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crossfeed_core::{
    CollectionId, DiagnosticContext, GatewayCallRecord, Headers, PartitionKeyRange,
};

use crate::error::Result;

/// Source of the raw partition key range list for a collection
#[async_trait]
pub trait PartitionRangeSource: Send + Sync {
    /// List every partition key range of `collection`
    ///
    /// Network calls made here should be recorded into `diagnostics`.
    async fn list_partition_ranges(
        &self,
        collection: &CollectionId,
        diagnostics: &DiagnosticContext,
    ) -> Result<Vec<PartitionKeyRange>>;
}

/// Issues one page request against one partition
#[async_trait]
pub trait PartitionTransport: Send + Sync {
    async fn issue_partitioned_request(
        &self,
        request: PartitionRequest,
    ) -> Result<PartitionResponse>;
}

/// A single page request scoped to one partition key range
#[derive(Debug, Clone)]
pub struct PartitionRequest {
    pub collection: CollectionId,
    pub range: PartitionKeyRange,
    pub query: String,
    pub continuation: Option<String>,
    pub max_item_count: Option<u32>,
    pub populate_index_metrics: bool,
}

/// One page returned by a partition
#[derive(Debug, Clone)]
pub struct PartitionResponse {
    pub items: Vec<Value>,
    pub headers: Headers,
    pub request_charge: f64,
    pub call: GatewayCallRecord,
}

impl PartitionResponse {
    /// Build a response, taking the request charge from `headers`
    pub fn new(items: Vec<Value>, headers: Headers, call: GatewayCallRecord) -> Self {
        let request_charge = headers.request_charge();
        Self {
            items,
            headers,
            request_charge,
            call,
        }
    }

    pub fn continuation(&self) -> Option<&str> {
        self.headers.continuation()
    }
}

/// A page accepted into an operation's results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedPage {
    pub partition_key_range_id: String,
    pub items: Vec<Value>,
    pub request_charge: f64,
}

impl FetchedPage {
    pub fn new(
        partition_key_range_id: impl Into<String>,
        items: Vec<Value>,
        request_charge: f64,
    ) -> Self {
        Self {
            partition_key_range_id: partition_key_range_id.into(),
            items,
            request_charge,
        }
    }
}
