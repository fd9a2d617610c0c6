//! crossfeed-core: Core types for cross-partition query execution
//!
//! This crate defines the synchronous building blocks a client needs when a
//! single logical query fans out over many physical partitions:
//! - Partition key ranges and the per-collection routing map
//! - Response headers and the lazily-derived feed response
//! - Per-operation diagnostics, including nested metadata lookups
//! - Index utilization decoding (never fails the query path)
//! - The non-streaming ORDER BY merger
//!
//! # Partition Key Space
//!
//! Partition boundaries are effective partition key strings compared
//! lexicographically. A complete routing map covers the whole space:
//!
//! | Bound | Value |
//! |-------|-------|
//! | Global minimum (inclusive) | `""` |
//! | Global maximum (exclusive) | `"FF"` |
//!
//! Async concerns (single-flight cache, RU accounting, fan-out) live in
//! `crossfeed-client`.

mod config;
mod error;
mod range;
mod routing;

pub mod diagnostics;
pub mod feed;
pub mod headers;
pub mod index_metrics;
pub mod merger;

pub use config::ClientConfig;
pub use diagnostics::{
    DiagnosticContext, DiagnosticSnapshot, FailedAttempt, GatewayCallRecord, MetadataLookup,
    MetadataLookupType,
};
pub use error::Error;
pub use feed::FeedResponse;
pub use headers::Headers;
pub use index_metrics::{IndexMetricsWriter, IndexUtilizationInfo};
pub use merger::NonStreamingOrderByMerger;
pub use range::{CollectionId, PartitionKeyRange, QueryRange};
pub use routing::RoutingMap;

pub type Result<T> = std::result::Result<T, Error>;

/// Constants for the partition key space
pub mod constants {
    /// Inclusive lower bound of the effective partition key space
    pub const MIN_INCLUSIVE: &str = "";

    /// Exclusive upper bound of the effective partition key space
    pub const MAX_EXCLUSIVE: &str = "FF";

    /// Error code carried by the RU cap exceeded condition
    pub const RU_CAP_EXCEEDED_CODE: &str = "OPERATION_RU_LIMIT_EXCEEDED";

    /// Default message for the RU cap exceeded condition
    pub const RU_CAP_EXCEEDED_MESSAGE: &str = "Request Unit limit per Operation call exceeded";
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
