//! crossfeed-client: Async cross-partition query execution
//!
//! Builds on the data model in `crossfeed-core`:
//! - [`PartitionRoutingCache`]: single-flight routing map per collection
//! - [`RuConsumedManager`]: request unit total shared by partition tasks
//! - [`CrossPartitionExecutor`]: bounded fan-out with RU cap, retries and
//!   split recovery
//!
//! Transport and metadata access are supplied by the application through
//! [`PartitionTransport`] and [`PartitionRangeSource`].

pub mod error;
pub mod executor;
pub mod metrics;
pub mod routing_cache;
pub mod ru;
pub mod transport;

pub use error::{ClientError, Result};
pub use executor::{CrossPartitionExecutor, QueryRequest, ResultOrdering};
pub use routing_cache::PartitionRoutingCache;
pub use ru::RuConsumedManager;
pub use transport::{
    FetchedPage, PartitionRangeSource, PartitionRequest, PartitionResponse, PartitionTransport,
};
