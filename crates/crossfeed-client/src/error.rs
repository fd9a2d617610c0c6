//! Client error types

use std::sync::Arc;

use crossfeed_core::constants::{RU_CAP_EXCEEDED_CODE, RU_CAP_EXCEEDED_MESSAGE};
use serde_json::Value;
use thiserror::Error;

use crate::transport::FetchedPage;

/// Status code for a partition that no longer serves the requested range
pub const STATUS_GONE: u16 = 410;

/// Sub-status of a 410 caused by a partition split
pub const SUB_STATUS_PARTITION_KEY_RANGE_GONE: u32 = 1002;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Core(#[from] crossfeed_core::Error),

    #[error("Gateway returned {status} (sub-status {sub_status:?}): {message}")]
    Gateway {
        status: u16,
        sub_status: Option<u32>,
        message: String,
    },

    #[error("Failed to build routing map for {collection_id}")]
    RoutingMapBuild {
        collection_id: String,
        #[source]
        source: Arc<ClientError>,
    },

    #[error("{message} (consumed {request_charge} RU)")]
    RuCapExceeded {
        message: String,
        request_charge: f64,
        fetched_results: Vec<FetchedPage>,
    },

    #[error("Partition task failed: {0}")]
    TaskFailed(String),
}

impl ClientError {
    pub fn gateway(status: u16, sub_status: Option<u32>, message: impl Into<String>) -> Self {
        ClientError::Gateway {
            status,
            sub_status,
            message: message.into(),
        }
    }

    /// Cap exceeded error carrying the pages accepted before the cap was crossed
    pub fn ru_cap_exceeded(request_charge: f64, fetched_results: Vec<FetchedPage>) -> Self {
        ClientError::RuCapExceeded {
            message: RU_CAP_EXCEEDED_MESSAGE.to_string(),
            request_charge,
            fetched_results,
        }
    }

    /// Machine-readable code, if this error has one
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ClientError::RuCapExceeded { .. } => Some(RU_CAP_EXCEEDED_CODE),
            _ => None,
        }
    }

    /// Whether data was fetched before the operation stopped
    pub fn is_partial_success(&self) -> bool {
        matches!(
            self,
            ClientError::RuCapExceeded { fetched_results, .. } if !fetched_results.is_empty()
        )
    }

    /// Items of every page fetched before the cap was crossed, in page order
    pub fn fetched_items(&self) -> Vec<Value> {
        match self {
            ClientError::RuCapExceeded { fetched_results, .. } => fetched_results
                .iter()
                .flat_map(|page| page.items.iter().cloned())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Gateway failure indicating the target partition was split
    pub fn is_partition_gone(&self) -> bool {
        matches!(
            self,
            ClientError::Gateway {
                status: STATUS_GONE,
                sub_status: Some(SUB_STATUS_PARTITION_KEY_RANGE_GONE),
                ..
            }
        )
    }

    /// Transient gateway failure worth retrying against the same partition
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Gateway { status, .. } => match *status {
                408 | 429 | 449 | 503 => true,
                STATUS_GONE => !self.is_partition_gone(),
                _ => false,
            },
            _ => false,
        }
    }

    pub fn sub_status(&self) -> Option<u32> {
        match self {
            ClientError::Gateway { sub_status, .. } => *sub_status,
            ClientError::RoutingMapBuild { source, .. } => source.sub_status(),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Gateway { status, .. } => Some(*status),
            ClientError::RoutingMapBuild { source, .. } => source.status(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
