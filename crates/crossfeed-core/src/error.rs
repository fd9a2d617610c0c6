//! Error types for crossfeed-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid collection id {id:?}: {reason}")]
    InvalidCollectionId { id: String, reason: String },

    #[error("Incomplete routing map for {collection}: {reason}")]
    IncompleteRoutingMap { collection: String, reason: String },

    #[error("Invalid query range: {min:?} > {max:?}")]
    InvalidQueryRange { min: String, max: String },
}
