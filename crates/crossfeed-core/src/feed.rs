//! One page of query results plus lazily-derived header views

use std::sync::OnceLock;

use crate::headers::{self, Headers};
use crate::index_metrics::{IndexMetricsWriter, IndexUtilizationInfo};
use crate::DiagnosticSnapshot;

/// A page of results returned to the caller
///
/// Header-derived fields are computed on first access and cached. A response
/// is never mutated after construction, so every accessor is `&self`.
#[derive(Debug)]
pub struct FeedResponse<T> {
    resources: Vec<T>,
    headers: Headers,
    has_more_results: bool,
    diagnostics: DiagnosticSnapshot,

    continuation_token: OnceLock<Option<String>>,
    request_charge: OnceLock<f64>,
    activity_id: OnceLock<Option<String>>,
    index_utilization: OnceLock<IndexUtilizationInfo>,
    index_metrics: OnceLock<String>,
}

impl<T> FeedResponse<T> {
    pub fn new(
        resources: Vec<T>,
        headers: Headers,
        has_more_results: bool,
        diagnostics: DiagnosticSnapshot,
    ) -> Self {
        Self {
            resources,
            headers,
            has_more_results,
            diagnostics,
            continuation_token: OnceLock::new(),
            request_charge: OnceLock::new(),
            activity_id: OnceLock::new(),
            index_utilization: OnceLock::new(),
            index_metrics: OnceLock::new(),
        }
    }

    pub fn resources(&self) -> &[T] {
        &self.resources
    }

    pub fn into_resources(self) -> Vec<T> {
        self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn has_more_results(&self) -> bool {
        self.has_more_results
    }

    pub fn diagnostics(&self) -> &DiagnosticSnapshot {
        &self.diagnostics
    }

    pub fn continuation_token(&self) -> Option<&str> {
        self.continuation_token
            .get_or_init(|| self.headers.continuation().map(str::to_string))
            .as_deref()
    }

    /// Total request units charged for this page
    pub fn request_charge(&self) -> f64 {
        *self
            .request_charge
            .get_or_init(|| self.headers.request_charge())
    }

    pub fn activity_id(&self) -> Option<&str> {
        self.activity_id
            .get_or_init(|| self.headers.activity_id().map(str::to_string))
            .as_deref()
    }

    /// Decoded index utilization; empty when the header is absent or malformed
    pub fn index_utilization(&self) -> &IndexUtilizationInfo {
        self.index_utilization.get_or_init(|| {
            IndexUtilizationInfo::decode(self.headers.get(headers::INDEX_UTILIZATION), true)
        })
    }

    /// Human-readable rendering of [`FeedResponse::index_utilization`]
    pub fn index_metrics(&self) -> &str {
        self.index_metrics
            .get_or_init(|| IndexMetricsWriter::write(self.index_utilization()))
    }

    /// Raw backend query metrics header, passed through untouched
    pub fn query_metrics(&self) -> Option<&str> {
        self.headers.get(headers::QUERY_METRICS)
    }
}
