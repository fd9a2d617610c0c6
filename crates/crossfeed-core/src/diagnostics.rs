//! Per-operation diagnostics
//!
//! A [`DiagnosticContext`] lives for one logical operation. Partition tasks
//! record into it concurrently; secondary lookups (partition range discovery,
//! query plans) record into a child context that is folded into the parent
//! with [`DiagnosticContext::merge_diagnostics`]. Callers only ever see the
//! immutable [`DiagnosticSnapshot`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One observed network call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayCallRecord {
    pub activity_id: Option<String>,
    pub endpoint: Option<String>,
    pub partition_key_range_id: Option<String>,
    pub start_time_ms: u64,
    pub duration_ms: u64,
    pub status_code: u16,
    pub sub_status_code: Option<u32>,
    pub request_charge: f64,
    pub request_payload_bytes: u64,
    pub response_payload_bytes: u64,
}

impl GatewayCallRecord {
    pub fn new(start_time_ms: u64, duration_ms: u64, status_code: u16) -> Self {
        Self {
            start_time_ms,
            duration_ms,
            status_code,
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_activity_id(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    pub fn with_partition(mut self, partition_key_range_id: impl Into<String>) -> Self {
        self.partition_key_range_id = Some(partition_key_range_id.into());
        self
    }

    pub fn with_payload_bytes(mut self, request: u64, response: u64) -> Self {
        self.request_payload_bytes = request;
        self.response_payload_bytes = response;
        self
    }

    pub fn with_request_charge(mut self, request_charge: f64) -> Self {
        self.request_charge = request_charge;
        self
    }

    pub fn with_sub_status(mut self, sub_status_code: Option<u32>) -> Self {
        self.sub_status_code = sub_status_code;
        self
    }
}

/// A call that failed and was retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedAttempt {
    pub attempt_number: u32,
    #[serde(flatten)]
    pub call: GatewayCallRecord,
}

/// Kind of metadata request issued on behalf of a primary operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataLookupType {
    PartitionKeyRangeLookUp,
    DatabaseAccountLookUp,
    QueryPlanLookUp,
    DatabaseLookUp,
    ContainerLookUp,
}

impl fmt::Display for MetadataLookupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetadataLookupType::PartitionKeyRangeLookUp => "PARTITION_KEY_RANGE_LOOK_UP",
            MetadataLookupType::DatabaseAccountLookUp => "DATABASE_ACCOUNT_LOOK_UP",
            MetadataLookupType::QueryPlanLookUp => "QUERY_PLAN_LOOK_UP",
            MetadataLookupType::DatabaseLookUp => "DATABASE_LOOK_UP",
            MetadataLookupType::ContainerLookUp => "CONTAINER_LOOK_UP",
        };
        f.write_str(name)
    }
}

/// A network call attributed to a metadata lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataLookup {
    pub lookup_type: MetadataLookupType,
    #[serde(flatten)]
    pub call: GatewayCallRecord,
}

#[derive(Debug, Default)]
struct DiagnosticRecord {
    failed_attempts: Vec<FailedAttempt>,
    network_calls: Vec<GatewayCallRecord>,
    metadata_lookups: Vec<MetadataLookup>,
    endpoints_contacted: BTreeSet<String>,
}

/// Mutable diagnostics accumulator for one logical operation
#[derive(Debug)]
pub struct DiagnosticContext {
    start_time_ms: u64,
    record: Mutex<DiagnosticRecord>,
}

impl DiagnosticContext {
    /// Start a context at the current time
    pub fn new() -> Self {
        Self::started_at(crate::now_ms())
    }

    pub fn started_at(start_time_ms: u64) -> Self {
        Self {
            start_time_ms,
            record: Mutex::new(DiagnosticRecord::default()),
        }
    }

    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    // Every mutation is a single append or union, so a poisoned record is still consistent.
    fn record(&self) -> MutexGuard<'_, DiagnosticRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_network_call(&self, call: GatewayCallRecord) {
        self.record().network_calls.push(call);
    }

    pub fn record_failed_attempt(&self, call: GatewayCallRecord, attempt_number: u32) {
        self.record().failed_attempts.push(FailedAttempt {
            attempt_number,
            call,
        });
    }

    pub fn record_endpoint_resolution(&self, location: impl Into<String>) {
        self.record().endpoints_contacted.insert(location.into());
    }

    /// Fold a child context in as metadata traffic
    ///
    /// The child's network calls land in `metadata_lookups` tagged with
    /// `lookup_type`, whatever the child itself called them. The child's own
    /// metadata lookups and failed attempts are appended unchanged and its
    /// endpoints are unioned in.
    pub fn merge_diagnostics(&self, child: &DiagnosticContext, lookup_type: MetadataLookupType) {
        if std::ptr::eq(self, child) {
            return;
        }

        let (calls, lookups, attempts, endpoints) = {
            let child = child.record();
            (
                child.network_calls.clone(),
                child.metadata_lookups.clone(),
                child.failed_attempts.clone(),
                child.endpoints_contacted.clone(),
            )
        };

        let mut record = self.record();
        record.metadata_lookups.extend(
            calls
                .into_iter()
                .map(|call| MetadataLookup { lookup_type, call }),
        );
        record.metadata_lookups.extend(lookups);
        record.failed_attempts.extend(attempts);
        record.endpoints_contacted.extend(endpoints);
    }

    /// Number of primary network calls recorded so far
    pub fn network_call_count(&self) -> usize {
        self.record().network_calls.len()
    }

    /// Immutable summary of everything recorded up to `end_time_ms`
    pub fn snapshot(&self, end_time_ms: u64) -> DiagnosticSnapshot {
        let record = self.record();

        let mut metadata_lookup_counts = BTreeMap::new();
        for lookup in &record.metadata_lookups {
            *metadata_lookup_counts.entry(lookup.lookup_type).or_insert(0) += 1;
        }

        let all_calls = record
            .network_calls
            .iter()
            .chain(record.metadata_lookups.iter().map(|l| &l.call))
            .chain(record.failed_attempts.iter().map(|a| &a.call));
        let (request_bytes, response_bytes) = all_calls.fold((0u64, 0u64), |(req, resp), call| {
            (
                req.saturating_add(call.request_payload_bytes),
                resp.saturating_add(call.response_payload_bytes),
            )
        });

        DiagnosticSnapshot {
            start_time_ms: self.start_time_ms,
            duration_ms: end_time_ms.saturating_sub(self.start_time_ms),
            attempt_count: record.failed_attempts.len() + record.network_calls.len(),
            failed_attempts: record.failed_attempts.clone(),
            metadata_lookup_counts,
            gateway_statistics: record.network_calls.clone(),
            metadata_lookups: record.metadata_lookups.clone(),
            total_request_payload_bytes: request_bytes,
            total_response_payload_bytes: response_bytes,
            locations_contacted: record.endpoints_contacted.iter().cloned().collect(),
        }
    }
}

impl Default for DiagnosticContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable diagnostics summary exposed to callers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticSnapshot {
    pub start_time_ms: u64,
    pub duration_ms: u64,
    pub attempt_count: usize,
    pub failed_attempts: Vec<FailedAttempt>,
    pub metadata_lookup_counts: BTreeMap<MetadataLookupType, usize>,
    pub gateway_statistics: Vec<GatewayCallRecord>,
    pub metadata_lookups: Vec<MetadataLookup>,
    pub total_request_payload_bytes: u64,
    pub total_response_payload_bytes: u64,
    pub locations_contacted: Vec<String>,
}

impl DiagnosticSnapshot {
    /// Snapshot of an operation that recorded nothing
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn metadata_lookup_count(&self, lookup_type: MetadataLookupType) -> usize {
        self.metadata_lookup_counts
            .get(&lookup_type)
            .copied()
            .unwrap_or(0)
    }
}

/// Render a snapshot as JSON
///
/// Falls back to a minimal document instead of failing.
pub fn format_json(snapshot: &DiagnosticSnapshot) -> String {
    serde_json::to_string(snapshot).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "Diagnostics serialization failed");
        format!(
            "{{\"startTimeMs\":{},\"durationMs\":{}}}",
            snapshot.start_time_ms, snapshot.duration_ms
        )
    })
}

/// Render a snapshot as a short human-readable summary
pub fn format_text(snapshot: &DiagnosticSnapshot) -> String {
    let lookups = snapshot
        .metadata_lookup_counts
        .iter()
        .map(|(kind, count)| format!("{}={}", kind, count))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "duration={}ms attempts={} failed={} metadata=[{}] request_bytes={} response_bytes={} locations=[{}]",
        snapshot.duration_ms,
        snapshot.attempt_count,
        snapshot.failed_attempts.len(),
        lookups,
        snapshot.total_request_payload_bytes,
        snapshot.total_response_payload_bytes,
        snapshot.locations_contacted.join(", "),
    )
}

impl fmt::Display for DiagnosticSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_text(self))
    }
}
