//! Cross-partition query execution
//!
//! A query is resolved to the partition key ranges it touches, then one task
//! per range drains that partition's continuation chain. Tasks run
//! concurrently, bounded by `max_degree_of_parallelism`, and share one RU
//! counter, one diagnostics context and, for non-streaming ORDER BY, one
//! merger.
//!
//! When the operation's RU cap is crossed the page that crossed it is
//! discarded, in-flight tasks are aborted and the caller receives
//! [`ClientError::RuCapExceeded`] with every page accepted so far.
//!
//! A partition that reports itself gone (410 / 1002) has been split: the
//! routing map is force-refreshed and the range is replaced by its children,
//! which resume from the parent's continuation.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crossfeed_core::headers::{self, Headers};
use crossfeed_core::{
    now_ms, ClientConfig, CollectionId, DiagnosticContext, FeedResponse, GatewayCallRecord,
    NonStreamingOrderByMerger, PartitionKeyRange, QueryRange,
};

use crate::error::{ClientError, Result, STATUS_GONE, SUB_STATUS_PARTITION_KEY_RANGE_GONE};
use crate::metrics;
use crate::ru::RuConsumedManager;
use crate::routing_cache::PartitionRoutingCache;
use crate::transport::{
    FetchedPage, PartitionRangeSource, PartitionRequest, PartitionResponse, PartitionTransport,
};

type KeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;
type CompareFn = Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>;

/// How rows from different partitions are combined
#[derive(Clone, Default)]
pub enum ResultOrdering {
    /// Pages concatenated in partition boundary order
    #[default]
    Unordered,
    /// One best row per key, presented best-first
    ///
    /// `compare(existing, candidate) == Less` means the candidate wins.
    NonStreaming { key: KeyFn, compare: CompareFn },
}

impl ResultOrdering {
    pub fn non_streaming(
        key: impl Fn(&Value) -> String + Send + Sync + 'static,
        compare: impl Fn(&Value, &Value) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        ResultOrdering::NonStreaming {
            key: Arc::new(key),
            compare: Arc::new(compare),
        }
    }
}

impl std::fmt::Debug for ResultOrdering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultOrdering::Unordered => f.write_str("Unordered"),
            ResultOrdering::NonStreaming { .. } => f.write_str("NonStreaming"),
        }
    }
}

/// A logical query over one collection
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub collection: CollectionId,
    pub query: String,
    /// Targeted key ranges; empty means the whole collection
    pub ranges: Vec<QueryRange>,
    pub ordering: ResultOrdering,
}

impl QueryRequest {
    pub fn new(collection: CollectionId, query: impl Into<String>) -> Self {
        Self {
            collection,
            query: query.into(),
            ranges: Vec::new(),
            ordering: ResultOrdering::Unordered,
        }
    }

    pub fn with_ranges(mut self, ranges: Vec<QueryRange>) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn with_ordering(mut self, ordering: ResultOrdering) -> Self {
        self.ordering = ordering;
        self
    }
}

/// A partition still to be drained
struct WorkItem {
    range: PartitionKeyRange,
    continuation: Option<String>,
    /// Sequence number of the next page, for boundary-order output
    next_seq: u32,
}

enum PartitionOutcome {
    Drained,
    Split(WorkItem),
    CapExceeded,
}

struct AcceptedPage {
    order: (String, u32),
    page: FetchedPage,
    headers: Headers,
}

/// State shared by every partition task of one operation
struct OperationContext {
    collection: CollectionId,
    query: String,
    config: ClientConfig,
    transport: Arc<dyn PartitionTransport>,
    ru: RuConsumedManager,
    diagnostics: DiagnosticContext,
    accepted: Mutex<Vec<AcceptedPage>>,
    merger: Option<(NonStreamingOrderByMerger<String, Value>, KeyFn)>,
}

impl OperationContext {
    fn cap_exceeded(&self, consumed: f64) -> bool {
        self.config.ru_cap_exceeded(consumed)
    }

    /// Whether accepted pages keep their rows
    ///
    /// Merged rows live in the merger; pages only need them again to report
    /// what was fetched when a capped operation stops early.
    fn retains_page_items(&self) -> bool {
        self.merger.is_none() || self.config.max_ru_per_operation.is_some()
    }

    fn accept(&self, range: &PartitionKeyRange, seq: u32, response: PartitionResponse) {
        if let Some((merger, key)) = &self.merger {
            for item in &response.items {
                merger.set(key(item), item.clone());
            }
        }
        let items = if self.retains_page_items() {
            response.items
        } else {
            Vec::new()
        };
        let page = AcceptedPage {
            order: (range.min_inclusive.clone(), seq),
            page: FetchedPage::new(range.id.clone(), items, response.request_charge),
            headers: response.headers,
        };
        self.accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(page);
    }

    fn take_accepted(&self) -> Vec<AcceptedPage> {
        let mut pages = std::mem::take(
            &mut *self
                .accepted
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        pages.sort_by(|a, b| a.order.cmp(&b.order));
        pages
    }
}

/// Runs queries across every partition they touch
pub struct CrossPartitionExecutor {
    cache: Arc<PartitionRoutingCache>,
    transport: Arc<dyn PartitionTransport>,
    config: ClientConfig,
}

impl CrossPartitionExecutor {
    pub fn new(
        source: Arc<dyn PartitionRangeSource>,
        transport: Arc<dyn PartitionTransport>,
        config: ClientConfig,
    ) -> Self {
        Self::with_cache(Arc::new(PartitionRoutingCache::new(source)), transport, config)
    }

    /// Share a routing cache between executors of the same client
    pub fn with_cache(
        cache: Arc<PartitionRoutingCache>,
        transport: Arc<dyn PartitionTransport>,
        config: ClientConfig,
    ) -> Self {
        Self {
            cache,
            transport,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<PartitionRoutingCache> {
        &self.cache
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Execute `request` to completion
    ///
    /// Dropping the returned future aborts every in-flight partition task.
    pub async fn execute(&self, request: QueryRequest) -> Result<FeedResponse<Value>> {
        let query_ranges = if request.ranges.is_empty() {
            vec![QueryRange::full()]
        } else {
            request.ranges
        };
        for range in &query_ranges {
            range.validate()?;
        }

        let merger = match request.ordering {
            ResultOrdering::Unordered => None,
            ResultOrdering::NonStreaming { key, compare } => {
                let merger =
                    NonStreamingOrderByMerger::new(move |a: &Value, b: &Value| compare(a, b));
                Some((merger, key))
            }
        };

        let ctx = Arc::new(OperationContext {
            collection: request.collection,
            query: request.query,
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            ru: RuConsumedManager::new(),
            diagnostics: DiagnosticContext::new(),
            accepted: Mutex::new(Vec::new()),
            merger,
        });

        let map = self
            .cache
            .resolve_with_diagnostics(&ctx.collection, false, &ctx.diagnostics)
            .await?;
        let mut queue: VecDeque<WorkItem> = map
            .overlapping_many(&query_ranges)
            .into_iter()
            .map(|range| WorkItem {
                range: range.clone(),
                continuation: None,
                next_seq: 0,
            })
            .collect();

        tracing::debug!(
            collection = %ctx.collection,
            ranges = queue.len(),
            "Fanning out query"
        );

        let permits = match self.config.max_degree_of_parallelism {
            0 => Semaphore::MAX_PERMITS,
            dop => dop,
        };
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut tasks: JoinSet<Result<PartitionOutcome>> = JoinSet::new();
        let mut cap_hit = false;
        let mut failure: Option<ClientError> = None;

        loop {
            while !cap_hit && failure.is_none() && !queue.is_empty() {
                if ctx.cap_exceeded(ctx.ru.current().await) {
                    cap_hit = true;
                    break;
                }
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let Some(work) = queue.pop_front() else {
                    break;
                };
                let ctx = Arc::clone(&ctx);
                tasks.spawn(async move {
                    let _permit = permit;
                    metrics::record_partition_start();
                    let outcome = drain_partition(&ctx, work).await;
                    metrics::record_partition_end();
                    outcome
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            match joined {
                Ok(Ok(PartitionOutcome::Drained)) => {}
                Ok(Ok(PartitionOutcome::Split(parent))) => {
                    if cap_hit || failure.is_some() {
                        continue;
                    }
                    match self.replace_split_range(&ctx, parent).await {
                        Ok(children) => {
                            for child in children.into_iter().rev() {
                                queue.push_front(child);
                            }
                        }
                        Err(e) => {
                            failure = Some(e);
                            tasks.abort_all();
                        }
                    }
                }
                Ok(Ok(PartitionOutcome::CapExceeded)) => {
                    cap_hit = true;
                    tasks.abort_all();
                }
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                    tasks.abort_all();
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(ClientError::TaskFailed(e.to_string()));
                    }
                    tasks.abort_all();
                }
            }
        }

        if let Some(e) = failure {
            tracing::warn!(
                collection = %ctx.collection,
                error = %e,
                "Cross-partition query failed"
            );
            return Err(e);
        }

        let consumed = ctx.ru.current().await;
        let pages = ctx.take_accepted();

        if cap_hit {
            metrics::record_ru_cap_exceeded();
            tracing::warn!(
                collection = %ctx.collection,
                ru = consumed,
                cap = ?self.config.max_ru_per_operation,
                pages = pages.len(),
                "RU cap exceeded"
            );
            let fetched = pages.into_iter().map(|accepted| accepted.page).collect();
            return Err(ClientError::ru_cap_exceeded(consumed, fetched));
        }

        let headers = aggregate_headers(&pages, consumed);
        let resources = match &ctx.merger {
            Some((merger, _)) => merger.drain_sorted(),
            None => pages.into_iter().flat_map(|accepted| accepted.page.items).collect(),
        };

        tracing::info!(
            collection = %ctx.collection,
            items = resources.len(),
            ru = consumed,
            "Cross-partition query complete"
        );

        Ok(FeedResponse::new(
            resources,
            headers,
            false,
            ctx.diagnostics.snapshot(now_ms()),
        ))
    }

    /// Children of a split range, resuming from the parent's continuation
    async fn replace_split_range(
        &self,
        ctx: &OperationContext,
        parent: WorkItem,
    ) -> Result<Vec<WorkItem>> {
        let map = self
            .cache
            .resolve_with_diagnostics(&ctx.collection, true, &ctx.diagnostics)
            .await?;
        let children: Vec<&PartitionKeyRange> = map.overlapping(&QueryRange::from(&parent.range));

        if children.iter().any(|child| child.id == parent.range.id) {
            return Err(ClientError::gateway(
                STATUS_GONE,
                Some(SUB_STATUS_PARTITION_KEY_RANGE_GONE),
                format!(
                    "partition {} is gone but still present in the routing map",
                    parent.range.id
                ),
            ));
        }

        tracing::info!(
            collection = %ctx.collection,
            parent = %parent.range.id,
            children = children.len(),
            "Partition split, resuming on child ranges"
        );

        Ok(children
            .into_iter()
            .enumerate()
            .map(|(i, child)| WorkItem {
                range: child.clone(),
                continuation: parent.continuation.clone(),
                next_seq: if i == 0 { parent.next_seq } else { 0 },
            })
            .collect())
    }
}

/// Drain one partition until it has no continuation, the cap is crossed, or it splits
async fn drain_partition(ctx: &OperationContext, work: WorkItem) -> Result<PartitionOutcome> {
    let WorkItem {
        range,
        mut continuation,
        mut next_seq,
    } = work;

    loop {
        if ctx.cap_exceeded(ctx.ru.current().await) {
            return Ok(PartitionOutcome::CapExceeded);
        }

        let response = match fetch_page(ctx, &range, continuation.clone()).await {
            Ok(response) => response,
            Err(e) if e.is_partition_gone() => {
                return Ok(PartitionOutcome::Split(WorkItem {
                    range,
                    continuation,
                    next_seq,
                }));
            }
            Err(e) => return Err(e),
        };

        let consumed = ctx.ru.add(response.request_charge).await;
        if ctx.cap_exceeded(consumed) {
            tracing::debug!(
                partition = %range.id,
                ru = consumed,
                "Discarding page that crossed the RU cap"
            );
            return Ok(PartitionOutcome::CapExceeded);
        }

        continuation = response.continuation().map(str::to_string);
        tracing::debug!(
            partition = %range.id,
            items = response.items.len(),
            ru = consumed,
            more = continuation.is_some(),
            "Accepted page"
        );
        ctx.accept(&range, next_seq, response);
        next_seq += 1;

        if continuation.is_none() {
            return Ok(PartitionOutcome::Drained);
        }
    }
}

/// Issue one page request, retrying transient failures
async fn fetch_page(
    ctx: &OperationContext,
    range: &PartitionKeyRange,
    continuation: Option<String>,
) -> Result<PartitionResponse> {
    let mut attempt = 0u32;
    loop {
        let request = PartitionRequest {
            collection: ctx.collection.clone(),
            range: range.clone(),
            query: ctx.query.clone(),
            continuation: continuation.clone(),
            max_item_count: ctx.config.max_item_count,
            populate_index_metrics: ctx.config.populate_index_metrics,
        };

        let started_ms = now_ms();
        let started = Instant::now();
        let result = ctx.transport.issue_partitioned_request(request).await;
        let elapsed = started.elapsed();

        match result {
            Ok(response) => {
                metrics::record_partition_request(metrics::OUTCOME_OK, elapsed);
                metrics::record_request_charge(response.request_charge);
                if let Some(endpoint) = &response.call.endpoint {
                    ctx.diagnostics.record_endpoint_resolution(endpoint.clone());
                }
                ctx.diagnostics.record_network_call(response.call.clone());
                return Ok(response);
            }
            Err(e) => {
                let elapsed_ms = elapsed.as_millis() as u64;
                let call = GatewayCallRecord::new(started_ms, elapsed_ms, e.status().unwrap_or(0))
                    .with_partition(range.id.clone())
                    .with_sub_status(e.sub_status());
                ctx.diagnostics.record_failed_attempt(call, attempt);

                if e.is_retryable() && attempt < ctx.config.max_retry_attempts {
                    metrics::record_partition_request(metrics::OUTCOME_RETRY, elapsed);
                    tracing::warn!(
                        partition = %range.id,
                        attempt,
                        error = %e,
                        "Retrying partition request"
                    );
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(ctx.config.retry_interval_ms)).await;
                    continue;
                }

                let outcome = if e.is_partition_gone() {
                    metrics::OUTCOME_SPLIT
                } else {
                    metrics::OUTCOME_ERROR
                };
                metrics::record_partition_request(outcome, elapsed);
                return Err(e);
            }
        }
    }
}

/// Total charge, last activity id and first index utilization payload
fn aggregate_headers(pages: &[AcceptedPage], request_charge: f64) -> Headers {
    let mut aggregated = Headers::new().with(headers::REQUEST_CHARGE, request_charge.to_string());

    if let Some(activity_id) = pages.iter().rev().find_map(|p| p.headers.activity_id()) {
        aggregated.insert(headers::ACTIVITY_ID, activity_id);
    }
    for name in [headers::INDEX_UTILIZATION, headers::QUERY_METRICS] {
        if let Some(value) = pages.iter().find_map(|p| p.headers.get(name)) {
            aggregated.insert(name, value);
        }
    }
    aggregated
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct StaticSource {
        ranges: Mutex<Vec<PartitionKeyRange>>,
    }

    #[async_trait]
    impl PartitionRangeSource for StaticSource {
        async fn list_partition_ranges(
            &self,
            _collection: &CollectionId,
            diagnostics: &DiagnosticContext,
        ) -> Result<Vec<PartitionKeyRange>> {
            diagnostics.record_network_call(GatewayCallRecord::new(now_ms(), 1, 200));
            Ok(self.ranges.lock().unwrap().clone())
        }
    }

    /// Serves scripted pages keyed by (partition id, continuation)
    #[derive(Default)]
    struct ScriptedTransport {
        pages: HashMap<(String, Option<String>), Vec<Result<(Vec<Value>, f64, Option<String>)>>>,
        calls: AtomicUsize,
        cursors: Mutex<HashMap<(String, Option<String>), usize>>,
    }

    impl ScriptedTransport {
        fn page(
            mut self,
            partition: &str,
            continuation: Option<&str>,
            items: Vec<Value>,
            charge: f64,
            next: Option<&str>,
        ) -> Self {
            self.pages
                .entry((partition.to_string(), continuation.map(str::to_string)))
                .or_default()
                .push(Ok((items, charge, next.map(str::to_string))));
            self
        }

        fn fail(mut self, partition: &str, continuation: Option<&str>, error: ClientError) -> Self {
            self.pages
                .entry((partition.to_string(), continuation.map(str::to_string)))
                .or_default()
                .push(Err(error));
            self
        }
    }

    #[async_trait]
    impl PartitionTransport for ScriptedTransport {
        async fn issue_partitioned_request(
            &self,
            request: PartitionRequest,
        ) -> Result<PartitionResponse> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            let key = (request.range.id.clone(), request.continuation.clone());
            let index = {
                let mut cursors = self.cursors.lock().unwrap();
                let cursor = cursors.entry(key.clone()).or_insert(0);
                let index = *cursor;
                *cursor += 1;
                index
            };
            let script = self
                .pages
                .get(&key)
                .unwrap_or_else(|| panic!("no script for {:?}", key));
            let step = script.get(index).or_else(|| script.last()).unwrap();
            match step {
                Ok((items, charge, next)) => {
                    let mut headers = Headers::new()
                        .with(headers::REQUEST_CHARGE, charge.to_string())
                        .with(headers::ACTIVITY_ID, format!("act-{}", request.range.id));
                    if let Some(next) = next {
                        headers.insert(headers::CONTINUATION, next.clone());
                    }
                    let call = GatewayCallRecord::new(now_ms(), 1, 200)
                        .with_partition(request.range.id.clone())
                        .with_request_charge(*charge);
                    Ok(PartitionResponse::new(items.clone(), headers, call))
                }
                Err(ClientError::Gateway { status, sub_status, message }) => {
                    Err(ClientError::gateway(*status, *sub_status, message.clone()))
                }
                Err(other) => panic!("unsupported scripted error {other}"),
            }
        }
    }

    fn executor(
        ranges: Vec<PartitionKeyRange>,
        transport: ScriptedTransport,
        config: ClientConfig,
    ) -> CrossPartitionExecutor {
        let source = Arc::new(StaticSource {
            ranges: Mutex::new(ranges),
        });
        CrossPartitionExecutor::new(source, Arc::new(transport), config)
    }

    fn two_ranges() -> Vec<PartitionKeyRange> {
        vec![
            PartitionKeyRange::new("1", "", "0x7FFF"),
            PartitionKeyRange::new("2", "0x7FFF", "FF"),
        ]
    }

    fn request() -> QueryRequest {
        QueryRequest::new(CollectionId::parse("orders").unwrap(), "SELECT * FROM c")
    }

    #[tokio::test]
    async fn test_unordered_pages_in_boundary_order() {
        let transport = ScriptedTransport::default()
            .page("2", None, vec![json!(3)], 1.0, None)
            .page("1", None, vec![json!(1)], 1.0, Some("c1"))
            .page("1", Some("c1"), vec![json!(2)], 1.0, None);
        let exec = executor(two_ranges(), transport, ClientConfig::default());

        let feed = exec.execute(request()).await.unwrap();
        assert_eq!(feed.resources(), &[json!(1), json!(2), json!(3)]);
        assert_eq!(feed.request_charge(), 3.0);
        assert!(!feed.has_more_results());
        assert_eq!(feed.diagnostics().attempt_count, 3);
    }

    #[tokio::test]
    async fn test_targeted_range_only_touches_owner() {
        let transport = ScriptedTransport::default().page("2", None, vec![json!("x")], 2.0, None);
        let exec = executor(two_ranges(), transport, ClientConfig::default());

        let feed = exec
            .execute(request().with_ranges(vec![QueryRange::point("0x9000")]))
            .await
            .unwrap();
        assert_eq!(feed.resources(), &[json!("x")]);
        assert_eq!(feed.activity_id(), Some("act-2"));
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let transport = ScriptedTransport::default()
            .fail("1", None, ClientError::gateway(429, None, "throttled"))
            .page("1", None, vec![json!(1)], 1.0, None)
            .page("2", None, vec![], 1.0, None);
        let config = ClientConfig::default().with_retry(3, 1);
        let exec = executor(two_ranges(), transport, config);

        let feed = exec.execute(request()).await.unwrap();
        assert_eq!(feed.resources(), &[json!(1)]);
        assert_eq!(feed.diagnostics().failed_attempts.len(), 1);
        assert_eq!(feed.diagnostics().failed_attempts[0].call.status_code, 429);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_propagates() {
        let transport = ScriptedTransport::default()
            .fail("1", None, ClientError::gateway(400, None, "bad query"))
            .page("2", None, vec![json!(2)], 1.0, None);
        let config = ClientConfig::default().with_max_degree_of_parallelism(1);
        let exec = executor(two_ranges(), transport, config);

        let err = exec.execute(request()).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let transport = ScriptedTransport::default()
            .fail("1", None, ClientError::gateway(503, None, "unavailable"))
            .page("2", None, vec![], 1.0, None);
        let exec = executor(two_ranges(), transport, ClientConfig::default().with_retry(2, 1));

        let err = exec.execute(request()).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn test_cap_stops_remaining_partitions() {
        let transport = ScriptedTransport::default()
            .page("1", None, vec![json!(1)], 150.0, None)
            .page("2", None, vec![json!(2)], 1.0, None);
        let transport = Arc::new(transport);
        let source = Arc::new(StaticSource {
            ranges: Mutex::new(two_ranges()),
        });
        let config = ClientConfig::default()
            .with_max_ru_per_operation(100.0)
            .with_max_degree_of_parallelism(1);
        let exec = CrossPartitionExecutor::new(source, transport.clone(), config);

        let err = exec.execute(request()).await.unwrap_err();
        assert!(matches!(err, ClientError::RuCapExceeded { .. }));
        assert!(!err.is_partial_success());
        // The second partition was never contacted
        assert_eq!(transport.calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_streaming_order_by() {
        let transport = ScriptedTransport::default()
            .page("1", None, vec![json!({"k": "a", "v": 5}), json!({"k": "b", "v": 1})], 1.0, None)
            .page("2", None, vec![json!({"k": "a", "v": 2}), json!({"k": "c", "v": 9})], 1.0, None);
        let exec = executor(two_ranges(), transport, ClientConfig::default());

        let ordering = ResultOrdering::non_streaming(
            |item| item["k"].as_str().unwrap_or_default().to_string(),
            |a, b| b["v"].as_i64().cmp(&a["v"].as_i64()),
        );
        let feed = exec.execute(request().with_ordering(ordering)).await.unwrap();

        let values: Vec<i64> = feed.resources().iter().filter_map(|r| r["v"].as_i64()).collect();
        assert_eq!(values, vec![1, 2, 9]);
    }

    fn merging_context(config: ClientConfig) -> OperationContext {
        let key: KeyFn =
            Arc::new(|item: &Value| item["k"].as_str().unwrap_or_default().to_string());
        let merger = NonStreamingOrderByMerger::new(|a: &Value, b: &Value| {
            b["v"].as_i64().cmp(&a["v"].as_i64())
        });
        OperationContext {
            collection: CollectionId::parse("orders").unwrap(),
            query: "SELECT * FROM c ORDER BY c.v".to_string(),
            config,
            transport: Arc::new(ScriptedTransport::default()),
            ru: RuConsumedManager::new(),
            diagnostics: DiagnosticContext::new(),
            accepted: Mutex::new(Vec::new()),
            merger: Some((merger, key)),
        }
    }

    fn same_key_page(page: i64) -> PartitionResponse {
        let items = (0..3).map(|i| json!({"k": "a", "v": page * 3 + i})).collect();
        let headers = Headers::new().with(headers::REQUEST_CHARGE, "10");
        PartitionResponse::new(items, headers, GatewayCallRecord::new(now_ms(), 1, 200))
    }

    #[test]
    fn test_merged_rows_are_not_buffered_per_page() {
        let ctx = merging_context(ClientConfig::default());
        let range = PartitionKeyRange::new("1", "", "FF");
        for seq in 0..4u32 {
            ctx.accept(&range, seq, same_key_page(i64::from(seq)));
        }

        let (merger, _) = ctx.merger.as_ref().unwrap();
        assert_eq!(merger.size(), 1);
        assert_eq!(merger.get(&"a".to_string()), Some(json!({"k": "a", "v": 0})));

        let pages = ctx.take_accepted();
        assert_eq!(pages.len(), 4);
        assert!(pages.iter().all(|accepted| accepted.page.items.is_empty()));
        assert!(pages.iter().all(|accepted| accepted.page.request_charge == 10.0));
    }

    #[test]
    fn test_capped_merge_keeps_rows_for_partial_results() {
        let ctx = merging_context(ClientConfig::default().with_max_ru_per_operation(45.0));
        let range = PartitionKeyRange::new("1", "", "FF");
        for seq in 0..2u32 {
            ctx.accept(&range, seq, same_key_page(i64::from(seq)));
        }

        let rows: usize = ctx
            .take_accepted()
            .iter()
            .map(|accepted| accepted.page.items.len())
            .sum();
        assert_eq!(rows, 6);
    }

    /// Every call sleeps; tracks how many are in flight at once
    struct SlowTransport {
        delay: Duration,
        started: AtomicUsize,
        finished: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowTransport {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PartitionTransport for SlowTransport {
        async fn issue_partitioned_request(
            &self,
            request: PartitionRequest,
        ) -> Result<PartitionResponse> {
            self.started.fetch_add(1, AtomicOrdering::SeqCst);
            let now = self.in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.peak.fetch_max(now, AtomicOrdering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
            self.finished.fetch_add(1, AtomicOrdering::SeqCst);
            let headers = Headers::new().with(headers::REQUEST_CHARGE, "1");
            let call = GatewayCallRecord::new(now_ms(), 1, 200).with_partition(request.range.id);
            Ok(PartitionResponse::new(vec![json!(1)], headers, call))
        }
    }

    fn four_ranges() -> Vec<PartitionKeyRange> {
        vec![
            PartitionKeyRange::new("1", "", "0x40"),
            PartitionKeyRange::new("2", "0x40", "0x80"),
            PartitionKeyRange::new("3", "0x80", "0xC0"),
            PartitionKeyRange::new("4", "0xC0", "FF"),
        ]
    }

    #[tokio::test]
    async fn test_degree_of_parallelism_bounds_in_flight_requests() {
        let transport = SlowTransport::new(Duration::from_millis(20));
        let source = Arc::new(StaticSource {
            ranges: Mutex::new(four_ranges()),
        });
        let config = ClientConfig::default().with_max_degree_of_parallelism(2);
        let exec = CrossPartitionExecutor::new(source, transport.clone(), config);

        let feed = exec.execute(request()).await.unwrap();

        assert_eq!(feed.resources().len(), 4);
        assert_eq!(transport.finished.load(AtomicOrdering::SeqCst), 4);
        assert_eq!(transport.peak.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropping_execute_aborts_partition_tasks() {
        let transport = SlowTransport::new(Duration::from_millis(200));
        let source = Arc::new(StaticSource {
            ranges: Mutex::new(two_ranges()),
        });
        let exec = CrossPartitionExecutor::new(source, transport.clone(), ClientConfig::default());

        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), exec.execute(request())).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(transport.started.load(AtomicOrdering::SeqCst) >= 1);
        assert_eq!(transport.finished.load(AtomicOrdering::SeqCst), 0);
    }
}
