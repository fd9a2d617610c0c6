//! Metrics for cross-partition execution
//!
//! Emitted through the `metrics` facade. No recorder is installed here; the
//! embedding application decides where they go. Labels never carry
//! collection names or query text.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

pub const CACHE_HIT: &str = "hit";
pub const CACHE_MISS: &str = "miss";
pub const CACHE_JOINED: &str = "joined";

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_RETRY: &str = "retry";
pub const OUTCOME_SPLIT: &str = "split";
pub const OUTCOME_ERROR: &str = "error";

pub fn record_cache_lookup(outcome: &str) {
    counter!("crossfeed_routing_cache_lookups_total", "outcome" => outcome.to_string())
        .increment(1);
}

pub fn record_routing_build(status: &str, duration: Duration) {
    counter!("crossfeed_routing_map_builds_total", "status" => status.to_string()).increment(1);
    histogram!("crossfeed_routing_map_build_duration_seconds", "status" => status.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_partition_request(outcome: &str, duration: Duration) {
    counter!("crossfeed_partition_requests_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("crossfeed_partition_request_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_request_charge(charge: f64) {
    histogram!("crossfeed_request_charge").record(charge);
}

pub fn record_ru_cap_exceeded() {
    counter!("crossfeed_ru_cap_exceeded_total").increment(1);
}

pub fn record_partition_start() {
    gauge!("crossfeed_partitions_in_flight").increment(1.0);
}

pub fn record_partition_end() {
    gauge!("crossfeed_partitions_in_flight").decrement(1.0);
}
