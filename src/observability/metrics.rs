// observability/metrics.rs - Key Management Metrics

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

use crate::cache::ReconcileReport;
use crate::keys::KeyMatches;

/// Transition-related metrics
pub struct TransitionMetrics;

impl TransitionMetrics {
    pub const KEYS_TOTAL: &'static str = "minion_keys_transitions_total";
    pub const BATCH_SECONDS: &'static str = "minion_keys_batch_seconds";
    pub const REVOCATIONS_TOTAL: &'static str = "minion_keys_revocations_total";
}

/// Classification metrics
pub struct PolicyMetrics;

impl PolicyMetrics {
    pub const CLASSIFIED_TOTAL: &'static str = "minion_keys_classified_total";
}

/// Store and cache metrics
pub struct StoreMetrics;

impl StoreMetrics {
    pub const PARTITION_SIZE: &'static str = "minion_keys_partition_size";
    pub const CACHE_PURGED_TOTAL: &'static str = "minion_keys_cache_purged_total";
    pub const CACHE_ERRORS_TOTAL: &'static str = "minion_keys_cache_errors_total";
}

/// Register metric descriptions with whatever recorder is installed.
///
/// Recording works without it; this only makes exporters show help text.
pub fn describe_metrics() {
    describe_counter!(
        TransitionMetrics::KEYS_TOTAL,
        "Keys processed by accept, reject and delete, by outcome"
    );
    describe_histogram!(
        TransitionMetrics::BATCH_SECONDS,
        "Wall time of one batch transition in seconds"
    );
    describe_counter!(
        TransitionMetrics::REVOCATIONS_TOTAL,
        "Session revocations dispatched for deleted keys"
    );
    describe_counter!(
        PolicyMetrics::CLASSIFIED_TOTAL,
        "Presented keys classified, by resulting state and reason"
    );
    describe_gauge!(
        StoreMetrics::PARTITION_SIZE,
        "Keys held in each partition at the last listing"
    );
    describe_counter!(
        StoreMetrics::CACHE_PURGED_TOTAL,
        "Cached minion entries removed by reconciliation"
    );
    describe_counter!(
        StoreMetrics::CACHE_ERRORS_TOTAL,
        "Failures recorded during reconciliation"
    );
}

// Recording functions

/// Record one key processed by a transition
pub fn record_key_transition(action: &str, outcome: &str) {
    counter!(
        TransitionMetrics::KEYS_TOTAL,
        "action" => action.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record how long a batch took
pub fn record_batch_duration(action: &str, elapsed: Duration) {
    histogram!(TransitionMetrics::BATCH_SECONDS, "action" => action.to_string())
        .record(elapsed.as_secs_f64());
}

/// Record a revocation attempt
pub fn record_revocation(dispatched: bool) {
    counter!(
        TransitionMetrics::REVOCATIONS_TOTAL,
        "dispatched" => dispatched.to_string()
    )
    .increment(1);
}

/// Record a classification verdict
pub fn record_classification(state: &str, reason: &str) {
    counter!(
        PolicyMetrics::CLASSIFIED_TOTAL,
        "state" => state.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record partition sizes from a listing
pub fn record_partition_sizes(listing: &KeyMatches) {
    for (status, ids) in listing {
        gauge!(StoreMetrics::PARTITION_SIZE, "status" => status.as_str()).set(ids.len() as f64);
    }
}

/// Record what a reconciliation pass removed
pub fn record_cache_purge(report: &ReconcileReport) {
    let sources = [
        ("dir", report.purged_dirs.len()),
        ("bank", report.flushed.len()),
        ("estate", report.removed_estates.len()),
    ];
    for (source, count) in sources {
        if count > 0 {
            counter!(StoreMetrics::CACHE_PURGED_TOTAL, "source" => source).increment(count as u64);
        }
    }
    if !report.errors.is_empty() {
        counter!(StoreMetrics::CACHE_ERRORS_TOTAL).increment(report.errors.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(TransitionMetrics::KEYS_TOTAL.starts_with("minion_keys_"));
        assert!(PolicyMetrics::CLASSIFIED_TOTAL.starts_with("minion_keys_"));
        assert!(StoreMetrics::CACHE_PURGED_TOTAL.starts_with("minion_keys_"));
    }

    #[test]
    fn test_recording_without_recorder_is_harmless() {
        describe_metrics();
        record_key_transition("accept", "done");
        record_batch_duration("accept", Duration::from_millis(3));
        record_cache_purge(&ReconcileReport {
            purged_dirs: vec!["m1".into()],
            ..Default::default()
        });
    }
}
