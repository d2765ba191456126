// observability/mod.rs - Tracing and Metrics

//! Structured logging and metric recording.
//!
//! Metrics go through the `metrics` facade; the embedding process decides
//! whether a recorder is installed and where the numbers end up.
//!
//! # Example
//!
//! ```ignore
//! use minion_keys::observability::{init_tracing, describe_metrics, TracingConfig};
//!
//! init_tracing(TracingConfig::default());
//! describe_metrics();
//! ```

mod metrics;
mod tracing_setup;

pub use metrics::{
    describe_metrics, record_batch_duration, record_cache_purge, record_classification,
    record_key_transition, record_partition_sizes, record_revocation, PolicyMetrics, StoreMetrics,
    TransitionMetrics,
};

pub use tracing_setup::{init_tracing, TracingConfig, TracingFormat};
