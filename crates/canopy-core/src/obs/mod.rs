//! Observability: runtime event telemetry (metrics) and storage snapshots.

pub(crate) mod metrics;
pub(crate) mod sink;
pub(crate) mod snapshot;

// re-exports
pub use metrics::EventReport;
pub use sink::{MetricsSink, NoopMetricsSink, metrics_report, metrics_reset, with_metrics_sink};
pub use snapshot::{PathReport, StorageReport, storage_report};
