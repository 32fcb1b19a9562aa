//! Prometheus metrics for pipeline runs.
//!
//! ```ignore
//! use persona_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.record_training_attempt(AttemptOutcome::Validated);
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{AttemptOutcome, EvaluationOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};
