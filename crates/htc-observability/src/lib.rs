//! Observability: logging setup and Prometheus metrics

pub mod exporter;
pub mod logging;
pub mod metrics;

pub use exporter::metrics_router;
pub use logging::{init_logging, LoggingConfig};
pub use metrics::ControllerMetrics;
