// Structured logging
pub mod logging;

// Metrics facade, Prometheus exporter and SLA tracking
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{install_prometheus_exporter, MetricsConfig, SlaConfig, SlaSnapshot, SlaTracker};
