pub mod metrics;
pub mod tracing;

pub use crate::metrics::{gather_metrics, TunnelMetrics};
pub use crate::tracing::{init_logging, init_minimal_logging, LoggingConfig};
