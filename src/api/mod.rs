//! API layer
//!
//! HTTP handlers for:
//! - Federation (inbox + audit surface)
//! - Metrics (Prometheus)

mod federation;
pub mod metrics;

pub use federation::federation_router;
pub use metrics::metrics_router;
