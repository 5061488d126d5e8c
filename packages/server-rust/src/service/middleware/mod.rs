//! Tower middleware layers for the dispatch pipeline.
//!
//! - [`metrics`]: Request timing and outcome via `tracing` spans
//! - [`pipeline`]: Composes the layers around the dispatcher

pub mod metrics;
pub mod pipeline;

pub use metrics::MetricsLayer;
pub use pipeline::build_dispatch_pipeline;
