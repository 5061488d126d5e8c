//! Pipeline composition: wraps the dispatcher in its middleware layers.

use tower::ServiceBuilder;

use super::metrics::{MetricsLayer, MetricsService};
use crate::service::dispatch::Dispatcher;

/// Build the request pipeline by wrapping the [`Dispatcher`] with middleware
/// layers.
///
/// The returned service implements `tower::Service<InboundRequest>` and never
/// fails; failures are fault outcomes.
#[must_use]
pub fn build_dispatch_pipeline(dispatcher: Dispatcher) -> MetricsService<Dispatcher> {
    ServiceBuilder::new().layer(MetricsLayer).service(dispatcher)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
