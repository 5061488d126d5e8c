//! Metrics middleware for dispatched requests.
//!
//! Records request duration and outcome using `tracing` spans, not a full
//! metrics crate.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::operation::{DispatchOutcome, InboundRequest};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments requests with timing via `tracing` spans.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records request duration and outcome in tracing spans.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<InboundRequest> for MetricsService<S>
where
    S: Service<InboundRequest, Response = DispatchOutcome> + Send,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = DispatchOutcome;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchOutcome, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: InboundRequest) -> Self::Future {
        let call_id = request.call_id;
        let operation = request.operation().to_string();
        let namespace = request.namespace().to_string();

        let span = info_span!(
            "dispatch",
            operation = %operation,
            namespace = %namespace,
            call_id = call_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(request);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let duration_ms = start.elapsed().as_millis();

                let outcome = match &result {
                    Ok(outcome) => outcome.kind.as_str(),
                    Err(_) => "error",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_u64 = duration_ms as u64;
                tracing::Span::current().record("duration_ms", duration_u64);
                tracing::Span::current().record("outcome", outcome);

                tracing::info!(
                    operation = %operation,
                    call_id = call_id,
                    duration_ms = duration_u64,
                    outcome = outcome,
                    "request complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use scriptgate_core::{Element, Envelope, RequestMetadata};
    use tower::ServiceExt;

    use super::*;
    use crate::service::operation::OutcomeKind;

    /// Immediately-completing service for metrics testing.
    struct ImmediateService;

    impl Service<InboundRequest> for ImmediateService {
        type Response = DispatchOutcome;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<DispatchOutcome, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: InboundRequest) -> Self::Future {
            Box::pin(async move {
                Ok(DispatchOutcome {
                    call_id: request.call_id,
                    kind: OutcomeKind::Response,
                    envelope: Envelope::response_to(&request.envelope),
                })
            })
        }
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_outcome() {
        let svc = MetricsLayer.layer(ImmediateService);
        let request = InboundRequest::new(
            Envelope::with_method(Element::in_namespace("Echo", "urn:e")),
            RequestMetadata::default(),
        );
        let call_id = request.call_id;

        let outcome = svc.oneshot(request).await.unwrap();
        assert_eq!(outcome.call_id, call_id);
        assert_eq!(outcome.envelope.method().unwrap().name(), "EchoResponse");
    }
}
