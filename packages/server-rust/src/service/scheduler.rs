//! Delayed, fire-and-forget outbound requests.
//!
//! A scheduled request sleeps for its delay, optionally saves the request,
//! sends it and waits for the reply, then optionally saves the reply. Nothing
//! is reported back to the scheduling handler: failures are logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scriptgate_core::{Element, Fragment};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::outbound::{declare_envelope_prefix, OutboundClient};
use crate::storage::transactions::{TransactionKind, TransactionStore};

/// A request waiting to be sent.
#[derive(Debug, Clone)]
pub struct ScheduledRequest {
    pub request: Fragment,
    pub delay: Duration,
    /// Saves the exchange under this id when set.
    pub transaction_id: Option<String>,
    pub save_request: bool,
    pub save_response: bool,
}

/// Handle to a scheduled request.
///
/// Dropping the handle leaves the request scheduled.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Cancels the request if it has not started sending yet.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Runs scheduled requests on a tokio runtime.
#[derive(Debug, Clone)]
pub struct DelayedDispatcher {
    outbound: OutboundClient,
    transactions: Option<Arc<TransactionStore>>,
    runtime: Handle,
    pending: Arc<AtomicU64>,
}

impl DelayedDispatcher {
    #[must_use]
    pub fn new(
        outbound: OutboundClient,
        transactions: Option<Arc<TransactionStore>>,
        runtime: Handle,
    ) -> Self {
        Self {
            outbound,
            transactions,
            runtime,
            pending: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Schedules `scheduled`; callable from runtime and blocking threads alike.
    pub fn schedule(&self, scheduled: ScheduledRequest) -> ScheduledTask {
        tracing::debug!(
            delay_ms = u64::try_from(scheduled.delay.as_millis()).unwrap_or(u64::MAX),
            transaction = scheduled.transaction_id.as_deref().unwrap_or(""),
            method = scheduled.request.method_name().unwrap_or(""),
            "scheduling request"
        );
        let guard = PendingGuard::new(&self.pending);
        let outbound = self.outbound.clone();
        let transactions = self.transactions.clone();
        let handle = self.runtime.spawn(async move {
            let _guard = guard;
            tokio::time::sleep(scheduled.delay).await;
            run(outbound, transactions, scheduled).await;
        });
        ScheduledTask { handle }
    }

    /// Number of scheduled requests that have not finished.
    #[must_use]
    pub fn pending_count(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    /// Waits until every scheduled request has finished, up to `timeout`.
    ///
    /// Returns `false` if requests were still pending when the timeout expired.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.pending.load(Ordering::Relaxed) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn run(
    outbound: OutboundClient,
    transactions: Option<Arc<TransactionStore>>,
    scheduled: ScheduledRequest,
) {
    let ScheduledRequest {
        request,
        transaction_id,
        save_request,
        save_response,
        ..
    } = scheduled;

    let store = match (transactions, transaction_id) {
        (Some(store), Some(id)) => Some((store, id)),
        (None, Some(id)) => {
            tracing::error!(transaction = %id, "no transaction folder configured; exchange not saved");
            None
        }
        _ => None,
    };

    if save_request {
        if let (Some((store, id)), Some(method)) = (&store, request.method()) {
            persist(store, id, TransactionKind::Request, method.clone()).await;
        }
    }

    let mut reply = match outbound.call(request, false).await {
        Ok(reply) => reply,
        Err(err) => {
            tracing::error!(error = %err, "scheduled request failed");
            return;
        }
    };

    if save_response {
        if let (Some((store, id)), Some(mut method)) = (&store, reply.take_method()) {
            if method.prefix().is_some() && method.prefix() == reply.envelope_prefix() {
                declare_envelope_prefix(&mut method);
            }
            persist(store, id, TransactionKind::Response, method).await;
        }
    }
}

async fn persist(store: &Arc<TransactionStore>, id: &str, kind: TransactionKind, mut root: Element) {
    let store = Arc::clone(store);
    let id = id.to_string();
    let written =
        tokio::task::spawn_blocking(move || store.write(&id, kind, &mut root)).await;
    match written {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => tracing::error!(error = %err, kind = kind.as_str(), "unable to save scheduled exchange"),
        Err(err) => tracing::error!(error = %err, kind = kind.as_str(), "transaction writer panicked"),
    }
}

/// Decrements the pending counter when the task ends or is aborted.
#[derive(Debug)]
struct PendingGuard {
    pending: Arc<AtomicU64>,
}

impl PendingGuard {
    fn new(pending: &Arc<AtomicU64>) -> Self {
        pending.fetch_add(1, Ordering::Relaxed);
        Self {
            pending: Arc::clone(pending),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
