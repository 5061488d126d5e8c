//! Request, outcome and error types of the dispatch pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

use scriptgate_core::{Envelope, Locator, RequestMetadata};

use super::config::ConfigError;
use super::outbound::OutboundError;
use crate::scripting::{BridgeError, ScriptError};
use crate::storage::transactions::TransactionError;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// InboundRequest
// ---------------------------------------------------------------------------

/// One inbound request as delivered by the transport.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub call_id: u64,
    pub envelope: Envelope,
    pub metadata: RequestMetadata,
}

impl InboundRequest {
    /// Wraps `envelope`, assigning the next process-wide call id.
    #[must_use]
    pub fn new(envelope: Envelope, metadata: RequestMetadata) -> Self {
        Self {
            call_id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            envelope,
            metadata,
        }
    }

    /// Local name of the request method, empty when the body has none.
    #[must_use]
    pub fn operation(&self) -> &str {
        self.envelope.method().map_or("", |m| m.local_name())
    }

    /// Namespace of the request method, empty when unqualified.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.envelope
            .method()
            .and_then(|m| m.namespace())
            .unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// DispatchState / DispatchOutcome
// ---------------------------------------------------------------------------

/// Stages a request moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Resolving,
    PreProcessing,
    Executing,
    Assembling,
    Done,
}

impl DispatchState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolving => "resolving",
            Self::PreProcessing => "pre-processing",
            Self::Executing => "executing",
            Self::Assembling => "assembling",
            Self::Done => "done",
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The handler (or a built-in method) produced a response.
    Response,
    /// A pre-processor stopped the request and wrote the response itself.
    ShortCircuited,
    /// The response carries a SOAP fault.
    Fault,
}

impl OutcomeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Response => "response",
            Self::ShortCircuited => "short-circuited",
            Self::Fault => "fault",
        }
    }
}

/// The response envelope for one request.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub call_id: u64,
    pub kind: OutcomeKind,
    pub envelope: Envelope,
}

impl DispatchOutcome {
    #[must_use]
    pub fn is_fault(&self) -> bool {
        self.kind == OutcomeKind::Fault
    }
}

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Fault categories a dispatch failure is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCategory {
    /// A called service answered with a fault; it is passed on unchanged.
    Remote,
    /// The handler raised a fault on purpose.
    Handler,
    /// Anything else; reported as `Server.Exception`.
    Unclassified,
}

/// Failures while dispatching a request. Every variant ends up as a fault
/// response.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("request body has no method element")]
    MissingMethod,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no handler is configured for {0}")]
    NoHandler(Locator),

    #[error("pre-processor {name:?} failed: {source:#}")]
    PreProcessor {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("transaction save folder is not configured")]
    NoTransactionStore,

    #[error("handler task failed: {0}")]
    Task(String),
}

impl DispatchError {
    #[must_use]
    pub fn category(&self) -> FaultCategory {
        match self {
            Self::Script(ScriptError::Bridge(BridgeError::Outbound(OutboundError::RemoteFault(_)))) => {
                FaultCategory::Remote
            }
            Self::Script(ScriptError::Bridge(BridgeError::Fault(_))) => FaultCategory::Handler,
            _ => FaultCategory::Unclassified,
        }
    }
}

impl From<BridgeError> for DispatchError {
    fn from(err: BridgeError) -> Self {
        Self::Script(ScriptError::Bridge(err))
    }
}
