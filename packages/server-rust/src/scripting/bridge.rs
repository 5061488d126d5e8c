//! The per-request object handed to handler scripts.
//!
//! The bridge owns the request and the response being built. Any explicit
//! response call raises a flag; once raised, the script's return value and
//! printed output are ignored.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scriptgate_core::{Fragment, XmlError};

use crate::service::context::ConnectorContext;
use crate::service::outbound::OutboundError;
use crate::service::scheduler::ScheduledRequest;
use crate::storage::transactions::{TransactionError, TransactionKind};

use super::ScriptOutput;

/// A bridge shared between the dispatcher and the script engine.
pub type SharedBridge = Arc<Mutex<ExecutionBridge>>;

/// A fault raised on purpose by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFault {
    pub code: String,
    pub actor: Option<String>,
    pub message: String,
    /// Detail payload as XML text; parsed when the fault response is built.
    pub detail: Option<String>,
}

impl fmt::Display for HandlerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors from bridge calls.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid XML: {0}")]
    Xml(#[from] XmlError),

    #[error(transparent)]
    Outbound(#[from] OutboundError),

    #[error("handler raised fault {0}")]
    Fault(HandlerFault),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("transaction save folder is not configured")]
    NoTransactionStore,
}

/// What the dispatcher takes back once the handler is done.
#[derive(Debug, Default)]
pub struct ResponseParts {
    pub response: Fragment,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub transaction_id: Option<String>,
}

/// An outbound message detached from the bridge that built it.
#[derive(Debug)]
pub struct PendingSend {
    context: Arc<ConnectorContext>,
    message: Fragment,
}

impl PendingSend {
    /// Sends the message and blocks until the reply arrives.
    ///
    /// # Errors
    ///
    /// A fault reply becomes [`OutboundError::RemoteFault`]; timeouts and
    /// transport failures are returned as well.
    pub fn wait(self) -> Result<Fragment, BridgeError> {
        let Self { context, message } = self;
        Ok(context.runtime.block_on(context.outbound.call(message, true))?)
    }

    /// Sends the message without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Returns [`OutboundError::Transport`] when the bus rejects the request.
    pub fn post(self) -> Result<(), BridgeError> {
        let Self { context, message } = self;
        tracing::debug!(method = message.method_name().unwrap_or(""), "posting request");
        Ok(context.runtime.block_on(context.outbound.send(message))?)
    }
}

/// Request state and response builder for one handler run.
pub struct ExecutionBridge {
    context: Arc<ConnectorContext>,
    request: Fragment,
    response: Fragment,
    response_set: bool,
    response_name: Option<String>,
    response_namespace: Option<String>,
    transaction_id: Option<String>,
    failure: Option<BridgeError>,
}

impl fmt::Debug for ExecutionBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionBridge")
            .field("request", &self.request.method_name())
            .field("response_set", &self.response_set)
            .field("transaction_id", &self.transaction_id)
            .finish_non_exhaustive()
    }
}

impl ExecutionBridge {
    /// A bridge for `request`, which carries the caller's identity.
    #[must_use]
    pub fn new(context: Arc<ConnectorContext>, request: Fragment) -> Self {
        Self {
            context,
            request,
            response: Fragment::new(),
            response_set: false,
            response_name: None,
            response_namespace: None,
            transaction_id: None,
            failure: None,
        }
    }

    #[must_use]
    pub fn into_shared(self) -> SharedBridge {
        Arc::new(Mutex::new(self))
    }

    // -- request --------------------------------------------------------------

    #[must_use]
    pub fn request(&self) -> &Fragment {
        &self.request
    }

    /// The request method element as XML text.
    #[must_use]
    pub fn request_xml(&self) -> String {
        self.request.method_xml().unwrap_or_default()
    }

    #[must_use]
    pub fn request_user(&self) -> Option<&str> {
        self.request.user_dn()
    }

    // -- response -------------------------------------------------------------

    /// Adds the element in `xml` to the response.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Xml`] for malformed input.
    pub fn add_response(&mut self, xml: &str) -> Result<(), BridgeError> {
        self.response.append_method_xml(xml, false)?;
        self.response_set = true;
        Ok(())
    }

    /// Adds the children of the element in `xml` to the response.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Xml`] for malformed input.
    pub fn add_response_children(&mut self, xml: &str) -> Result<(), BridgeError> {
        self.response.append_method_xml(xml, true)?;
        self.response_set = true;
        Ok(())
    }

    /// Replaces everything added so far with the children of `xml`'s root.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Xml`] for malformed input.
    pub fn set_response(&mut self, xml: &str) -> Result<(), BridgeError> {
        self.response.set_method_xml(xml, true)?;
        self.response_set = true;
        Ok(())
    }

    /// Replaces the response with a prepared fragment, such as a message built
    /// with [`create_message`](Self::create_message). Its method children are
    /// merged into the response method.
    pub fn set_response_fragment(&mut self, fragment: Fragment) {
        self.response = fragment;
        self.response_set = true;
    }

    #[must_use]
    pub fn response(&self) -> &Fragment {
        &self.response
    }

    /// True once any response call was made.
    #[must_use]
    pub fn response_set(&self) -> bool {
        self.response_set
    }

    #[must_use]
    pub fn response_name(&self) -> Option<&str> {
        self.response_name.as_deref()
    }

    pub fn set_response_name(&mut self, name: impl Into<String>) {
        self.response_name = Some(name.into()).filter(|n| !n.is_empty());
    }

    #[must_use]
    pub fn response_namespace(&self) -> Option<&str> {
        self.response_namespace.as_deref()
    }

    pub fn set_response_namespace(&mut self, namespace: impl Into<String>) {
        self.response_namespace = Some(namespace.into()).filter(|n| !n.is_empty());
    }

    /// Falls back to the script's own output when no response call was made.
    ///
    /// The return value wins over printed output. Either is added as the
    /// children of its root element.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Xml`] when the chosen output is not XML.
    pub fn resolve_response(&mut self, output: &ScriptOutput) -> Result<(), BridgeError> {
        if self.response_set {
            return Ok(());
        }
        let implicit = match &output.returned {
            Some(value) => Some(value.as_str()),
            None => Some(output.printed.as_str()),
        }
        .map(str::trim)
        .filter(|xml| !xml.is_empty());

        match implicit {
            Some(xml) => self.add_response_children(xml),
            None => Ok(()),
        }
    }

    /// Moves the response out, leaving the bridge with an empty one.
    pub fn take_parts(&mut self) -> ResponseParts {
        ResponseParts {
            response: std::mem::take(&mut self.response),
            name: self.response_name.take(),
            namespace: self.response_namespace.take(),
            transaction_id: self.transaction_id.take(),
        }
    }

    // -- configuration --------------------------------------------------------

    #[must_use]
    pub fn custom_property(&self, name: &str) -> Option<String> {
        self.context.properties.get(name)
    }

    // -- outbound -------------------------------------------------------------

    /// Builds an outbound message from `xml`, addressed as `user` or, without
    /// one, as the caller of this request.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Xml`] for malformed input.
    pub fn create_message(&self, xml: &str, user: Option<&str>) -> Result<Fragment, BridgeError> {
        let mut fragment = Fragment::new();
        fragment.set_method_xml(xml, false)?;
        let user = user.filter(|u| !u.is_empty()).or(self.request.user_dn());
        fragment.set_user_dn(user.map(str::to_string));
        fragment.set_organization_dn(self.request.organization_dn().map(str::to_string));
        Ok(fragment)
    }

    /// Pairs `message` with the connector so it can be sent once the bridge
    /// is no longer borrowed.
    #[must_use]
    pub fn prepare_send(&self, message: Fragment) -> PendingSend {
        PendingSend {
            context: Arc::clone(&self.context),
            message,
        }
    }

    /// Sends `xml` and blocks until the reply arrives; returns the reply's
    /// method element as XML text.
    ///
    /// Without `user` the request is sent as the caller of this request.
    /// Must not be called from an async context.
    ///
    /// # Errors
    ///
    /// A fault reply becomes [`OutboundError::RemoteFault`]; timeouts and
    /// transport failures are returned as well.
    pub fn send_request(&self, xml: &str, user: Option<&str>) -> Result<String, BridgeError> {
        let reply = self.prepare_send(self.create_message(xml, user)?).wait()?;
        Ok(reply.method_xml().unwrap_or_default())
    }

    /// Sends `xml` without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Xml`] for malformed input and
    /// [`OutboundError::Transport`] when the bus rejects the request.
    pub fn post_request(&self, xml: &str, user: Option<&str>) -> Result<(), BridgeError> {
        self.prepare_send(self.create_message(xml, user)?).post()
    }

    /// Schedules `xml` to be sent after `delay`, saving both sides under this
    /// request's transaction id when one is set.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Xml`] for malformed input.
    pub fn schedule_request(
        &self,
        xml: &str,
        user: Option<&str>,
        delay: Duration,
    ) -> Result<(), BridgeError> {
        self.schedule_request_with(xml, user, delay, self.transaction_id.clone(), true, true)
    }

    /// Schedules `xml` with an explicit transaction id and save flags.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Xml`] for malformed input.
    pub fn schedule_request_with(
        &self,
        xml: &str,
        user: Option<&str>,
        delay: Duration,
        transaction_id: Option<String>,
        save_request: bool,
        save_response: bool,
    ) -> Result<(), BridgeError> {
        let request = self.create_message(xml, user)?;
        self.context.scheduler.schedule(ScheduledRequest {
            request,
            delay,
            transaction_id: transaction_id.filter(|id| !id.is_empty()),
            save_request,
            save_response,
        });
        Ok(())
    }

    // -- transactions and faults ----------------------------------------------

    /// Saves the request under `id`. The final response and requests scheduled
    /// afterwards are saved under the same id.
    ///
    /// # Errors
    ///
    /// Fails without a transaction folder, with an empty id, or if the file
    /// cannot be written.
    pub fn save_transaction(&mut self, id: &str) -> Result<(), BridgeError> {
        if id.is_empty() {
            return Err(TransactionError::MissingId.into());
        }
        let store = self
            .context
            .transactions
            .clone()
            .ok_or(BridgeError::NoTransactionStore)?;
        self.transaction_id = Some(id.to_string());
        if let Some(method) = self.request.method_mut() {
            store.write(id, TransactionKind::Request, method)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Builds the error a handler returns to answer with a fault.
    #[must_use]
    pub fn fault(
        code: &str,
        actor: Option<&str>,
        message: &str,
        detail_xml: Option<&str>,
    ) -> BridgeError {
        BridgeError::Fault(HandlerFault {
            code: code.to_string(),
            actor: actor.filter(|a| !a.is_empty()).map(str::to_string),
            message: message.to_string(),
            detail: detail_xml.filter(|d| !d.trim().is_empty()).map(str::to_string),
        })
    }

    /// Keeps a failed bridge call for the engine to report after the script
    /// unwinds.
    pub fn record_failure(&mut self, failure: BridgeError) {
        self.failure = Some(failure);
    }

    pub fn take_failure(&mut self) -> Option<BridgeError> {
        self.failure.take()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
