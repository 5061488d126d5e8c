//! Outbound requests to other services on the bus.

use std::sync::Arc;
use std::time::Duration;

use scriptgate_core::{Element, Envelope, Fault, Fragment, SOAP_ENVELOPE_NS};

use crate::traits::{OutboundRequest, Transport};

/// A fault returned by the service that was called.
#[derive(Debug, Clone)]
pub struct RemoteFault {
    pub fault: Fault,
    /// The fault element as received, with the envelope prefix declared on it.
    pub element: Element,
}

/// Errors from an outbound call.
#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote fault {}", .0.fault)]
    RemoteFault(Box<RemoteFault>),

    #[error("transport failure: {0:#}")]
    Transport(anyhow::Error),
}

/// Sends fragments over a [`Transport`] with a fixed timeout.
#[derive(Clone)]
pub struct OutboundClient {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl std::fmt::Debug for OutboundClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OutboundClient {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends `request` and waits for the reply.
    ///
    /// With `check_fault` a fault reply becomes [`OutboundError::RemoteFault`];
    /// without it the fault is returned as the reply's method element.
    ///
    /// # Errors
    ///
    /// Returns [`OutboundError::Timeout`] when no reply arrives in time (any
    /// partial reply is discarded) and [`OutboundError::Transport`] when the
    /// bus rejects the request.
    pub async fn call(&self, request: Fragment, check_fault: bool) -> Result<Fragment, OutboundError> {
        let outbound = into_outbound(request);
        let mut reply = tokio::time::timeout(self.timeout, self.transport.send_and_wait(outbound))
            .await
            .map_err(|_| OutboundError::Timeout(self.timeout))?
            .map_err(OutboundError::Transport)?;

        if check_fault {
            if let Some(element) = reply.fault() {
                let mut element = element.clone();
                declare_envelope_prefix(&mut element);
                let fault = Fault::from_element(&element)
                    .unwrap_or_else(|| Fault::new("Server", "unreadable fault"));
                return Err(OutboundError::RemoteFault(Box::new(RemoteFault { fault, element })));
            }
        }

        let mut response = Fragment::new();
        response.read_from(&mut reply);
        Ok(response)
    }

    /// Sends `request` without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Returns [`OutboundError::Transport`] when the bus rejects the request.
    pub async fn send(&self, request: Fragment) -> Result<(), OutboundError> {
        self.transport
            .send(into_outbound(request))
            .await
            .map_err(OutboundError::Transport)
    }
}

fn into_outbound(mut request: Fragment) -> OutboundRequest {
    let mut envelope = match request.envelope_prefix() {
        Some(prefix) => Envelope::with_prefix(Some(prefix)),
        None => Envelope::new(),
    };
    let user_dn = request.user_dn().map(str::to_string);
    let organization_dn = request.organization_dn().map(str::to_string);
    request.write_to(&mut envelope, true);
    OutboundRequest {
        envelope,
        user_dn,
        organization_dn,
    }
}

/// Declares the envelope namespace for the element's prefix when the element
/// uses it without declaring it itself.
pub(crate) fn declare_envelope_prefix(element: &mut Element) {
    if element.namespace() != Some(SOAP_ENVELOPE_NS) {
        return;
    }
    let Some(prefix) = element.prefix().map(str::to_string) else {
        return;
    };
    if element.declared_namespace(Some(&prefix)).is_none() {
        element.set_attribute(format!("xmlns:{prefix}"), SOAP_ENVELOPE_NS);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
