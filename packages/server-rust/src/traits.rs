use async_trait::async_trait;
use scriptgate_core::Envelope;

/// An outbound request envelope and the identity it is sent under.
#[derive(Debug, Clone, Default)]
pub struct OutboundRequest {
    pub envelope: Envelope,
    pub user_dn: Option<String>,
    pub organization_dn: Option<String>,
}

/// Message bus connection used for outbound requests.
///
/// Implementations deliver a request envelope to the addressed service and,
/// for the synchronous call, hand back the reply envelope. Timeouts are applied
/// by the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and waits for the reply envelope.
    async fn send_and_wait(&self, request: OutboundRequest) -> anyhow::Result<Envelope>;

    /// Sends `request` without waiting for a reply.
    async fn send(&self, request: OutboundRequest) -> anyhow::Result<()>;
}

/// Source of interface documents referenced by `import` elements.
#[async_trait]
pub trait InterfaceSource: Send + Sync {
    /// Fetches the interface document published at `location`, if any.
    async fn fetch(&self, location: &str) -> anyhow::Result<Option<String>>;
}

/// Transport for deployments without a bus connection: every send fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisconnectedTransport;

#[async_trait]
impl Transport for DisconnectedTransport {
    async fn send_and_wait(&self, _request: OutboundRequest) -> anyhow::Result<Envelope> {
        anyhow::bail!("no message bus connection is configured")
    }

    async fn send(&self, _request: OutboundRequest) -> anyhow::Result<()> {
        anyhow::bail!("no message bus connection is configured")
    }
}

/// Interface source that resolves no imports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoImports;

#[async_trait]
impl InterfaceSource for NoImports {
    async fn fetch(&self, _location: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}
