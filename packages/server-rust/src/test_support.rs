//! Test doubles shared by unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use scriptgate_core::Envelope;

use crate::traits::{InterfaceSource, OutboundRequest, Transport};

type Reply = Box<dyn Fn(&OutboundRequest) -> anyhow::Result<Envelope> + Send + Sync>;

/// Transport that records every request and answers through a closure.
pub(crate) struct ScriptedTransport {
    reply: Option<Reply>,
    sent: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn replying<F>(reply: F) -> Arc<Self>
    where
        F: Fn(&OutboundRequest) -> anyhow::Result<Envelope> + Send + Sync + 'static,
    {
        Arc::new(Self {
            reply: Some(Box::new(reply)),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Echoes the request method back inside the reply.
    pub(crate) fn echo() -> Arc<Self> {
        Self::replying(|req| Ok(req.envelope.clone()))
    }

    /// Never answers synchronous calls.
    pub(crate) fn hanging() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_and_wait(&self, request: OutboundRequest) -> anyhow::Result<Envelope> {
        self.sent.lock().push(request.clone());
        match &self.reply {
            Some(reply) => reply(&request),
            None => std::future::pending().await,
        }
    }

    async fn send(&self, request: OutboundRequest) -> anyhow::Result<()> {
        self.sent.lock().push(request);
        Ok(())
    }
}

/// Interface source backed by a fixed list of documents.
pub(crate) struct StaticInterfaces {
    documents: Vec<(String, String)>,
    fetches: Mutex<Vec<String>>,
}

impl StaticInterfaces {
    pub(crate) fn new(documents: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            documents: documents
                .iter()
                .map(|(loc, doc)| ((*loc).to_string(), (*doc).to_string()))
                .collect(),
            fetches: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn fetches(&self) -> Vec<String> {
        self.fetches.lock().clone()
    }
}

#[async_trait]
impl InterfaceSource for StaticInterfaces {
    async fn fetch(&self, location: &str) -> anyhow::Result<Option<String>> {
        self.fetches.lock().push(location.to_string());
        Ok(self
            .documents
            .iter()
            .find(|(loc, _)| loc == location)
            .map(|(_, doc)| doc.clone()))
    }
}
