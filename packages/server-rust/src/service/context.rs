//! Connector-wide state shared by every request.

use std::sync::Arc;

use tokio::runtime::Handle;

use super::config::{ConfigError, ConnectorConfig};
use super::outbound::OutboundClient;
use super::properties::CustomProperties;
use super::scheduler::DelayedDispatcher;
use crate::storage::transactions::TransactionStore;
use crate::traits::Transport;

/// Services available to handlers and the dispatcher.
///
/// Built once per connector and shared behind an `Arc`.
#[derive(Debug)]
pub struct ConnectorContext {
    pub config: ConnectorConfig,
    pub outbound: OutboundClient,
    pub scheduler: DelayedDispatcher,
    /// `None` when no transaction folder is configured.
    pub transactions: Option<Arc<TransactionStore>>,
    pub properties: CustomProperties,
    /// Runtime used to drive outbound calls made from blocking handler threads.
    pub runtime: Handle,
}

impl ConnectorContext {
    /// Wires the context from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the custom property file cannot be read.
    pub fn new(
        config: ConnectorConfig,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        let properties = match &config.custom_property_file {
            Some(path) => CustomProperties::load(path, config.reload_check_interval)?,
            None => CustomProperties::empty(),
        };
        let transactions = config.transaction_dir.as_ref().map(|dir| {
            Arc::new(TransactionStore::new(
                dir.clone(),
                config.max_files_per_transaction,
            ))
        });
        let outbound = OutboundClient::new(transport, config.request_timeout);
        let scheduler = DelayedDispatcher::new(outbound.clone(), transactions.clone(), runtime.clone());

        Ok(Self {
            config,
            outbound,
            scheduler,
            transactions,
            properties,
            runtime,
        })
    }
}
