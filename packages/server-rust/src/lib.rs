//! Scriptgate Server: routes SOAP requests to script handlers, forwards
//! requests to other services and records saved transactions.

pub mod scripting;
pub mod service;
pub mod storage;
pub mod traits;

#[cfg(test)]
mod test_support;

pub use service::{Dispatcher, InboundRequest};
pub use traits::{InterfaceSource, Transport};
