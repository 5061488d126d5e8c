//! Durable storage for the connector.
//!
//! - [`transactions`]: request/response pairs saved under a transaction id
//!   with a per-id sequence number

pub mod transactions;

pub use transactions::{TransactionError, TransactionKind, TransactionRecord, TransactionStore};
