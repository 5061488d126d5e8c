//! Built-in methods served from the transaction store instead of a handler.
//!
//! An operation opts in through its implementation payload:
//!
//! ```xml
//! <implementation type="SCRIPT">
//!   <action>GetSavedSoapTransactions</action>
//! </implementation>
//! ```
//!
//! Both methods read the transaction identifier from the request's
//! `TransactionId` child. Listing accepts `*` and `?` wildcards.

use scriptgate_core::Element;

use super::operation::DispatchError;
use crate::storage::transactions::{TransactionError, TransactionStore};

/// A method the dispatcher answers itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinMethod {
    GetSavedTransactions,
    DeleteSavedTransactions,
}

impl BuiltinMethod {
    pub const GET_ACTION: &'static str = "GetSavedSoapTransactions";
    pub const DELETE_ACTION: &'static str = "DeleteSavedSoapTransactions";

    /// Reads the `action` child of an implementation payload.
    #[must_use]
    pub fn from_implementation(implementation: Option<&str>) -> Option<Self> {
        let text = implementation.filter(|i| !i.trim().is_empty())?;
        let root = match Element::parse(text) {
            Ok(root) => root,
            Err(err) => {
                tracing::debug!(error = %err, "implementation payload is not XML");
                return None;
            }
        };
        match root.child("action").map(Element::text)?.trim() {
            Self::GET_ACTION => Some(Self::GetSavedTransactions),
            Self::DELETE_ACTION => Some(Self::DeleteSavedTransactions),
            _ => None,
        }
    }

    #[must_use]
    pub fn action(self) -> &'static str {
        match self {
            Self::GetSavedTransactions => Self::GET_ACTION,
            Self::DeleteSavedTransactions => Self::DELETE_ACTION,
        }
    }

    /// Serves the method for `request`, writing results into `response`.
    ///
    /// # Errors
    ///
    /// Fails when no store is configured, the identifier is missing, or the
    /// store cannot be read.
    pub fn execute(
        self,
        store: Option<&TransactionStore>,
        request: &Element,
        response: &mut Element,
    ) -> Result<(), DispatchError> {
        let store = store.ok_or(DispatchError::NoTransactionStore)?;
        let id = request
            .child("TransactionId")
            .map(Element::text)
            .filter(|id| !id.trim().is_empty())
            .ok_or(TransactionError::MissingId)?;
        let id = id.trim();

        match self {
            Self::GetSavedTransactions => {
                let records = store.list(id)?;
                tracing::debug!(pattern = id, count = records.len(), "listing saved transactions");
                for record in &records {
                    response.push(record.to_element());
                }
            }
            Self::DeleteSavedTransactions => {
                let removed = store.delete(id)?;
                tracing::info!(transaction = id, removed, "deleted saved transactions");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::transactions::TransactionKind;

    fn request(id: &str) -> Element {
        Element::parse(&format!(
            "<GetSavedSoapTransactions xmlns=\"urn:t\"><TransactionId>{id}</TransactionId></GetSavedSoapTransactions>"
        ))
        .unwrap()
    }

    #[test]
    fn recognises_actions() {
        assert_eq!(
            BuiltinMethod::from_implementation(Some(
                "<implementation type=\"SCRIPT\"><action>GetSavedSoapTransactions</action></implementation>"
            )),
            Some(BuiltinMethod::GetSavedTransactions)
        );
        assert_eq!(
            BuiltinMethod::from_implementation(Some(
                "<implementation><action> DeleteSavedSoapTransactions </action></implementation>"
            )),
            Some(BuiltinMethod::DeleteSavedTransactions)
        );
        assert_eq!(BuiltinMethod::from_implementation(Some("<implementation/>")), None);
        assert_eq!(BuiltinMethod::from_implementation(Some("not xml")), None);
        assert_eq!(BuiltinMethod::from_implementation(None), None);
    }

    #[test]
    fn lists_saved_transactions_into_response() {
        let dir = tempfile::tempdir().unwrap();
        let store = TransactionStore::new(dir.path(), 10);
        store
            .write("T1", TransactionKind::Request, &mut Element::parse("<Ping/>").unwrap())
            .unwrap();
        store
            .write("T1", TransactionKind::Response, &mut Element::parse("<Pong/>").unwrap())
            .unwrap();

        let mut response = Element::new("GetSavedSoapTransactionsResponse");
        BuiltinMethod::GetSavedTransactions
            .execute(Some(&store), &request("T*"), &mut response)
            .unwrap();

        let txn = response.child("transaction").unwrap();
        assert_eq!(txn.attribute("id"), Some("1"));
        assert_eq!(txn.attribute("name"), Some("T1"));
        assert!(txn.find_path("request/Ping").is_some());
        assert!(txn.find_path("response/Pong").is_some());
    }

    #[test]
    fn deletes_saved_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let store = TransactionStore::new(dir.path(), 10);
        store
            .write("T1", TransactionKind::Request, &mut Element::parse("<Ping/>").unwrap())
            .unwrap();

        let mut response = Element::new("DeleteSavedSoapTransactionsResponse");
        BuiltinMethod::DeleteSavedTransactions
            .execute(Some(&store), &request("T1"), &mut response)
            .unwrap();
        assert!(store.list("T1").unwrap().is_empty());
    }

    #[test]
    fn requires_store_and_identifier() {
        let mut response = Element::new("R");
        assert!(matches!(
            BuiltinMethod::GetSavedTransactions.execute(None, &request("T1"), &mut response),
            Err(DispatchError::NoTransactionStore)
        ));

        let dir = tempfile::tempdir().unwrap();
        let store = TransactionStore::new(dir.path(), 10);
        assert!(matches!(
            BuiltinMethod::DeleteSavedTransactions.execute(Some(&store), &request(" "), &mut response),
            Err(DispatchError::Transaction(TransactionError::MissingId))
        ));
    }
}
