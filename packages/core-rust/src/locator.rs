//! Operation locators: the `(operation, namespace)` key handlers are bound to.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// One half of a locator: a concrete name or the wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    Any,
    Named(String),
}

impl Selector {
    /// `None` maps to the wildcard.
    #[must_use]
    pub fn from_option(value: Option<&str>) -> Self {
        value.map_or(Selector::Any, |v| Selector::Named(v.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Selector::Any => None,
            Selector::Named(name) => Some(name),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Any => f.write_str("ANY"),
            Selector::Named(name) => f.write_str(name),
        }
    }
}

/// Immutable `(operation, namespace)` key.
///
/// The optional source file is informational: equality and hashing only look
/// at the operation and namespace.
#[derive(Debug, Clone)]
pub struct Locator {
    operation: Selector,
    namespace: Selector,
    source: Option<PathBuf>,
}

impl Locator {
    #[must_use]
    pub fn new(operation: Selector, namespace: Selector) -> Self {
        Self {
            operation,
            namespace,
            source: None,
        }
    }

    /// A fully concrete locator.
    #[must_use]
    pub fn exact(operation: &str, namespace: &str) -> Self {
        Self::new(
            Selector::Named(operation.to_string()),
            Selector::Named(namespace.to_string()),
        )
    }

    /// The global default `(ANY, ANY)`.
    #[must_use]
    pub fn any() -> Self {
        Self::new(Selector::Any, Selector::Any)
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn operation(&self) -> &Selector {
        &self.operation
    }

    #[must_use]
    pub fn namespace(&self) -> &Selector {
        &self.namespace
    }

    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Lookup keys for a request, most specific first:
    /// `(op, ns)`, `(ANY, ns)`, `(op, ANY)`, `(ANY, ANY)`.
    #[must_use]
    pub fn cascade(operation: &str, namespace: &str) -> [Locator; 4] {
        let op = || Selector::Named(operation.to_string());
        let ns = || Selector::Named(namespace.to_string());
        [
            Locator::new(op(), ns()),
            Locator::new(Selector::Any, ns()),
            Locator::new(op(), Selector::Any),
            Locator::any(),
        ]
    }
}

impl PartialEq for Locator {
    fn eq(&self, other: &Self) -> bool {
        self.operation == other.operation && self.namespace == other.namespace
    }
}

impl Eq for Locator {}

impl Hash for Locator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.operation.hash(state);
        self.namespace.hash(state);
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.operation, self.namespace)
    }
}
