//! Scriptgate Core: owned XML tree, SOAP envelopes, fragment assembly and locators.

pub mod context;
pub mod envelope;
pub mod fault;
pub mod fragment;
pub mod locator;
pub mod namespaces;
pub mod xml;

pub use context::RequestMetadata;
pub use envelope::{Envelope, EnvelopeError};
pub use fault::Fault;
pub use fragment::{Fragment, MergePolicy};
pub use locator::{Locator, Selector};
pub use namespaces::{clean_namespaces, strip_envelope_namespace, SOAP_ENVELOPE_NS};
pub use xml::{escape_text, Attribute, Element, Node, XmlError};
