//! SOAP 1.1 envelope access.

use crate::namespaces::SOAP_ENVELOPE_NS;
use crate::xml::{Element, XmlError};

/// Errors raised when a document is not a usable envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error("root element <{0}> is not a SOAP envelope")]
    NotAnEnvelope(String),
}

/// Prefix used for envelopes created from scratch.
pub const DEFAULT_ENVELOPE_PREFIX: &str = "SOAP";

/// A SOAP envelope with a header and a body container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    root: Element,
}

impl Envelope {
    /// Creates `<SOAP:Envelope><SOAP:Body/></SOAP:Envelope>`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_prefix(Some(DEFAULT_ENVELOPE_PREFIX))
    }

    /// Creates an empty envelope using `prefix` for the envelope elements.
    #[must_use]
    pub fn with_prefix(prefix: Option<&str>) -> Self {
        let mut root = Element::in_namespace(qualify(prefix, "Envelope"), SOAP_ENVELOPE_NS);
        root.push(envelope_child(prefix, "Body"));
        Self { root }
    }

    /// Creates an envelope whose body holds `method`.
    #[must_use]
    pub fn with_method(method: Element) -> Self {
        let mut envelope = Self::new();
        envelope.with_body(|body| body.push(method));
        envelope
    }

    /// Builds the empty response envelope for a request: same envelope prefix,
    /// body holding `<{Operation}Response xmlns="{namespace}"/>`.
    #[must_use]
    pub fn response_to(request: &Envelope) -> Self {
        let mut envelope = Self::with_prefix(request.prefix());
        if let Some(method) = request.method() {
            let name = format!("{}Response", method.local_name());
            let response = match method.namespace() {
                Some(ns) => Element::in_namespace(name, ns),
                None => Element::new(name),
            };
            envelope.with_body(|body| body.push(response));
        }
        envelope
    }

    /// Parses envelope text.
    ///
    /// # Errors
    ///
    /// Fails if the text is not well-formed XML or the root is not a SOAP envelope.
    pub fn parse(xml: &str) -> Result<Self, EnvelopeError> {
        Self::from_element(Element::parse(xml)?)
    }

    /// Wraps an existing element.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::NotAnEnvelope`] when the root is not
    /// `{SOAP}Envelope`.
    pub fn from_element(root: Element) -> Result<Self, EnvelopeError> {
        if root.is("Envelope", SOAP_ENVELOPE_NS) {
            Ok(Self { root })
        } else {
            Err(EnvelopeError::NotAnEnvelope(root.name().to_string()))
        }
    }

    /// Prefix of the envelope element (e.g. `SOAP`).
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.root.prefix()
    }

    #[must_use]
    pub fn root(&self) -> &Element {
        &self.root
    }

    #[must_use]
    pub fn into_root(self) -> Element {
        self.root
    }

    // -- header -------------------------------------------------------------

    #[must_use]
    pub fn header(&self) -> Option<&Element> {
        self.root.elements().find(|e| e.is("Header", SOAP_ENVELOPE_NS))
    }

    pub fn header_mut(&mut self) -> Option<&mut Element> {
        self.root
            .elements_mut()
            .find(|e| e.is("Header", SOAP_ENVELOPE_NS))
    }

    /// Runs `f` on the header, inserting an empty one before the body first if
    /// the envelope has none.
    pub fn with_header<R>(&mut self, f: impl FnOnce(&mut Element) -> R) -> R {
        if let Some(header) = self.header_mut() {
            return f(header);
        }
        let mut header = envelope_child(self.prefix(), "Header");
        let result = f(&mut header);
        self.root.insert(0, header);
        result
    }

    /// Detaches the header from the envelope.
    pub fn take_header(&mut self) -> Option<Element> {
        let idx = self
            .root
            .children()
            .iter()
            .position(|n| n.as_element().is_some_and(|e| e.is("Header", SOAP_ENVELOPE_NS)))?;
        self.root.remove(idx).into_element()
    }

    // -- body ---------------------------------------------------------------

    #[must_use]
    pub fn body(&self) -> Option<&Element> {
        self.root.elements().find(|e| e.is("Body", SOAP_ENVELOPE_NS))
    }

    pub fn body_mut(&mut self) -> Option<&mut Element> {
        self.root
            .elements_mut()
            .find(|e| e.is("Body", SOAP_ENVELOPE_NS))
    }

    /// Runs `f` on the body container, appending an empty one first if the
    /// envelope has none.
    pub fn with_body<R>(&mut self, f: impl FnOnce(&mut Element) -> R) -> R {
        if let Some(body) = self.body_mut() {
            return f(body);
        }
        let mut body = envelope_child(self.prefix(), "Body");
        let result = f(&mut body);
        self.root.push(body);
        result
    }

    /// First element inside the body: the method (or fault) element.
    #[must_use]
    pub fn method(&self) -> Option<&Element> {
        self.body().and_then(Element::first_element)
    }

    pub fn method_mut(&mut self) -> Option<&mut Element> {
        self.body_mut().and_then(Element::first_element_mut)
    }

    /// Detaches the method element from the body.
    pub fn take_method(&mut self) -> Option<Element> {
        let body = self.body_mut()?;
        let idx = body.first_element_position()?;
        body.remove(idx).into_element()
    }

    /// The body's `Fault` element, when the envelope carries a fault.
    #[must_use]
    pub fn fault(&self) -> Option<&Element> {
        self.method().filter(|m| m.is("Fault", SOAP_ENVELOPE_NS))
    }

    #[must_use]
    pub fn to_xml(&self) -> String {
        self.root.to_xml()
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

fn qualify(prefix: Option<&str>, local: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{local}"),
        None => local.to_string(),
    }
}

fn envelope_child(prefix: Option<&str>, local: &str) -> Element {
    let mut el = Element::new(qualify(prefix, local));
    el.set_namespace(Some(SOAP_ENVELOPE_NS.to_string()));
    el
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
