//! Structured SOAP faults.

use crate::namespaces::SOAP_ENVELOPE_NS;
use crate::xml::Element;

/// A SOAP 1.1 fault: code, optional actor, message and optional detail payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: String,
    pub actor: Option<String>,
    pub message: String,
    pub detail: Option<Element>,
}

impl Fault {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            actor: None,
            message: message.into(),
            detail: None,
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Element) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Reads a `Fault` element. Returns `None` for anything else.
    #[must_use]
    pub fn from_element(el: &Element) -> Option<Self> {
        if !el.is("Fault", SOAP_ENVELOPE_NS) {
            return None;
        }
        let text = |local: &str| el.child(local).map(Element::text);
        Some(Self {
            code: text("faultcode").unwrap_or_default(),
            actor: text("faultactor").filter(|a| !a.is_empty()),
            message: text("faultstring").unwrap_or_default(),
            detail: el
                .child("detail")
                .and_then(Element::first_element)
                .cloned(),
        })
    }

    /// Builds `<{prefix}:Fault>` with the standard child elements.
    ///
    /// The detail payload is wrapped in a `<detail>` element.
    #[must_use]
    pub fn to_element(&self, envelope_prefix: Option<&str>) -> Element {
        let name = match envelope_prefix {
            Some(prefix) => format!("{prefix}:Fault"),
            None => "Fault".to_string(),
        };
        let mut fault = Element::in_namespace(name, SOAP_ENVELOPE_NS);

        fault.push(text_element("faultcode", &self.code));
        fault.push(text_element("faultstring", &self.message));
        if let Some(actor) = &self.actor {
            fault.push(text_element("faultactor", actor));
        }
        if let Some(detail) = &self.detail {
            let mut wrapper = Element::new("detail");
            wrapper.push(detail.clone());
            fault.push(wrapper);
        }
        fault
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

fn text_element(name: &str, text: &str) -> Element {
    let mut el = Element::new(name);
    el.set_text(text);
    el
}
