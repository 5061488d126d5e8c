//! Pending header/body fragments and their merge into destination envelopes.
//!
//! A [`Fragment`] owns the header and method subtrees it was given. Reading from
//! an envelope detaches them from the source; writing into an envelope moves
//! them into the destination and leaves the fragment without them, so a subtree
//! is only ever linked into one tree.

use std::fmt;

use crate::envelope::Envelope;
use crate::namespaces::{clean_namespaces, strip_envelope_namespace};
use crate::xml::{Element, Node, XmlError};

/// Header entries added by the message bus itself; dropped on read.
pub const BUS_HEADER_NS: &str = "http://schemas.cordys.com/General/1.0/";
/// WS-I18N header namespace; dropped on read.
pub const I18N_HEADER_NS: &str = "http://www.w3.org/2005/09/ws-i18n";

/// Name of the synthetic container used when a response is built from pieces.
const SYNTHETIC_ROOT: &str = "root";

/// How the method subtree is merged into a destination body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// The fragment's method element replaces the destination's.
    #[default]
    Replace,
    /// Only the children of the fragment's method element are merged.
    MergeChildren,
    /// The source had no method: delete the destination's on write.
    DeleteOnly,
}

/// A detached header and method pair awaiting merge into an envelope.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    header: Option<Element>,
    method: Option<Element>,
    policy: MergePolicy,
    envelope_prefix: Option<String>,
    user_dn: Option<String>,
    organization_dn: Option<String>,
}

impl Fragment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fragment holding `method` with the replace policy.
    #[must_use]
    pub fn from_method(method: Element) -> Self {
        Self {
            method: Some(method),
            ..Self::default()
        }
    }

    /// Drops everything the fragment holds, identity fields excepted.
    pub fn clear(&mut self) {
        self.header = None;
        self.method = None;
        self.policy = MergePolicy::Replace;
        self.envelope_prefix = None;
    }

    /// Lifts the header and method out of `envelope`.
    ///
    /// Standard bus headers are discarded and the envelope namespace binding is
    /// stripped from the method element. An envelope without a method switches
    /// the fragment to [`MergePolicy::DeleteOnly`].
    pub fn read_from(&mut self, envelope: &mut Envelope) {
        self.clear();
        self.envelope_prefix = envelope.prefix().map(str::to_string);

        if let Some(mut header) = envelope.take_header() {
            header.remove_elements_where(|e| {
                e.is("header", BUS_HEADER_NS) || e.is("international", I18N_HEADER_NS)
            });
            self.header = Some(header);
        }

        match envelope.take_method() {
            Some(mut method) => {
                strip_envelope_namespace(&mut method);
                self.method = Some(method);
                self.policy = MergePolicy::Replace;
            }
            None => self.policy = MergePolicy::DeleteOnly,
        }
    }

    /// Moves the fragment's content into `destination`.
    ///
    /// Header children are appended to the destination header (created when
    /// missing). The method is merged according to the policy; replacement only
    /// happens when `allow_replace` is set, otherwise children are merged. When
    /// merging children the attributes of the fragment's method element are not
    /// carried over.
    pub fn write_to(&mut self, destination: &mut Envelope, allow_replace: bool) {
        if let Some(header) = self.header.take() {
            destination.with_header(|target| append_stripped(target, header.into_children()));
        }

        let method = self.method.take();
        let policy = self.policy;
        destination.with_body(|body| merge_method(body, method, policy, allow_replace));
    }

    /// Parses `xml` and adds it to the method subtree.
    ///
    /// The first call on an empty fragment creates a synthetic container and
    /// switches to [`MergePolicy::MergeChildren`]. With `add_children` only the
    /// children of the parsed root are added, starting at its first element.
    /// Blank input is ignored.
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed XML; the fragment is left unchanged.
    pub fn append_method_xml(&mut self, xml: &str, add_children: bool) -> Result<(), XmlError> {
        if xml.is_empty() {
            return Ok(());
        }
        let mut parsed = Element::parse(xml)?;

        if self.method.is_none() {
            self.policy = MergePolicy::MergeChildren;
        }
        let method = self
            .method
            .get_or_insert_with(|| Element::new(SYNTHETIC_ROOT));

        if add_children {
            let start = parsed.first_element_position().unwrap_or(usize::MAX);
            for node in parsed.take_children().into_iter().skip(start) {
                method.push(node);
            }
        } else {
            method.push(parsed);
        }
        Ok(())
    }

    /// Replaces the method subtree with parsed `xml` (blank clears it).
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed XML; the fragment is left unchanged.
    pub fn set_method_xml(&mut self, xml: &str, add_children: bool) -> Result<(), XmlError> {
        let method = if xml.is_empty() {
            None
        } else {
            Some(Element::parse(xml)?)
        };
        self.method = method;
        self.policy = if add_children {
            MergePolicy::MergeChildren
        } else {
            MergePolicy::Replace
        };
        Ok(())
    }

    /// Replaces the header subtree with parsed `xml` (blank clears it).
    ///
    /// # Errors
    ///
    /// Returns the parse error for malformed XML; the fragment is left unchanged.
    pub fn set_header_xml(&mut self, xml: &str) -> Result<(), XmlError> {
        self.header = if xml.is_empty() {
            None
        } else {
            Some(Element::parse(xml)?)
        };
        Ok(())
    }

    /// Replaces the method subtree with an element.
    pub fn set_method(&mut self, method: Element, policy: MergePolicy) {
        self.method = Some(method);
        self.policy = policy;
    }

    /// Detaches the method subtree.
    pub fn take_method(&mut self) -> Option<Element> {
        self.method.take()
    }

    /// Strips namespaces from every element child of the method subtree.
    pub fn remove_child_element_namespaces(&mut self, ignore_uris: &[&str]) {
        if let Some(method) = &mut self.method {
            for child in method.elements_mut() {
                clean_namespaces(child, ignore_uris, false);
            }
        }
    }

    // -- accessors ----------------------------------------------------------

    #[must_use]
    pub fn header(&self) -> Option<&Element> {
        self.header.as_ref()
    }

    #[must_use]
    pub fn method(&self) -> Option<&Element> {
        self.method.as_ref()
    }

    pub fn method_mut(&mut self) -> Option<&mut Element> {
        self.method.as_mut()
    }

    #[must_use]
    pub fn header_xml(&self) -> Option<String> {
        self.header.as_ref().map(Element::to_xml)
    }

    #[must_use]
    pub fn method_xml(&self) -> Option<String> {
        self.method.as_ref().map(Element::to_xml)
    }

    /// Local name of the method element.
    #[must_use]
    pub fn method_name(&self) -> Option<&str> {
        self.method.as_ref().map(Element::local_name)
    }

    #[must_use]
    pub fn method_namespace(&self) -> Option<&str> {
        self.method.as_ref().and_then(Element::namespace)
    }

    #[must_use]
    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    #[must_use]
    pub fn envelope_prefix(&self) -> Option<&str> {
        self.envelope_prefix.as_deref()
    }

    pub fn set_envelope_prefix(&mut self, prefix: Option<String>) {
        self.envelope_prefix = prefix;
    }

    #[must_use]
    pub fn user_dn(&self) -> Option<&str> {
        self.user_dn.as_deref()
    }

    pub fn set_user_dn(&mut self, dn: Option<String>) {
        self.user_dn = dn;
    }

    #[must_use]
    pub fn organization_dn(&self) -> Option<&str> {
        self.organization_dn.as_deref()
    }

    pub fn set_organization_dn(&mut self, dn: Option<String>) {
        self.organization_dn = dn;
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dn) = &self.user_dn {
            writeln!(f, "User DN: {dn}")?;
        }
        if let Some(dn) = &self.organization_dn {
            writeln!(f, "Organization DN: {dn}")?;
        }
        if let Some(header) = &self.header {
            write!(f, "SOAP Header XML: {}", header.to_pretty_xml())?;
        }
        if let Some(method) = &self.method {
            write!(f, "SOAP Method XML: {}", method.to_pretty_xml())?;
        }
        Ok(())
    }
}

fn merge_method(body: &mut Element, method: Option<Element>, policy: MergePolicy, allow_replace: bool) {
    let existing = body.first_element_position();

    match (method, existing) {
        (Some(method), None) => {
            if policy == MergePolicy::MergeChildren {
                append_stripped(body, method.into_children());
            } else {
                append_stripped(body, vec![Node::Element(method)]);
            }
        }
        (Some(mut method), Some(idx)) if policy == MergePolicy::Replace && allow_replace => {
            strip_envelope_namespace(&mut method);
            body.insert(idx, method);
            body.remove(idx + 1);
        }
        (Some(method), Some(idx)) => {
            if let Some(target) = body.children_mut()[idx].as_element_mut() {
                append_stripped(target, method.into_children());
            }
        }
        (None, Some(idx)) if policy == MergePolicy::DeleteOnly => {
            body.remove(idx);
        }
        (None, _) => {}
    }
}

fn append_stripped(parent: &mut Element, nodes: Vec<Node>) {
    for mut node in nodes {
        if let Node::Element(el) = &mut node {
            strip_envelope_namespace(el);
        }
        parent.push(node);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
