//! Namespace hygiene for subtrees that move between envelopes.
//!
//! A subtree lifted out of one envelope keeps whatever `xmlns` declarations it
//! carried. Re-inserting it elsewhere would leak those bindings, so every hop
//! through the assembler strips the envelope binding, and callers that want a
//! fully namespace-free payload can run [`clean_namespaces`].

use crate::xml::{Element, Node};

/// Namespace of the SOAP 1.1 envelope.
pub const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// Removes declarations bound to [`SOAP_ENVELOPE_NS`] from `element` only.
///
/// Descendants are left alone: the envelope binding is only ever redeclared on
/// the top of a moved subtree.
pub fn strip_envelope_namespace(element: &mut Element) {
    element.retain_attributes(|a| !(a.is_namespace_declaration() && a.value == SOAP_ENVELOPE_NS));
}

/// Recursively strips namespace declarations and element prefixes.
///
/// Declarations whose URI is in `ignore_uris` survive, and so does the prefix of
/// any element whose own namespace is in `ignore_uris`. With `remove_whitespace`
/// set, whitespace-only text nodes are dropped as well. Running this twice has
/// the same effect as running it once.
pub fn clean_namespaces(element: &mut Element, ignore_uris: &[&str], remove_whitespace: bool) {
    let ignored = |uri: &str| ignore_uris.iter().any(|ignore| *ignore == uri);

    element.retain_attributes(|a| !a.is_namespace_declaration() || ignored(a.value.as_str()));

    if remove_whitespace {
        element.children_mut().retain(|n| !n.is_whitespace());
    }

    for child in element.children_mut() {
        if let Node::Element(inner) = child {
            clean_namespaces(inner, ignore_uris, remove_whitespace);
        }
    }

    if element.prefix().is_some() && !element.namespace().is_some_and(ignored) {
        let local = element.local_name().to_string();
        element.set_name(local);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
