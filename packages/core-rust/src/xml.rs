//! Owned XML tree with move semantics.
//!
//! Every node has exactly one owner. Detaching a child hands it back by value and
//! appending consumes it, so a subtree can never be linked into two places at once
//! and a detached node cannot be reached through its former parent.
//!
//! Namespace declarations are kept as ordinary `xmlns` / `xmlns:p` attributes, the
//! way a DOM exposes them. Each element additionally records the namespace URI it
//! was bound to when it was parsed or created; renaming or moving the element does
//! not change that URI.

use std::fmt;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while parsing XML text.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("malformed XML: {0}")]
    Parse(#[from] roxmltree::Error),

    #[error("XML text is empty")]
    Empty,
}

// ---------------------------------------------------------------------------
// Node / Attribute
// ---------------------------------------------------------------------------

/// A child of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
}

impl Node {
    /// Returns the element if this node is one.
    #[must_use]
    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(el) => Some(el),
            _ => None,
        }
    }

    /// Mutable variant of [`Node::as_element`].
    pub fn as_element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Node::Element(el) => Some(el),
            _ => None,
        }
    }

    /// Consumes the node, returning the element if it is one.
    #[must_use]
    pub fn into_element(self) -> Option<Element> {
        match self {
            Node::Element(el) => Some(el),
            _ => None,
        }
    }

    /// True for text nodes made up of whitespace only.
    #[must_use]
    pub fn is_whitespace(&self) -> bool {
        matches!(self, Node::Text(text) if text.chars().all(char::is_whitespace))
    }
}

impl From<Element> for Node {
    fn from(el: Element) -> Self {
        Node::Element(el)
    }
}

/// A single attribute, stored under its qualified name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl Attribute {
    /// True when this attribute declares a namespace binding (`xmlns` or `xmlns:p`).
    #[must_use]
    pub fn is_namespace_declaration(&self) -> bool {
        self.name == "xmlns" || self.name.starts_with("xmlns:")
    }

    /// Prefix bound by this declaration: `Some(None)` for the default namespace,
    /// `Some(Some(p))` for `xmlns:p`, `None` when this is not a declaration.
    #[must_use]
    pub fn declared_prefix(&self) -> Option<Option<&str>> {
        if self.name == "xmlns" {
            Some(None)
        } else {
            self.name.strip_prefix("xmlns:").map(Some)
        }
    }
}

// ---------------------------------------------------------------------------
// Element
// ---------------------------------------------------------------------------

/// An element with its qualified name, attributes and owned children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    namespace: Option<String>,
    attributes: Vec<Attribute>,
    children: Vec<Node>,
}

impl Element {
    /// Creates an element with no namespace.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Creates an element bound to `uri` and declares the binding for the
    /// element's own prefix (or the default namespace when it has none).
    #[must_use]
    pub fn in_namespace(name: impl Into<String>, uri: impl Into<String>) -> Self {
        let mut el = Self::new(name);
        let uri = uri.into();
        let decl = match el.prefix() {
            Some(prefix) => format!("xmlns:{prefix}"),
            None => "xmlns".to_string(),
        };
        el.set_attribute(decl, uri.clone());
        el.namespace = Some(uri);
        el
    }

    /// Parses XML text into its root element.
    ///
    /// # Errors
    ///
    /// Returns [`XmlError::Empty`] for blank input and [`XmlError::Parse`] for
    /// malformed documents.
    pub fn parse(xml: &str) -> Result<Self, XmlError> {
        if xml.trim().is_empty() {
            return Err(XmlError::Empty);
        }
        let doc = roxmltree::Document::parse(xml)?;
        Ok(convert(xml, doc.root_element()))
    }

    // -- naming -------------------------------------------------------------

    /// Qualified name, including the prefix if any.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    #[must_use]
    pub fn local_name(&self) -> &str {
        self.name
            .split_once(':')
            .map_or(self.name.as_str(), |(_, local)| local)
    }

    /// Namespace URI the element was bound to when created or parsed.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_namespace(&mut self, uri: Option<String>) {
        self.namespace = uri;
    }

    /// True when the local name and namespace URI both match.
    #[must_use]
    pub fn is(&self, local: &str, namespace: &str) -> bool {
        self.local_name() == local && self.namespace() == Some(namespace)
    }

    // -- attributes ---------------------------------------------------------

    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Sets an attribute, replacing the value of an existing one with the same name.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.value = value,
            None => self.attributes.push(Attribute { name, value }),
        }
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        let idx = self.attributes.iter().position(|a| a.name == name)?;
        Some(self.attributes.remove(idx).value)
    }

    pub fn retain_attributes(&mut self, f: impl FnMut(&Attribute) -> bool) {
        self.attributes.retain(f);
    }

    /// Looks up a namespace binding declared on this element itself.
    #[must_use]
    pub fn declared_namespace(&self, prefix: Option<&str>) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.declared_prefix() == Some(prefix))
            .map(|a| a.value.as_str())
    }

    // -- children -----------------------------------------------------------

    #[must_use]
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<Node> {
        &mut self.children
    }

    /// Element children in document order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(Node::as_element)
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(Node::as_element_mut)
    }

    #[must_use]
    pub fn first_element(&self) -> Option<&Element> {
        self.elements().next()
    }

    pub fn first_element_mut(&mut self) -> Option<&mut Element> {
        self.elements_mut().next()
    }

    /// Index of the first element child within [`Element::children`].
    #[must_use]
    pub fn first_element_position(&self) -> Option<usize> {
        self.children
            .iter()
            .position(|n| matches!(n, Node::Element(_)))
    }

    /// First element child with the given local name.
    #[must_use]
    pub fn child(&self, local: &str) -> Option<&Element> {
        self.elements().find(|e| e.local_name() == local)
    }

    pub fn child_mut(&mut self, local: &str) -> Option<&mut Element> {
        self.elements_mut().find(|e| e.local_name() == local)
    }

    /// Follows a `/`-separated path of local names.
    #[must_use]
    pub fn find_path(&self, path: &str) -> Option<&Element> {
        path.split('/')
            .filter(|step| !step.is_empty())
            .try_fold(self, |el, step| el.child(step))
    }

    pub fn push(&mut self, node: impl Into<Node>) {
        self.children.push(node.into());
    }

    pub fn insert(&mut self, index: usize, node: impl Into<Node>) {
        self.children.insert(index, node.into());
    }

    /// Detaches the child at `index` and returns it.
    pub fn remove(&mut self, index: usize) -> Node {
        self.children.remove(index)
    }

    /// Detaches every child, leaving the element empty.
    pub fn take_children(&mut self) -> Vec<Node> {
        std::mem::take(&mut self.children)
    }

    #[must_use]
    pub fn into_children(self) -> Vec<Node> {
        self.children
    }

    /// Removes element children matching `pred`, returning how many went.
    pub fn remove_elements_where(&mut self, mut pred: impl FnMut(&Element) -> bool) -> usize {
        let before = self.children.len();
        self.children
            .retain(|n| !matches!(n, Node::Element(el) if pred(el)));
        before - self.children.len()
    }

    /// Concatenated text of all descendant text nodes.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }

    /// Replaces all children with a single text node.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children = vec![Node::Text(text.into())];
    }

    // -- output -------------------------------------------------------------

    /// Compact serialization, no whitespace added.
    #[must_use]
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        write_element(self, &mut out, None);
        out
    }

    /// Indented serialization. Whitespace-only text is dropped from
    /// element-only content.
    #[must_use]
    pub fn to_pretty_xml(&self) -> String {
        let mut out = String::new();
        write_element(self, &mut out, Some(0));
        out.push('\n');
        out
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn convert(source: &str, node: roxmltree::Node<'_, '_>) -> Element {
    let mut attributes = Vec::new();

    let parent = node.parent_element();
    for ns in node.namespaces() {
        if ns.name() == Some("xml") {
            continue;
        }
        let inherited = parent.is_some_and(|p| {
            p.namespaces()
                .any(|other| other.name() == ns.name() && other.uri() == ns.uri())
        });
        if !inherited {
            let name = match ns.name() {
                Some(prefix) => format!("xmlns:{prefix}"),
                None => "xmlns".to_string(),
            };
            attributes.push(Attribute {
                name,
                value: ns.uri().to_string(),
            });
        }
    }

    for attr in node.attributes() {
        let name = match attr.namespace().and_then(|uri| node.lookup_prefix(uri)) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}:{}", attr.name()),
            _ => attr.name().to_string(),
        };
        attributes.push(Attribute {
            name,
            value: attr.value().to_string(),
        });
    }

    let children = node
        .children()
        .filter_map(|child| match child.node_type() {
            roxmltree::NodeType::Element => Some(Node::Element(convert(source, child))),
            roxmltree::NodeType::Text => child.text().map(|t| Node::Text(t.to_string())),
            roxmltree::NodeType::Comment => child.text().map(|t| Node::Comment(t.to_string())),
            _ => None,
        })
        .collect();

    Element {
        name: qualified_name(source, node),
        namespace: node.tag_name().namespace().map(str::to_string),
        attributes,
        children,
    }
}

/// Recovers the tag as written (prefix included) from the source text.
fn qualified_name(source: &str, node: roxmltree::Node<'_, '_>) -> String {
    let start = node.range().start + 1;
    source
        .get(start..)
        .map(|rest| {
            rest.split(|c: char| c.is_whitespace() || c == '/' || c == '>')
                .next()
                .unwrap_or_default()
                .to_string()
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| node.tag_name().name().to_string())
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

fn collect_text(el: &Element, out: &mut String) {
    for child in &el.children {
        match child {
            Node::Text(text) => out.push_str(text),
            Node::Element(inner) => collect_text(inner, out),
            Node::Comment(_) => {}
        }
    }
}

fn write_element(el: &Element, out: &mut String, indent: Option<usize>) {
    out.push('<');
    out.push_str(&el.name);
    for attr in &el.attributes {
        out.push(' ');
        out.push_str(&attr.name);
        out.push_str("=\"");
        escape_into(&attr.value, out, true);
        out.push('"');
    }

    let has_elements = el.children.iter().any(|n| matches!(n, Node::Element(_)));
    let visible: Vec<&Node> = match indent {
        Some(_) if has_elements => el.children.iter().filter(|n| !n.is_whitespace()).collect(),
        _ => el.children.iter().collect(),
    };

    if visible.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');

    let child_indent = match indent {
        Some(depth) if has_elements => Some(depth + 1),
        _ => None,
    };
    for child in &visible {
        if let Some(depth) = child_indent {
            newline(out, depth);
        }
        match child {
            Node::Element(inner) => write_element(inner, out, child_indent),
            Node::Text(text) => escape_into(text, out, false),
            Node::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
        }
    }
    if let (Some(depth), Some(_)) = (indent, child_indent) {
        newline(out, depth);
    }

    out.push_str("</");
    out.push_str(&el.name);
    out.push('>');
}

/// Escapes `value` for use as element text.
#[must_use]
pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    escape_into(value, &mut out, false);
    out
}

fn newline(out: &mut String, depth: usize) {
    out.push('\n');
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn escape_into(value: &str, out: &mut String, attribute: bool) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            '\n' if attribute => out.push_str("&#10;"),
            _ => out.push(c),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keeps_prefix_and_own_declarations() {
        let el = Element::parse(
            r#"<SOAP:Envelope xmlns:SOAP="urn:soap"><SOAP:Body><m:Echo xmlns:m="urn:m" a="1"/></SOAP:Body></SOAP:Envelope>"#,
        )
        .unwrap();

        assert_eq!(el.name(), "SOAP:Envelope");
        assert_eq!(el.prefix(), Some("SOAP"));
        assert_eq!(el.local_name(), "Envelope");
        assert_eq!(el.namespace(), Some("urn:soap"));
        assert_eq!(el.attribute("xmlns:SOAP"), Some("urn:soap"));

        let body = el.child("Body").unwrap();
        // Inherited bindings are not repeated on descendants.
        assert!(body.attributes().is_empty());

        let method = body.first_element().unwrap();
        assert_eq!(method.name(), "m:Echo");
        assert_eq!(method.namespace(), Some("urn:m"));
        assert_eq!(method.declared_namespace(Some("m")), Some("urn:m"));
        assert_eq!(method.attribute("a"), Some("1"));
    }

    #[test]
    fn default_namespace_is_inherited_by_unprefixed_children() {
        let el = Element::parse(r#"<a xmlns="urn:x"><b>text</b></a>"#).unwrap();
        let b = el.child("b").unwrap();
        assert_eq!(b.namespace(), Some("urn:x"));
        assert_eq!(b.text(), "text");
    }

    #[test]
    fn compact_output_round_trips() {
        let xml = r#"<m:Echo xmlns:m="urn:m"><value a="&quot;x&quot;">1 &lt; 2</value><empty/></m:Echo>"#;
        let el = Element::parse(xml).unwrap();
        assert_eq!(el.to_xml(), xml);
        assert_eq!(Element::parse(&el.to_xml()).unwrap(), el);
    }

    #[test]
    fn pretty_output_indents_element_content() {
        let el = Element::parse("<a>\n   <b>x</b><c/></a>").unwrap();
        assert_eq!(el.to_pretty_xml(), "<a>\n  <b>x</b>\n  <c/>\n</a>\n");
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(Element::parse("  "), Err(XmlError::Empty)));
        assert!(matches!(Element::parse("<a>"), Err(XmlError::Parse(_))));
    }

    #[test]
    fn in_namespace_declares_binding_for_prefix() {
        let el = Element::in_namespace("p:Resp", "urn:r");
        assert_eq!(el.to_xml(), r#"<p:Resp xmlns:p="urn:r"/>"#);
        let el = Element::in_namespace("Resp", "urn:r");
        assert_eq!(el.to_xml(), r#"<Resp xmlns="urn:r"/>"#);
        assert_eq!(el.namespace(), Some("urn:r"));
    }

    #[test]
    fn detach_and_reattach_moves_ownership() {
        let mut src = Element::parse("<a><b/><c/></a>").unwrap();
        let mut dst = Element::new("d");

        let moved = src.remove(0);
        dst.push(moved);

        assert_eq!(src.to_xml(), "<a><c/></a>");
        assert_eq!(dst.to_xml(), "<d><b/></d>");
    }

    #[test]
    fn find_path_walks_local_names() {
        let el = Element::parse(r#"<r xmlns:x="urn:x"><x:a><b>deep</b></x:a></r>"#).unwrap();
        assert_eq!(el.find_path("a/b").map(Element::text).as_deref(), Some("deep"));
        assert!(el.find_path("a/missing").is_none());
    }

    #[test]
    fn remove_elements_where_keeps_text() {
        let mut el = Element::parse("<a>t<b/><c/><b/></a>").unwrap();
        assert_eq!(el.remove_elements_where(|e| e.local_name() == "b"), 2);
        assert_eq!(el.to_xml(), "<a>t<c/></a>");
    }
}
