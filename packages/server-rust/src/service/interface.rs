//! Response element discovery from an operation's interface description.
//!
//! The interface is a WSDL 1.1 document. The response element is the first
//! part of the output message of the port-type operation whose input message
//! has a part bound to the request element. Imported documents are followed
//! once each.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::traits::InterfaceSource;

pub const WSDL_NS: &str = "http://schemas.xmlsoap.org/wsdl/";

/// Upper bound on followed imports, cycles aside.
const MAX_DOCUMENTS: usize = 64;

/// Name and namespace of a response element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseElement {
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QName {
    namespace: Option<String>,
    local: String,
}

#[derive(Debug)]
struct Message {
    name: QName,
    parts: Vec<QName>,
}

#[derive(Debug)]
struct Operation {
    input: Option<QName>,
    output: Option<QName>,
}

#[derive(Debug, Default)]
struct Definitions {
    messages: Vec<Message>,
    operations: Vec<Operation>,
    imports: Vec<String>,
}

impl Definitions {
    fn parse(text: &str) -> Result<Self, roxmltree::Error> {
        let doc = roxmltree::Document::parse(text)?;
        let root = doc.root_element();
        let target = root.attribute("targetNamespace").map(str::to_string);
        let mut defs = Self::default();

        for child in root.children().filter(|n| n.is_element()) {
            if child.tag_name().namespace() != Some(WSDL_NS) {
                continue;
            }
            match child.tag_name().name() {
                "import" => {
                    if let Some(location) = child.attribute("location") {
                        defs.imports.push(location.to_string());
                    }
                }
                "message" => {
                    let Some(name) = child.attribute("name") else {
                        continue;
                    };
                    let parts = child
                        .children()
                        .filter(|n| n.has_tag_name((WSDL_NS, "part")))
                        .filter_map(|part| resolve_qname(part, part.attribute("element")?))
                        .collect();
                    defs.messages.push(Message {
                        name: QName {
                            namespace: target.clone(),
                            local: name.to_string(),
                        },
                        parts,
                    });
                }
                "portType" => {
                    for op in child
                        .children()
                        .filter(|n| n.has_tag_name((WSDL_NS, "operation")))
                    {
                        let message_of = |tag: &str| {
                            op.children()
                                .find(|n| n.has_tag_name((WSDL_NS, tag)))
                                .and_then(|n| resolve_qname(n, n.attribute("message")?))
                        };
                        defs.operations.push(Operation {
                            input: message_of("input"),
                            output: message_of("output"),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(defs)
    }
}

fn resolve_qname(node: roxmltree::Node<'_, '_>, value: &str) -> Option<QName> {
    let (prefix, local) = match value.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, value),
    };
    let namespace = node.lookup_namespace_uri(prefix);
    if prefix.is_some() && namespace.is_none() {
        return None;
    }
    Some(QName {
        namespace: namespace.map(str::to_string),
        local: local.to_string(),
    })
}

/// Parses `interface` and its imports, then finds the response element for
/// the request element `(name, namespace)`.
///
/// # Errors
///
/// Fails when a document cannot be parsed or an import cannot be fetched.
pub async fn discover(
    interface: &str,
    name: &str,
    namespace: Option<&str>,
    source: &dyn InterfaceSource,
) -> anyhow::Result<Option<ResponseElement>> {
    let mut documents = vec![Definitions::parse(interface)?];
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: Vec<String> = documents[0].imports.clone();

    while let Some(location) = queue.pop() {
        if !seen.insert(location.clone()) || documents.len() >= MAX_DOCUMENTS {
            continue;
        }
        match source.fetch(&location).await? {
            Some(text) => {
                let defs = Definitions::parse(&text)?;
                queue.extend(defs.imports.iter().cloned());
                documents.push(defs);
            }
            None => tracing::debug!(%location, "imported interface document not found"),
        }
    }

    let request = QName {
        namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
        local: name.to_string(),
    };
    let messages = || documents.iter().flat_map(|d| d.messages.iter());

    let Some(input) = messages().find(|m| m.parts.contains(&request)) else {
        tracing::debug!(element = %name, "no input message found in the interface");
        return Ok(None);
    };
    let output = documents
        .iter()
        .flat_map(|d| d.operations.iter())
        .find(|op| op.input.as_ref() == Some(&input.name))
        .and_then(|op| op.output.as_ref());
    let Some(output) = output else {
        tracing::debug!(element = %name, "no output message found in the interface");
        return Ok(None);
    };

    Ok(messages()
        .find(|m| &m.name == output)
        .and_then(|m| m.parts.first())
        .map(|part| ResponseElement {
            name: part.local.clone(),
            namespace: part.namespace.clone(),
        }))
}

// ---------------------------------------------------------------------------
// InterfaceCache
// ---------------------------------------------------------------------------

/// Response elements discovered per method, computed once per method DN.
pub struct InterfaceCache {
    source: Arc<dyn InterfaceSource>,
    entries: DashMap<String, Arc<OnceCell<Option<ResponseElement>>>>,
}

impl std::fmt::Debug for InterfaceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceCache")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl InterfaceCache {
    #[must_use]
    pub fn new(source: Arc<dyn InterfaceSource>) -> Self {
        Self {
            source,
            entries: DashMap::new(),
        }
    }

    /// The response element for a request, or `None` when the interface does
    /// not say. Failures are logged and remembered as `None`.
    ///
    /// Without a method DN the result is computed but not cached.
    pub async fn response_element(
        &self,
        method_dn: Option<&str>,
        interface: Option<&str>,
        name: &str,
        namespace: Option<&str>,
    ) -> Option<ResponseElement> {
        let Some(interface) = interface.filter(|i| !i.trim().is_empty()) else {
            tracing::debug!(element = %name, "no interface description for method");
            return None;
        };
        let Some(method_dn) = method_dn.filter(|dn| !dn.is_empty()) else {
            return self.lookup(interface, name, namespace).await;
        };

        let cell = Arc::clone(
            self.entries
                .entry(method_dn.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .value(),
        );
        cell.get_or_init(|| self.lookup(interface, name, namespace))
            .await
            .clone()
    }

    async fn lookup(
        &self,
        interface: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Option<ResponseElement> {
        match discover(interface, name, namespace, self.source.as_ref()).await {
            Ok(found) => {
                if let Some(el) = &found {
                    tracing::debug!(name = %el.name, namespace = el.namespace.as_deref().unwrap_or(""), "found response element");
                }
                found
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to read the interface description");
                None
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StaticInterfaces;
    use crate::traits::NoImports;

    const ORDERS: &str = r#"<definitions xmlns="http://schemas.xmlsoap.org/wsdl/"
        xmlns:tns="urn:orders/wsdl" xmlns:o="urn:orders"
        targetNamespace="urn:orders/wsdl">
      <message name="GetOrderInput"><part name="body" element="o:GetOrder"/></message>
      <message name="GetOrderOutput"><part name="body" element="o:GetOrderResult"/></message>
      <portType name="Orders">
        <operation name="GetOrder">
          <input message="tns:GetOrderInput"/>
          <output message="tns:GetOrderOutput"/>
        </operation>
      </portType>
    </definitions>"#;

    #[tokio::test]
    async fn finds_response_element() {
        let found = discover(ORDERS, "GetOrder", Some("urn:orders"), &NoImports)
            .await
            .unwrap();
        assert_eq!(
            found,
            Some(ResponseElement {
                name: "GetOrderResult".into(),
                namespace: Some("urn:orders".into()),
            })
        );

        let missing = discover(ORDERS, "GetOrder", Some("urn:other"), &NoImports)
            .await
            .unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn follows_imports_once() {
        let root = r#"<definitions xmlns="http://schemas.xmlsoap.org/wsdl/"
            xmlns:tns="urn:orders/wsdl" targetNamespace="urn:orders/wsdl">
          <import namespace="urn:orders/wsdl" location="messages.wsdl"/>
          <portType name="Orders">
            <operation name="GetOrder">
              <input message="tns:GetOrderInput"/>
              <output message="tns:GetOrderOutput"/>
            </operation>
          </portType>
        </definitions>"#;
        let messages = r#"<definitions xmlns="http://schemas.xmlsoap.org/wsdl/"
            xmlns:o="urn:orders" targetNamespace="urn:orders/wsdl">
          <import namespace="urn:orders/wsdl" location="messages.wsdl"/>
          <message name="GetOrderInput"><part name="body" element="o:GetOrder"/></message>
          <message name="GetOrderOutput"><part name="body" element="o:GetOrderResult"/></message>
        </definitions>"#;
        let source = StaticInterfaces::new(&[("messages.wsdl", messages)]);

        let found = discover(root, "GetOrder", Some("urn:orders"), source.as_ref())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "GetOrderResult");
        assert_eq!(source.fetches(), vec!["messages.wsdl".to_string()]);
    }

    #[tokio::test]
    async fn cache_computes_once_per_method() {
        let source = StaticInterfaces::new(&[]);
        let cache = InterfaceCache::new(source);

        let first = cache
            .response_element(Some("cn=GetOrder"), Some(ORDERS), "GetOrder", Some("urn:orders"))
            .await;
        assert_eq!(first.unwrap().name, "GetOrderResult");

        // A different document under the same DN is not consulted again.
        let second = cache
            .response_element(Some("cn=GetOrder"), Some("<broken"), "GetOrder", Some("urn:orders"))
            .await;
        assert_eq!(second.unwrap().name, "GetOrderResult");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn unreadable_interface_yields_none() {
        let cache = InterfaceCache::new(Arc::new(NoImports));
        assert_eq!(
            cache
                .response_element(Some("cn=X"), Some("<broken"), "X", None)
                .await,
            None
        );
        assert_eq!(cache.response_element(None, None, "X", None).await, None);
    }
}
