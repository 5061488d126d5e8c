//! NativeML templates: XML text with `{{...}}` placeholders.
//!
//! | Placeholder               | Replaced with                                  |
//! |---------------------------|------------------------------------------------|
//! | `{{request}}`             | the request method element, as XML             |
//! | `{{user}}`                | the caller's user DN                           |
//! | `{{property:NAME}}`       | custom property `NAME`                         |
//! | `{{request:Child/Path}}`  | text of the element at that path in the request |
//!
//! Everything except `{{request}}` is inserted as escaped text. Missing values
//! render as nothing.

use scriptgate_core::escape_text;

use super::bridge::ExecutionBridge;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Request,
    User,
    Property(String),
    RequestPath(String),
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    /// Splits `source` into literal text and placeholders.
    ///
    /// # Errors
    ///
    /// Returns a message for an unterminated or unknown placeholder.
    pub fn parse(source: &str) -> Result<Self, String> {
        let mut parts = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                parts.push(Part::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| format!("unterminated placeholder at offset {}", source.len() - rest.len() + start))?;
            parts.push(placeholder(after[..end].trim())?);
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }
        Ok(Self { parts })
    }

    /// Renders the template for the request held by `bridge`.
    #[must_use]
    pub fn render(&self, bridge: &ExecutionBridge) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Request => out.push_str(&bridge.request_xml()),
                Part::User => out.push_str(&escape_text(bridge.request_user().unwrap_or_default())),
                Part::Property(name) => {
                    if let Some(value) = bridge.custom_property(name) {
                        out.push_str(&escape_text(&value));
                    }
                }
                Part::RequestPath(path) => {
                    if let Some(el) = bridge.request().method().and_then(|m| m.find_path(path)) {
                        out.push_str(&escape_text(&el.text()));
                    }
                }
            }
        }
        out
    }
}

fn placeholder(body: &str) -> Result<Part, String> {
    match body.split_once(':') {
        None if body == "request" => Ok(Part::Request),
        None if body == "user" => Ok(Part::User),
        Some(("property", name)) if !name.is_empty() => Ok(Part::Property(name.to_string())),
        Some(("request", path)) if !path.is_empty() => Ok(Part::RequestPath(path.to_string())),
        _ => Err(format!("unknown placeholder {{{{{body}}}}}")),
    }
}
