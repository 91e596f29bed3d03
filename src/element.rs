//! XML element tree for stanzas.
//!
//! Elements are plain owned data: children live inside their parent and the
//! engine keeps the path back to the root on its own stack while a stanza is
//! under assembly, so no back-pointers are needed.

use std::collections::BTreeMap;

/// One XML element, with its namespace context captured at parse time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    /// Namespace prefix as written in the document, `""` for none.
    pub prefix: String,
    /// Local tag name without the prefix.
    pub tag: String,
    /// Namespace the name resolved to. `Some("")` means the element is
    /// explicitly in no namespace; `None` means unresolved (locally built
    /// elements that never went through a parser).
    pub resolved_namespace: Option<String>,
    /// Default (`xmlns`) namespace in scope at this element.
    pub default_namespace: Option<String>,
    /// Prefixed namespace declarations (`xmlns:foo`) carried on this element.
    pub prefixed_namespaces: BTreeMap<String, String>,
    /// Non-namespace attributes.
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<Element>,
    /// Concatenated character data, `None` when the element has none.
    pub contents: Option<String>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Element {
            tag: tag.into(),
            ..Element::default()
        }
    }

    /// Attribute value by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// First direct child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.tag == tag)
    }

    /// Append a run of character data, concatenating with what is there.
    pub fn append_text(&mut self, text: &str) {
        match &mut self.contents {
            Some(contents) => contents.push_str(text),
            None => self.contents = Some(text.to_string()),
        }
    }

    /// Serialize to wire form.
    ///
    /// Namespace declarations and attribute values are escaped; `contents` is
    /// written as-is, so callers that put markup-significant text in must
    /// escape it themselves. The closing tag omits the prefix, so
    /// `<stream:error>` closes as `</error>`.
    pub fn serialize(&self) -> String {
        let mut out = String::from("<");
        if !self.prefix.is_empty() {
            out.push_str(&self.prefix);
            out.push(':');
        }
        out.push_str(&self.tag);

        if let Some(default_namespace) = &self.default_namespace {
            out.push_str(&format!(" xmlns='{}'", escape_attribute(default_namespace)));
        }
        for (prefix, uri) in &self.prefixed_namespaces {
            out.push_str(&format!(" xmlns:{}='{}'", prefix, escape_attribute(uri)));
        }
        for (name, value) in &self.attributes {
            out.push_str(&format!(" {}='{}'", name, escape_attribute(value)));
        }

        let contents = self.contents.as_deref().unwrap_or("");
        if contents.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return out;
        }

        out.push('>');
        out.push_str(contents);
        for child in &self.children {
            out.push_str(&child.serialize());
        }
        out.push_str(&format!("</{}>", self.tag));
        out
    }
}

/// Escape a string for use inside a single-quoted XML attribute value.
pub fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            '>' => escaped.push_str("&gt;"),
            '<' => escaped.push_str("&lt;"),
            other => escaped.push(other),
        }
    }
    escaped
}
