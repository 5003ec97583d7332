//! A small owned element tree for Beaker job and result documents.
//!
//! Beaker speaks XML in both directions: job descriptions are submitted as
//! XML and `bkr job-results` answers with an XML result tree. The runner
//! needs to read attributes out of those trees and derive new job documents
//! from them (narrowed retry jobs, host exclusions), so it keeps a plain
//! owned tree rather than streaming events.
//!
//! Parsing and serialization are built on [`quick_xml`]. The tree keeps
//! element order and attribute order, drops comments and processing
//! instructions, and ignores whitespace-only text.
//!
//! # Example
//!
//! ```
//! use labrun::xml::Element;
//!
//! let root = Element::parse(r#"<job><whiteboard>nightly</whiteboard></job>"#).unwrap();
//! assert_eq!(root.child("whiteboard").unwrap().text(), "nightly");
//! ```

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

/// Result type for XML operations.
pub type XmlResult<T> = Result<T, XmlError>;

/// Errors raised while reading or writing a document.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    /// The document is not well-formed.
    #[error("Malformed XML document: {0}")]
    Malformed(String),

    /// The document contains no root element.
    #[error("XML document has no root element")]
    Empty,

    /// Serialization failed.
    #[error("Failed to write XML: {0}")]
    Write(String),
}

/// A child of an [`Element`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with its attributes and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    /// Creates an empty element.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder-style text setter.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.set_text(text);
        self
    }

    /// Parses a complete document and returns its root element.
    ///
    /// # Errors
    ///
    /// Returns [`XmlError::Malformed`] for syntax errors, mismatched or
    /// unclosed tags, and [`XmlError::Empty`] when no element is present.
    pub fn parse(input: &str) -> XmlResult<Element> {
        let mut reader = Reader::from_str(input);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| XmlError::Malformed(e.to_string()))?;

            match event {
                Event::Start(start) => {
                    stack.push(element_from_start(&start)?);
                }
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(end) => {
                    let element = stack.pop().ok_or_else(|| {
                        XmlError::Malformed(format!(
                            "unexpected closing tag </{}>",
                            String::from_utf8_lossy(end.name().as_ref())
                        ))
                    })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| XmlError::Malformed(e.to_string()))?;
                    push_text(&mut stack, &text)?;
                }
                Event::CData(data) => {
                    let text = String::from_utf8_lossy(&data.into_inner()).to_string();
                    push_text(&mut stack, &text)?;
                }
                Event::Eof => break,
                // Declarations, comments, processing instructions, doctypes.
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(XmlError::Malformed(format!("unclosed element <{}>", open.name)));
        }

        root.ok_or(XmlError::Empty)
    }

    /// Serializes the element (and its subtree) without an XML declaration.
    pub fn to_xml(&self) -> XmlResult<String> {
        let mut writer = Writer::new(Vec::new());
        self.write(&mut writer)?;
        String::from_utf8(writer.into_inner()).map_err(|e| XmlError::Write(e.to_string()))
    }

    fn write(&self, writer: &mut Writer<Vec<u8>>) -> XmlResult<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.children.is_empty() {
            return writer
                .write_event(Event::Empty(start))
                .map_err(|e| XmlError::Write(e.to_string()));
        }

        writer
            .write_event(Event::Start(start))
            .map_err(|e| XmlError::Write(e.to_string()))?;
        for child in &self.children {
            match child {
                Node::Element(element) => element.write(writer)?,
                Node::Text(text) => writer
                    .write_event(Event::Text(BytesText::new(text)))
                    .map_err(|e| XmlError::Write(e.to_string()))?,
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(|e| XmlError::Write(e.to_string()))
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets an attribute, replacing an existing value in place.
    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<String> {
        let idx = self.attributes.iter().position(|(k, _)| k == key)?;
        Some(self.attributes.remove(idx).1)
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|c| match c {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Replaces all direct text content.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.children.retain(|c| matches!(c, Node::Element(_)));
        self.children.insert(0, Node::Text(text.into()));
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Iterates over direct child elements.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|c| match c {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|c| match c {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.elements_mut().find(|e| e.name == name)
    }

    /// Direct children with the given name.
    pub fn children_named<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a Element> + use<'a, 'n> {
        self.elements().filter(move |e| e.name == name)
    }

    /// Elements reached by a `/`-separated path of child names, e.g.
    /// `"recipeSet/recipe"`.
    pub fn find_all(&self, path: &str) -> Vec<&Element> {
        let mut current: Vec<&Element> = vec![self];
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = current
                .into_iter()
                .flat_map(|e| e.children_named(segment))
                .collect();
        }
        current
    }

    /// First element reached by a `/`-separated path.
    pub fn find(&self, path: &str) -> Option<&Element> {
        self.find_all(path).into_iter().next()
    }

    /// All descendants (self excluded) with the given name, in document order.
    pub fn descendants(&self, name: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        for child in self.elements() {
            if child.name == name {
                found.push(child);
            }
            found.extend(child.descendants(name));
        }
        found
    }

    /// Applies `f` to every descendant element (self excluded) with the given
    /// name. Matching elements are not searched further.
    pub fn for_each_descendant_mut(&mut self, name: &str, f: &mut dyn FnMut(&mut Element)) {
        for child in self.elements_mut() {
            if child.name == name {
                f(child);
            } else {
                child.for_each_descendant_mut(name, f);
            }
        }
    }

    /// Removes every descendant element for which `pred` returns true.
    pub fn remove_descendants(&mut self, pred: &dyn Fn(&Element) -> bool) {
        self.children.retain(|c| match c {
            Node::Element(e) => !pred(e),
            Node::Text(_) => true,
        });
        for child in self.elements_mut() {
            child.remove_descendants(pred);
        }
    }
}

fn element_from_start(start: &BytesStart<'_>) -> XmlResult<Element> {
    let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let mut element = Element::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Malformed(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::Malformed(e.to_string()))?
            .to_string();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> XmlResult<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.push(element);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(XmlError::Malformed(format!(
            "multiple root elements (second is <{}>)",
            element.name
        ))),
    }
}

fn push_text(stack: &mut [Element], text: &str) -> XmlResult<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Text(text.to_string()));
            Ok(())
        }
        None => Err(XmlError::Malformed(format!(
            "text outside of the root element: {:?}",
            text
        ))),
    }
}
