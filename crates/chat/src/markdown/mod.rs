//! Markdown to sanitized display fragments.
//!
//! A [`Fragment`] can only hold allow-listed elements and attributes, so a
//! converted fragment is safe to hand to any display surface.

mod cache;
mod convert;

use std::fmt::Write as _;

pub use cache::MarkdownCache;
pub use convert::{CommonMarkConverter, ConvertError, MarkupConverter, sanitize_url};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementTag {
    Paragraph,
    Heading(u8),
    Emphasis,
    Strong,
    Strikethrough,
    UnorderedList,
    OrderedList,
    ListItem,
    BlockQuote,
    Pre,
    Code,
    Table,
    TableHead,
    TableBody,
    TableRow,
    TableHeaderCell,
    TableCell,
    Link,
    Image,
    LineBreak,
    Rule,
}

impl ElementTag {
    pub fn name(self) -> &'static str {
        match self {
            Self::Paragraph => "p",
            Self::Heading(1) => "h1",
            Self::Heading(2) => "h2",
            Self::Heading(3) => "h3",
            Self::Heading(4) => "h4",
            Self::Heading(5) => "h5",
            Self::Heading(_) => "h6",
            Self::Emphasis => "em",
            Self::Strong => "strong",
            Self::Strikethrough => "del",
            Self::UnorderedList => "ul",
            Self::OrderedList => "ol",
            Self::ListItem => "li",
            Self::BlockQuote => "blockquote",
            Self::Pre => "pre",
            Self::Code => "code",
            Self::Table => "table",
            Self::TableHead => "thead",
            Self::TableBody => "tbody",
            Self::TableRow => "tr",
            Self::TableHeaderCell => "th",
            Self::TableCell => "td",
            Self::Link => "a",
            Self::Image => "img",
            Self::LineBreak => "br",
            Self::Rule => "hr",
        }
    }

    pub fn is_void(self) -> bool {
        matches!(self, Self::Image | Self::LineBreak | Self::Rule)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeName {
    Href,
    Src,
    Alt,
    Title,
    Start,
    Class,
}

impl AttributeName {
    pub fn name(self) -> &'static str {
        match self {
            Self::Href => "href",
            Self::Src => "src",
            Self::Alt => "alt",
            Self::Title => "title",
            Self::Start => "start",
            Self::Class => "class",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: AttributeName,
    pub value: String,
}

impl Attribute {
    pub fn new(name: AttributeName, value: impl Into<String>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub tag: ElementTag,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(tag: ElementTag) -> Self {
        Self {
            tag,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: AttributeName, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute::new(name, value));
        self
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.children = children;
        self
    }

    pub fn attribute(&self, name: AttributeName) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
            .map(|attribute| attribute.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Node {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn line_break() -> Self {
        Self::Element(Element::new(ElementTag::LineBreak))
    }

    pub fn is_line_break(&self) -> bool {
        matches!(self, Self::Element(element) if element.tag == ElementTag::LineBreak)
    }

    pub fn is_blank_text(&self) -> bool {
        matches!(self, Self::Text(text) if text.trim().is_empty())
    }
}

/// Owned, sanitized display tree. Cloning yields an independent copy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fragment {
    nodes: Vec<Node>,
}

impl Fragment {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    /// Unformatted fallback: the raw text as a single paragraph.
    pub fn plain_text(raw: &str) -> Self {
        if raw.is_empty() {
            return Self::default();
        }
        Self::new(vec![Node::Element(
            Element::new(ElementTag::Paragraph).with_children(vec![Node::text(raw)]),
        )])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn to_html(&self) -> String {
        let mut output = String::new();
        for node in &self.nodes {
            write_html(node, &mut output);
        }
        output
    }

    pub fn text_content(&self) -> String {
        let mut output = String::new();
        for node in &self.nodes {
            write_text(node, &mut output);
        }
        output
    }
}

fn write_html(node: &Node, output: &mut String) {
    match node {
        Node::Text(text) => escape_into(text, output),
        Node::Element(element) => {
            let name = element.tag.name();
            output.push('<');
            output.push_str(name);
            for attribute in &element.attributes {
                let _ = write!(output, " {}=\"", attribute.name.name());
                escape_into(&attribute.value, output);
                output.push('"');
            }
            output.push('>');
            if element.tag.is_void() {
                return;
            }
            for child in &element.children {
                write_html(child, output);
            }
            let _ = write!(output, "</{name}>");
        }
    }
}

fn write_text(node: &Node, output: &mut String) {
    match node {
        Node::Text(text) => output.push_str(text),
        Node::Element(element) if element.tag == ElementTag::LineBreak => output.push('\n'),
        Node::Element(element) => {
            for child in &element.children {
                write_text(child, output);
            }
        }
    }
}

fn escape_into(text: &str, output: &mut String) {
    for character in text.chars() {
        match character {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&#39;"),
            other => output.push(other),
        }
    }
}
