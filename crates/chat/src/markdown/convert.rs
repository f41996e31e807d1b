use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag};
use snafu::{Snafu, ensure};

use super::{AttributeName, Element, ElementTag, Fragment, Node};

const ALLOWED_URL_SCHEMES: [&str; 3] = ["http", "https", "mailto"];
const DEFAULT_MAX_INPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConvertError {
    #[snafu(display("markdown input of {length} bytes exceeds the {limit} byte limit"))]
    InputTooLarge {
        stage: &'static str,
        length: usize,
        limit: usize,
    },
    #[snafu(display("markdown events were unbalanced on `{stage}`: {details}"))]
    UnbalancedEvents {
        stage: &'static str,
        details: String,
    },
}

impl ConvertError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InputTooLarge { stage, .. } | Self::UnbalancedEvents { stage, .. } => stage,
        }
    }
}

/// Pure transform from raw markdown to a sanitized fragment.
pub trait MarkupConverter: Send + Sync {
    fn convert(&self, raw: &str) -> Result<Fragment, ConvertError>;
}

/// CommonMark with tables, strikethrough and task lists.
#[derive(Debug, Clone)]
pub struct CommonMarkConverter {
    max_input_bytes: usize,
}

impl Default for CommonMarkConverter {
    fn default() -> Self {
        Self {
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }
}

impl CommonMarkConverter {
    pub fn with_max_input_bytes(mut self, max_input_bytes: usize) -> Self {
        self.max_input_bytes = max_input_bytes;
        self
    }

    fn options() -> Options {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);
        options
    }
}

impl MarkupConverter for CommonMarkConverter {
    fn convert(&self, raw: &str) -> Result<Fragment, ConvertError> {
        ensure!(
            raw.len() <= self.max_input_bytes,
            InputTooLargeSnafu {
                stage: "check-markdown-size",
                length: raw.len(),
                limit: self.max_input_bytes,
            }
        );

        let mut builder = TreeBuilder::default();
        for event in Parser::new_ext(raw, Self::options()) {
            builder.handle(event)?;
        }
        let nodes = builder.finish()?;
        Ok(Fragment::new(strip_degenerate(nodes)))
    }
}

/// Returns the URL when it is relative or uses an allowed scheme.
pub fn sanitize_url(raw: &str) -> Option<String> {
    let url = raw.trim();
    if url.is_empty() {
        return None;
    }

    // Browsers ignore embedded whitespace and control characters in schemes.
    let compact = url
        .chars()
        .filter(|character| !character.is_ascii_whitespace() && !character.is_control())
        .collect::<String>();
    match url_scheme(&compact) {
        None => Some(url.to_string()),
        Some(scheme)
            if ALLOWED_URL_SCHEMES
                .iter()
                .any(|allowed| scheme.eq_ignore_ascii_case(allowed)) =>
        {
            Some(url.to_string())
        }
        Some(_) => None,
    }
}

fn url_scheme(url: &str) -> Option<&str> {
    let end = url.find([':', '/', '?', '#'])?;
    if !url[end..].starts_with(':') {
        return None;
    }
    let scheme = &url[..end];
    let mut characters = scheme.chars();
    let valid = characters
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic())
        && characters.all(|character| {
            character.is_ascii_alphanumeric() || matches!(character, '+' | '-' | '.')
        });
    valid.then_some(scheme)
}

fn is_line_break_html(html: &str) -> bool {
    let compact = html
        .trim()
        .chars()
        .filter(|character| !character.is_ascii_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    matches!(compact.as_str(), "<br>" | "<br/>")
}

fn heading_rank(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

fn code_language_class(kind: &CodeBlockKind<'_>) -> Option<String> {
    let CodeBlockKind::Fenced(info) = kind else {
        return None;
    };
    let language = info
        .split_whitespace()
        .next()?
        .chars()
        .filter(|character| {
            character.is_ascii_alphanumeric() || matches!(character, '-' | '_' | '+' | '.' | '#')
        })
        .collect::<String>();
    (!language.is_empty()).then(|| format!("language-{language}"))
}

enum FrameKind {
    Element(Element),
    CodeBlock { class: Option<String> },
    Image { src: Option<String>, title: String },
    /// Disallowed wrapper whose content is kept.
    Transparent,
}

struct Frame {
    kind: FrameKind,
    children: Vec<Node>,
}

impl Frame {
    fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
        }
    }

    fn element(tag: ElementTag) -> Self {
        Self::new(FrameKind::Element(Element::new(tag)))
    }

    fn tag(&self) -> Option<ElementTag> {
        match &self.kind {
            FrameKind::Element(element) => Some(element.tag),
            _ => None,
        }
    }
}

#[derive(Default)]
struct TreeBuilder {
    root: Vec<Node>,
    stack: Vec<Frame>,
}

impl TreeBuilder {
    fn handle(&mut self, event: Event<'_>) -> Result<(), ConvertError> {
        match event {
            Event::Start(tag) => self.open(tag),
            Event::End(_) => self.close()?,
            Event::Text(text) => self.push_text(&text),
            Event::Code(code) => self.push(Node::Element(
                Element::new(ElementTag::Code).with_children(vec![Node::text(code.as_ref())]),
            )),
            Event::InlineMath(math) | Event::DisplayMath(math) => self.push_text(&math),
            Event::Html(html) | Event::InlineHtml(html) => {
                if is_line_break_html(&html) {
                    self.push(Node::line_break());
                }
            }
            Event::FootnoteReference(label) => self.push_text(&format!("[^{label}]")),
            Event::SoftBreak => self.push_text("\n"),
            Event::HardBreak => self.push(Node::line_break()),
            Event::Rule => self.push(Node::Element(Element::new(ElementTag::Rule))),
            Event::TaskListMarker(checked) => {
                self.push_text(if checked { "[x] " } else { "[ ] " })
            }
        }
        Ok(())
    }

    fn open(&mut self, tag: Tag<'_>) {
        let frame = match tag {
            Tag::Paragraph => Frame::element(ElementTag::Paragraph),
            Tag::Heading { level, .. } => Frame::element(ElementTag::Heading(heading_rank(level))),
            Tag::BlockQuote(_) => Frame::element(ElementTag::BlockQuote),
            // Only line breaks survive; an otherwise empty block is stripped later.
            Tag::HtmlBlock => Frame::element(ElementTag::Paragraph),
            Tag::CodeBlock(kind) => Frame::new(FrameKind::CodeBlock {
                class: code_language_class(&kind),
            }),
            Tag::List(Some(start)) => {
                let list = Element::new(ElementTag::OrderedList);
                let list = if start == 1 {
                    list
                } else {
                    list.with_attribute(AttributeName::Start, start.to_string())
                };
                Frame::new(FrameKind::Element(list))
            }
            Tag::List(None) => Frame::element(ElementTag::UnorderedList),
            Tag::Item => Frame::element(ElementTag::ListItem),
            Tag::Table(_) => Frame::element(ElementTag::Table),
            Tag::TableHead => Frame::element(ElementTag::TableHead),
            Tag::TableRow => Frame::element(ElementTag::TableRow),
            Tag::TableCell => {
                let in_head = self
                    .stack
                    .last()
                    .and_then(Frame::tag)
                    .is_some_and(|tag| tag == ElementTag::TableHead);
                Frame::element(if in_head {
                    ElementTag::TableHeaderCell
                } else {
                    ElementTag::TableCell
                })
            }
            Tag::Emphasis => Frame::element(ElementTag::Emphasis),
            Tag::Strong => Frame::element(ElementTag::Strong),
            Tag::Strikethrough => Frame::element(ElementTag::Strikethrough),
            Tag::Link { dest_url, title, .. } => match sanitize_url(&dest_url) {
                Some(href) => {
                    let link =
                        Element::new(ElementTag::Link).with_attribute(AttributeName::Href, href);
                    Frame::new(FrameKind::Element(with_title(link, &title)))
                }
                None => {
                    tracing::debug!(url = %dest_url, "dropping link with disallowed scheme");
                    Frame::new(FrameKind::Transparent)
                }
            },
            Tag::Image { dest_url, title, .. } => Frame::new(FrameKind::Image {
                src: sanitize_url(&dest_url),
                title: title.to_string(),
            }),
            _ => Frame::new(FrameKind::Transparent),
        };
        self.stack.push(frame);
    }

    fn close(&mut self) -> Result<(), ConvertError> {
        let Some(frame) = self.stack.pop() else {
            return UnbalancedEventsSnafu {
                stage: "close-markdown-element",
                details: "end event without a matching start".to_string(),
            }
            .fail();
        };

        match frame.kind {
            FrameKind::Element(mut element) => {
                element.children = match element.tag {
                    ElementTag::TableHead => vec![Node::Element(
                        Element::new(ElementTag::TableRow).with_children(frame.children),
                    )],
                    ElementTag::Table => wrap_table_body(frame.children),
                    _ => frame.children,
                };
                self.push(Node::Element(element));
            }
            FrameKind::CodeBlock { class } => {
                let code = Element::new(ElementTag::Code);
                let code = match class {
                    Some(class) => code.with_attribute(AttributeName::Class, class),
                    None => code,
                };
                let pre = Element::new(ElementTag::Pre)
                    .with_children(vec![Node::Element(code.with_children(frame.children))]);
                self.push(Node::Element(pre));
            }
            FrameKind::Image { src, title } => {
                let alt = Fragment::new(frame.children).text_content();
                match src {
                    Some(src) => {
                        let mut image =
                            Element::new(ElementTag::Image).with_attribute(AttributeName::Src, src);
                        if !alt.is_empty() {
                            image = image.with_attribute(AttributeName::Alt, alt);
                        }
                        self.push(Node::Element(with_title(image, &title)));
                    }
                    None => {
                        if !alt.is_empty() {
                            self.push_text(&alt);
                        }
                    }
                }
            }
            FrameKind::Transparent => {
                for child in frame.children {
                    self.push(child);
                }
            }
        }
        Ok(())
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let target = self.target();
        if let Some(Node::Text(previous)) = target.last_mut() {
            previous.push_str(text);
        } else {
            target.push(Node::text(text));
        }
    }

    fn push(&mut self, node: Node) {
        match node {
            Node::Text(text) => self.push_text(&text),
            element => self.target().push(element),
        }
    }

    fn target(&mut self) -> &mut Vec<Node> {
        match self.stack.last_mut() {
            Some(frame) => &mut frame.children,
            None => &mut self.root,
        }
    }

    fn finish(self) -> Result<Vec<Node>, ConvertError> {
        ensure!(
            self.stack.is_empty(),
            UnbalancedEventsSnafu {
                stage: "finish-markdown-tree",
                details: format!("{} element(s) left open", self.stack.len()),
            }
        );
        Ok(self.root)
    }
}

fn with_title(element: Element, title: &str) -> Element {
    if title.trim().is_empty() {
        element
    } else {
        element.with_attribute(AttributeName::Title, title.to_string())
    }
}

/// Body rows follow the head directly in the event stream; group them.
fn wrap_table_body(children: Vec<Node>) -> Vec<Node> {
    let mut wrapped = Vec::with_capacity(2);
    let mut rows = Vec::new();
    for child in children {
        match child {
            Node::Element(element) if element.tag == ElementTag::TableRow => {
                rows.push(Node::Element(element));
            }
            other => wrapped.push(other),
        }
    }
    if !rows.is_empty() {
        wrapped.push(Node::Element(
            Element::new(ElementTag::TableBody).with_children(rows),
        ));
    }
    wrapped
}

/// Removes paragraphs holding only breaks and collapses runs of breaks.
fn strip_degenerate(nodes: Vec<Node>) -> Vec<Node> {
    let mut cleaned = Vec::with_capacity(nodes.len());
    let mut after_break = false;
    for node in nodes {
        let node = match node {
            Node::Element(mut element) if element.tag != ElementTag::Pre => {
                element.children = strip_degenerate(std::mem::take(&mut element.children));
                Node::Element(element)
            }
            other => other,
        };

        if is_empty_paragraph(&node) {
            continue;
        }
        if node.is_line_break() {
            if after_break {
                continue;
            }
            after_break = true;
        } else if after_break && node.is_blank_text() {
            continue;
        } else {
            after_break = false;
        }
        cleaned.push(node);
    }
    cleaned
}

fn is_empty_paragraph(node: &Node) -> bool {
    match node {
        Node::Element(element) if element.tag == ElementTag::Paragraph => element
            .children
            .iter()
            .all(|child| child.is_line_break() || child.is_blank_text()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn html(raw: &str) -> String {
        CommonMarkConverter::default().convert(raw).unwrap().to_html()
    }

    #[test]
    fn renders_inline_formatting() {
        assert_eq!(
            html("Hello **bold** *it* ~~gone~~ `x < y`"),
            "<p>Hello <strong>bold</strong> <em>it</em> <del>gone</del> <code>x &lt; y</code></p>"
        );
    }

    #[test]
    fn drops_raw_html_but_keeps_line_breaks() {
        assert_eq!(
            html("a<script>alert(1)</script>b<br/>c"),
            "<p>aalert(1)b<br>c</p>"
        );
        assert_eq!(html("<div onclick=\"x()\">\nhidden\n</div>"), "");
    }

    #[test]
    fn disallowed_link_schemes_keep_only_text() {
        assert_eq!(
            html("[click](javascript:alert(1)) [ok](https://a.test \"T\") [rel](#top)"),
            "<p>click <a href=\"https://a.test\" title=\"T\">ok</a> <a href=\"#top\">rel</a></p>"
        );
        assert_eq!(
            html("![pic](data:image/png;base64,AAAA)"),
            "<p>pic</p>"
        );
        assert_eq!(
            html("![pic](https://a.test/p.png)"),
            "<p><img src=\"https://a.test/p.png\" alt=\"pic\"></p>"
        );
    }

    #[test]
    fn images_keep_alt_and_title() {
        assert_eq!(
            html("![a cat](https://img.test/cat.png \"Cat\") ![x](javascript:alert(1) \"X\")"),
            "<p><img src=\"https://img.test/cat.png\" alt=\"a cat\" title=\"Cat\"> x</p>"
        );
    }

    #[test]
    fn sanitize_url_handles_obfuscated_schemes() {
        assert_eq!(sanitize_url("  JavaScript:alert(1)"), None);
        assert_eq!(sanitize_url("java\tscript:alert(1)"), None);
        assert_eq!(sanitize_url("vbscript:x"), None);
        assert_eq!(sanitize_url("MAILTO:me@a.test"), Some("MAILTO:me@a.test".to_string()));
        assert_eq!(sanitize_url("docs/page?q=a:b"), Some("docs/page?q=a:b".to_string()));
        assert_eq!(sanitize_url(""), None);
    }

    #[test]
    fn code_blocks_keep_language_class_and_raw_text() {
        assert_eq!(
            html("```rust title\nfn main() { \"<\" }\n```"),
            "<pre><code class=\"language-rust\">fn main() { &quot;&lt;&quot; }\n</code></pre>"
        );
    }

    #[test]
    fn tables_get_head_and_body_sections() {
        assert_eq!(
            html("| a | b |\n|---|---|\n| 1 | 2 |\n| 3 | 4 |"),
            "<table><thead><tr><th>a</th><th>b</th></tr></thead>\
             <tbody><tr><td>1</td><td>2</td></tr><tr><td>3</td><td>4</td></tr></tbody></table>"
        );
    }

    #[test]
    fn ordered_lists_keep_start_and_task_markers() {
        assert_eq!(
            html("3. three\n4. four"),
            "<ol start=\"3\"><li>three</li><li>four</li></ol>"
        );
        assert_eq!(
            html("- [x] done\n- [ ] todo"),
            "<ul><li>[x] done</li><li>[ ] todo</li></ul>"
        );
    }

    #[test]
    fn degenerate_breaks_are_collapsed() {
        assert_eq!(html("a<br><br>\n<br>b"), "<p>a<br>b</p>");
        assert_eq!(html("first\n\n<br>\n\nsecond"), "<p>first</p><p>second</p>");
    }

    #[test]
    fn oversized_input_is_an_error() {
        let converter = CommonMarkConverter::default().with_max_input_bytes(4);
        let error = converter.convert("hello").unwrap_err();
        assert!(matches!(error, ConvertError::InputTooLarge { length: 5, .. }));
        assert_eq!(error.stage(), "check-markdown-size");
    }
}
