use std::io::{self, Stdout, Write};

use murmur_llm::Model;

use crate::markdown::{AttributeName, Element, ElementTag, Fragment, Node};
use crate::message::ChatStats;
use crate::surface::ChatSurface;

const USER_PREFIX: &str = "you   › ";
const ASSISTANT_PREFIX: &str = "model › ";

/// Line-oriented surface for a plain terminal.
///
/// A terminal cannot redraw earlier output, so streamed updates print only
/// the suffix that extends what is already on screen. When markdown reflow
/// changes earlier text, the final render is printed again in full.
pub struct TerminalSurface<W: Write + Send = Stdout> {
    out: W,
    status: String,
    printed: String,
    latest: String,
    reply_open: bool,
    pending_stats: Option<String>,
}

impl TerminalSurface<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> TerminalSurface<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            status: String::new(),
            printed: String::new(),
            latest: String::new(),
            reply_open: false,
            pending_stats: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn prompt(&mut self) {
        let _ = write!(self.out, "[{}]\n> ", self.status);
        let _ = self.out.flush();
    }

    pub fn print_line(&mut self, line: &str) {
        let _ = writeln!(self.out, "{line}");
        let _ = self.out.flush();
    }
}

impl<W: Write + Send> ChatSurface for TerminalSurface<W> {
    fn append_user_message(&mut self, text: &str) {
        let _ = writeln!(self.out, "{USER_PREFIX}{text}");
    }

    fn append_assistant_message(&mut self, fragment: &Fragment) {
        let _ = writeln!(self.out, "{ASSISTANT_PREFIX}{}", terminal_text(fragment));
    }

    fn begin_assistant_reply(&mut self) {
        self.printed.clear();
        self.latest.clear();
        self.reply_open = true;
        let _ = write!(self.out, "{ASSISTANT_PREFIX}");
        let _ = self.out.flush();
    }

    fn update_assistant_reply(&mut self, fragment: &Fragment) {
        self.latest = terminal_text(fragment);
        if let Some(suffix) = self.latest.strip_prefix(self.printed.as_str()) {
            let _ = write!(self.out, "{suffix}");
            let _ = self.out.flush();
            self.printed.clone_from(&self.latest);
        }
    }

    fn replace_assistant_reply(&mut self, notice: &str) {
        let _ = writeln!(self.out);
        let _ = write!(self.out, "{ASSISTANT_PREFIX}[{notice}]");
        self.printed = notice.to_string();
        self.latest.clone_from(&self.printed);
    }

    fn end_assistant_reply(&mut self) {
        if self.reply_open && self.printed != self.latest {
            let _ = write!(self.out, "\n{ASSISTANT_PREFIX}{}", self.latest);
        }
        let _ = writeln!(self.out);
        if let Some(stats) = self.pending_stats.take() {
            let _ = writeln!(self.out, "  ({stats})");
        }
        let _ = self.out.flush();
        self.reply_open = false;
        self.printed.clear();
        self.latest.clear();
    }

    fn clear_messages(&mut self) {
        let _ = writeln!(self.out, "(history cleared)");
    }

    fn scroll_to_bottom(&mut self) {
        let _ = self.out.flush();
    }

    fn set_busy(&mut self, _busy: bool) {}

    fn set_sending_enabled(&mut self, _enabled: bool) {}

    fn focus_input(&mut self) {
        let _ = self.out.flush();
    }

    fn set_status(&mut self, status: &str) {
        self.status = status.to_string();
    }

    fn show_stats(&mut self, stats: &ChatStats) {
        // Stats arrive mid-reply; keep them off the reply line.
        if self.reply_open {
            self.pending_stats = Some(stats.to_string());
        } else {
            let _ = writeln!(self.out, "  ({stats})");
        }
    }

    fn show_inline_error(&mut self, message: &str) {
        let _ = writeln!(self.out, "! {message}");
        let _ = self.out.flush();
    }

    fn show_blocking_notice(&mut self, message: &str) {
        let _ = writeln!(self.out, "\n*** {message} ***\n(type /dismiss to close)");
        let _ = self.out.flush();
    }

    fn dismiss_blocking_notice(&mut self) {
        let _ = writeln!(self.out, "(notice dismissed)");
    }

    fn show_models(&mut self, models: &[Model], selected: Option<&str>) {
        for model in models {
            let marker = if Some(model.id.as_str()) == selected { '*' } else { ' ' };
            let _ = match &model.description {
                Some(description) => writeln!(
                    self.out,
                    " {marker} {:<28} {} ({description})",
                    model.id, model.name
                ),
                None => writeln!(self.out, " {marker} {:<28} {}", model.id, model.name),
            };
        }
        let _ = self.out.flush();
    }
}

/// Flattens a fragment into readable plain text.
pub fn terminal_text(fragment: &Fragment) -> String {
    let mut output = String::new();
    write_blocks(fragment.nodes(), 0, &mut output);
    output.trim_end().to_string()
}

fn write_blocks(nodes: &[Node], depth: usize, output: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => output.push_str(text),
            Node::Element(element) => write_block(element, depth, output),
        }
    }
}

fn write_block(element: &Element, depth: usize, output: &mut String) {
    match element.tag {
        ElementTag::Paragraph => {
            write_inline(&element.children, output);
            output.push_str("\n\n");
        }
        ElementTag::Heading(level) => {
            output.push_str(&"#".repeat(usize::from(level)));
            output.push(' ');
            write_inline(&element.children, output);
            output.push_str("\n\n");
        }
        ElementTag::UnorderedList | ElementTag::OrderedList => {
            let mut number = element
                .attribute(AttributeName::Start)
                .and_then(|start| start.parse::<u64>().ok())
                .unwrap_or(1);
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            for child in &element.children {
                let Node::Element(item) = child else {
                    continue;
                };
                output.push_str(&"  ".repeat(depth));
                if element.tag == ElementTag::OrderedList {
                    output.push_str(&format!("{number}. "));
                    number += 1;
                } else {
                    output.push_str("- ");
                }
                let mut item_text = String::new();
                write_blocks(&item.children, depth + 1, &mut item_text);
                output.push_str(item_text.trim_end());
                output.push('\n');
            }
            if depth == 0 {
                output.push('\n');
            }
        }
        ElementTag::BlockQuote => {
            let mut quoted = String::new();
            write_blocks(&element.children, depth, &mut quoted);
            for line in quoted.trim_end().lines() {
                output.push_str("> ");
                output.push_str(line);
                output.push('\n');
            }
            output.push('\n');
        }
        ElementTag::Pre => {
            output.push_str(&Fragment::new(element.children.clone()).text_content());
            if !output.ends_with('\n') {
                output.push('\n');
            }
            output.push('\n');
        }
        ElementTag::Table => {
            for section in &element.children {
                let Node::Element(section) = section else {
                    continue;
                };
                for row in &section.children {
                    let Node::Element(row) = row else {
                        continue;
                    };
                    let cells = row
                        .children
                        .iter()
                        .map(|cell| {
                            let mut text = String::new();
                            if let Node::Element(cell) = cell {
                                write_inline(&cell.children, &mut text);
                            }
                            text
                        })
                        .collect::<Vec<_>>();
                    output.push_str(&cells.join(" | "));
                    output.push('\n');
                }
            }
            output.push('\n');
        }
        ElementTag::Rule => output.push_str("---\n\n"),
        _ => write_inline(std::slice::from_ref(&Node::Element(element.clone())), output),
    }
}

fn write_inline(nodes: &[Node], output: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => output.push_str(text),
            Node::Element(element) => match element.tag {
                ElementTag::LineBreak => output.push('\n'),
                ElementTag::Code => {
                    output.push('`');
                    write_inline(&element.children, output);
                    output.push('`');
                }
                ElementTag::Link => {
                    let mut label = String::new();
                    write_inline(&element.children, &mut label);
                    output.push_str(&label);
                    if let Some(href) = element.attribute(AttributeName::Href) {
                        if href != label {
                            output.push_str(&format!(" ({href})"));
                        }
                    }
                }
                ElementTag::Image => {
                    let alt = element.attribute(AttributeName::Alt).unwrap_or("image");
                    output.push_str(&format!("[{alt}]"));
                }
                _ => write_inline(&element.children, output),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::markdown::{CommonMarkConverter, MarkupConverter};

    fn render(raw: &str) -> String {
        terminal_text(&CommonMarkConverter::default().convert(raw).unwrap())
    }

    #[test]
    fn renders_blocks_as_plain_text() {
        assert_eq!(
            render("# Title\n\nSome *text* with [a link](https://a.test).\n\n- one\n- two\n\n```\nx = 1\n```"),
            "# Title\n\nSome text with a link (https://a.test).\n\n- one\n- two\n\nx = 1"
        );
    }

    #[test]
    fn tables_and_quotes() {
        assert_eq!(
            render("> quoted\n\n| a | b |\n|---|---|\n| 1 | 2 |"),
            "> quoted\n\na | b\n1 | 2"
        );
    }

    #[test]
    fn streaming_prints_only_new_suffix() {
        let mut surface = TerminalSurface::new(Vec::new());
        surface.begin_assistant_reply();
        surface.update_assistant_reply(&Fragment::plain_text("Hi"));
        surface.update_assistant_reply(&Fragment::plain_text("Hi there"));
        surface.end_assistant_reply();

        let output = String::from_utf8(surface.into_inner()).unwrap();
        assert_eq!(output, "model › Hi there\n");
    }

    #[test]
    fn reflowed_reply_is_reprinted_at_the_end() {
        let mut surface = TerminalSurface::new(Vec::new());
        surface.begin_assistant_reply();
        surface.update_assistant_reply(&Fragment::plain_text("**bold"));
        let bold = CommonMarkConverter::default().convert("**bold**").unwrap();
        surface.update_assistant_reply(&bold);
        surface.end_assistant_reply();

        let output = String::from_utf8(surface.into_inner()).unwrap();
        assert_eq!(output, "model › **bold\nmodel › bold\n");
    }
}
