//! Notion block tree to markdown.

use serde::Deserialize;
use serde_json::Value;

use crate::model::{plain_text, RichText};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct TextBlock {
    #[serde(default)]
    pub rich_text: Vec<RichText>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct ToDoBlock {
    #[serde(default)]
    pub rich_text: Vec<RichText>,
    #[serde(default)]
    pub checked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct CalloutBlock {
    #[serde(default)]
    pub rich_text: Vec<RichText>,
    #[serde(default)]
    pub icon: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct CodeBlock {
    #[serde(default)]
    pub rich_text: Vec<RichText>,
    #[serde(default)]
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct FileBlock {
    #[serde(default)]
    pub caption: Vec<RichText>,
    #[serde(default)]
    pub external: Option<crate::model::FileLink>,
    #[serde(default)]
    pub file: Option<crate::model::FileLink>,
}

impl FileBlock {
    fn url(&self) -> &str {
        self.external
            .as_ref()
            .or(self.file.as_ref())
            .map(|link| link.url.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct LinkBlock {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub caption: Vec<RichText>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct EquationBlock {
    #[serde(default)]
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct TitleBlock {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct TableRowBlock {
    #[serde(default)]
    pub cells: Vec<Vec<RichText>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Paragraph {
        paragraph: TextBlock,
    },
    #[serde(rename = "heading_1")]
    Heading1 {
        heading_1: TextBlock,
    },
    #[serde(rename = "heading_2")]
    Heading2 {
        heading_2: TextBlock,
    },
    #[serde(rename = "heading_3")]
    Heading3 {
        heading_3: TextBlock,
    },
    BulletedListItem {
        bulleted_list_item: TextBlock,
    },
    NumberedListItem {
        numbered_list_item: TextBlock,
    },
    ToDo {
        to_do: ToDoBlock,
    },
    Toggle {
        toggle: TextBlock,
    },
    Quote {
        quote: TextBlock,
    },
    Callout {
        callout: CalloutBlock,
    },
    Code {
        code: CodeBlock,
    },
    Divider {},
    Image {
        image: FileBlock,
    },
    Video {
        video: FileBlock,
    },
    File {
        file: FileBlock,
    },
    Pdf {
        pdf: FileBlock,
    },
    Bookmark {
        bookmark: LinkBlock,
    },
    Embed {
        embed: LinkBlock,
    },
    LinkPreview {
        link_preview: LinkBlock,
    },
    Equation {
        equation: EquationBlock,
    },
    ChildPage {
        child_page: TitleBlock,
    },
    Table {},
    TableRow {
        table_row: TableRowBlock,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: String,
    pub has_children: bool,
    pub kind: BlockKind,
    pub children: Vec<Block>,
}

impl Block {
    pub fn from_json(value: &Value) -> Self {
        Self {
            id: value
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            has_children: value
                .get("has_children")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            kind: serde_json::from_value(value.clone()).unwrap_or(BlockKind::Unsupported),
            children: Vec::new(),
        }
    }

    fn is_list_item(&self) -> bool {
        matches!(
            self.kind,
            BlockKind::BulletedListItem { .. }
                | BlockKind::NumberedListItem { .. }
                | BlockKind::ToDo { .. }
        )
    }
}

pub fn render_rich_text(segments: &[RichText]) -> String {
    segments.iter().map(render_segment).collect()
}

fn render_segment(segment: &RichText) -> String {
    let text = segment.plain_text.as_str();
    if text.trim().is_empty() {
        return text.to_string();
    }
    if segment.kind == "equation" {
        return format!("${text}$");
    }

    // Emphasis markers must hug non-space text.
    let inner = text.trim();
    let leading = &text[..text.len() - text.trim_start().len()];
    let trailing = &text[text.trim_end().len()..];

    let mut out = inner.to_string();
    let a = &segment.annotations;
    if a.code {
        out = format!("`{out}`");
    }
    if a.bold {
        out = format!("**{out}**");
    }
    if a.italic {
        out = format!("_{out}_");
    }
    if a.strikethrough {
        out = format!("~~{out}~~");
    }
    if let Some(href) = segment.href.as_deref().filter(|h| !h.is_empty()) {
        out = format!("[{out}]({href})");
    }
    format!("{leading}{out}{trailing}")
}

/// Renders a block tree. Adjacent list items are joined by single newlines,
/// everything else by blank lines.
pub fn render_blocks(blocks: &[Block]) -> String {
    let mut out = String::new();
    let mut previous_was_list = false;
    let mut number = 0usize;

    for block in blocks {
        if matches!(block.kind, BlockKind::NumberedListItem { .. }) {
            number += 1;
        } else {
            number = 0;
        }

        let rendered = render_block(block, number);
        if rendered.is_empty() {
            continue;
        }

        if !out.is_empty() {
            out.push_str(if previous_was_list && block.is_list_item() {
                "\n"
            } else {
                "\n\n"
            });
        }
        out.push_str(&rendered);
        previous_was_list = block.is_list_item();
    }
    out
}

fn render_block(block: &Block, number: usize) -> String {
    match &block.kind {
        BlockKind::Paragraph { paragraph } => {
            with_children(render_rich_text(&paragraph.rich_text), &block.children)
        }
        BlockKind::Heading1 { heading_1 } => {
            format!("# {}", render_rich_text(&heading_1.rich_text))
        }
        BlockKind::Heading2 { heading_2 } => {
            format!("## {}", render_rich_text(&heading_2.rich_text))
        }
        BlockKind::Heading3 { heading_3 } => {
            format!("### {}", render_rich_text(&heading_3.rich_text))
        }
        BlockKind::BulletedListItem { bulleted_list_item } => list_item(
            "- ",
            render_rich_text(&bulleted_list_item.rich_text),
            &block.children,
        ),
        BlockKind::NumberedListItem { numbered_list_item } => list_item(
            &format!("{number}. "),
            render_rich_text(&numbered_list_item.rich_text),
            &block.children,
        ),
        BlockKind::ToDo { to_do } => {
            let marker = if to_do.checked { "- [x] " } else { "- [ ] " };
            list_item(marker, render_rich_text(&to_do.rich_text), &block.children)
        }
        BlockKind::Toggle { toggle } => {
            let summary = render_rich_text(&toggle.rich_text);
            let body = render_blocks(&block.children);
            if body.is_empty() {
                format!("<details>\n<summary>{summary}</summary>\n</details>")
            } else {
                format!("<details>\n<summary>{summary}</summary>\n\n{body}\n\n</details>")
            }
        }
        BlockKind::Quote { quote } => quoted(&with_children(
            render_rich_text(&quote.rich_text),
            &block.children,
        )),
        BlockKind::Callout { callout } => {
            let emoji = callout
                .icon
                .as_ref()
                .map(crate::model::Media::resolve)
                .filter(|icon| !icon.starts_with("http"))
                .unwrap_or_default();
            let text = render_rich_text(&callout.rich_text);
            let head = if emoji.is_empty() {
                text
            } else {
                format!("{emoji} {text}")
            };
            quoted(&with_children(head, &block.children))
        }
        BlockKind::Code { code } => {
            let language = match code.language.as_str() {
                "plain text" => "",
                other => other,
            };
            format!("```{language}\n{}\n```", plain_text(&code.rich_text))
        }
        BlockKind::Divider {} => "---".to_string(),
        BlockKind::Image { image } => {
            format!("![{}]({})", plain_text(&image.caption), image.url())
        }
        BlockKind::Video { video: media }
        | BlockKind::File { file: media }
        | BlockKind::Pdf { pdf: media } => {
            let url = media.url();
            if url.is_empty() {
                return String::new();
            }
            let caption = plain_text(&media.caption);
            let label = if caption.is_empty() { url } else { caption.as_str() };
            format!("[{label}]({url})")
        }
        BlockKind::Bookmark { bookmark: link }
        | BlockKind::Embed { embed: link }
        | BlockKind::LinkPreview { link_preview: link } => {
            if link.url.is_empty() {
                return String::new();
            }
            let caption = plain_text(&link.caption);
            let label = if caption.is_empty() {
                link.url.as_str()
            } else {
                caption.as_str()
            };
            format!("[{label}]({})", link.url)
        }
        BlockKind::Equation { equation } => format!("$$\n{}\n$$", equation.expression),
        BlockKind::ChildPage { child_page } => format!("**{}**", child_page.title),
        BlockKind::Table {} => render_table(&block.children),
        BlockKind::TableRow { .. } | BlockKind::Unsupported => String::new(),
    }
}

fn with_children(head: String, children: &[Block]) -> String {
    if children.is_empty() {
        return head;
    }
    let body = render_blocks(children);
    if head.is_empty() {
        body
    } else {
        format!("{head}\n\n{body}")
    }
}

fn list_item(marker: &str, text: String, children: &[Block]) -> String {
    let line = format!("{marker}{text}");
    if children.is_empty() {
        return line;
    }
    let indent = " ".repeat(marker.chars().count().min(4));
    format!("{line}\n{}", indent_lines(&render_blocks(children), &indent))
}

fn indent_lines(text: &str, indent: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{indent}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn quoted(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                ">".to_string()
            } else {
                format!("> {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_table(rows: &[Block]) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .filter_map(|row| match &row.kind {
            BlockKind::TableRow { table_row } => Some(
                table_row
                    .cells
                    .iter()
                    .map(|cell| render_rich_text(cell).replace('|', "\\|"))
                    .collect(),
            ),
            _ => None,
        })
        .collect();
    let Some(header) = rows.first() else {
        return String::new();
    };

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(format!("| {} |", header.join(" | ")));
    lines.push(format!(
        "| {} |",
        header.iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
    ));
    for row in &rows[1..] {
        lines.push(format!("| {} |", row.join(" | ")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block(value: Value) -> Block {
        Block::from_json(&value)
    }

    fn text(kind: &str, content: &str) -> Block {
        block(json!({
            "object": "block",
            "id": format!("{kind}-{content}"),
            "type": kind,
            "has_children": false,
            kind: {"rich_text": [{"type": "text", "plain_text": content}]}
        }))
    }

    #[test]
    fn headings_and_paragraphs_are_separated_by_blank_lines() {
        let blocks = vec![
            text("heading_1", "Title"),
            text("paragraph", "Intro"),
            text("heading_2", "Part"),
            text("heading_3", "Sub"),
        ];
        assert_eq!(render_blocks(&blocks), "# Title\n\nIntro\n\n## Part\n\n### Sub");
    }

    #[test]
    fn lists_are_tight_and_numbering_restarts() {
        let blocks = vec![
            text("bulleted_list_item", "one"),
            text("bulleted_list_item", "two"),
            text("paragraph", "break"),
            text("numbered_list_item", "first"),
            text("numbered_list_item", "second"),
            text("paragraph", "again"),
            text("numbered_list_item", "restart"),
        ];
        assert_eq!(
            render_blocks(&blocks),
            "- one\n- two\n\nbreak\n\n1. first\n2. second\n\nagain\n\n1. restart"
        );
    }

    #[test]
    fn nested_list_children_are_indented() {
        let mut parent = text("bulleted_list_item", "parent");
        parent.has_children = true;
        parent.children = vec![text("bulleted_list_item", "child")];
        assert_eq!(render_blocks(&[parent]), "- parent\n  - child");
    }

    #[test]
    fn annotations_wrap_text() {
        let segments: Vec<RichText> = serde_json::from_value(json!([
            {"type": "text", "plain_text": "bold", "annotations": {"bold": true}},
            {"type": "text", "plain_text": " and "},
            {"type": "text", "plain_text": "code", "annotations": {"code": true}},
            {"type": "text", "plain_text": " "},
            {"type": "text", "plain_text": "link", "href": "https://example.com"},
            {"type": "equation", "plain_text": "x^2"}
        ]))
        .unwrap();
        assert_eq!(
            render_rich_text(&segments),
            "**bold** and `code` [link](https://example.com)$x^2$"
        );
    }

    #[test]
    fn surrounding_spaces_stay_outside_markers() {
        let segments: Vec<RichText> = serde_json::from_value(json!([
            {"type": "text", "plain_text": "Say "},
            {"type": "text", "plain_text": "bold ", "annotations": {"bold": true}},
            {"type": "text", "plain_text": " it", "annotations": {"italic": true}},
            {"type": "text", "plain_text": "  both  ", "annotations": {"bold": true, "strikethrough": true}}
        ]))
        .unwrap();
        assert_eq!(
            render_rich_text(&segments),
            "Say **bold**  _it_  ~~**both**~~  "
        );
    }

    #[test]
    fn code_todo_divider_and_image() {
        let blocks = vec![
            block(json!({"type": "code", "code": {
                "rich_text": [{"plain_text": "fn main() {}"}], "language": "rust"}})),
            block(json!({"type": "to_do", "to_do": {
                "rich_text": [{"plain_text": "ship it"}], "checked": true}})),
            block(json!({"type": "divider", "divider": {}})),
            block(json!({"type": "image", "image": {
                "type": "external", "external": {"url": "https://img/a.png"},
                "caption": [{"plain_text": "diagram"}]}})),
        ];
        assert_eq!(
            render_blocks(&blocks),
            "```rust\nfn main() {}\n```\n\n- [x] ship it\n\n---\n\n![diagram](https://img/a.png)"
        );
    }

    #[test]
    fn quotes_and_callouts_prefix_every_line() {
        let blocks = vec![
            text("quote", "wise words"),
            block(json!({"type": "callout", "callout": {
                "rich_text": [{"plain_text": "heads up"}],
                "icon": {"type": "emoji", "emoji": "💡"}}})),
        ];
        assert_eq!(render_blocks(&blocks), "> wise words\n\n> 💡 heads up");
    }

    #[test]
    fn tables_render_header_separator() {
        let mut table = block(json!({"type": "table", "has_children": true, "table": {"table_width": 2}}));
        table.children = vec![
            block(json!({"type": "table_row", "table_row": {"cells": [
                [{"plain_text": "lang"}], [{"plain_text": "year"}]]}})),
            block(json!({"type": "table_row", "table_row": {"cells": [
                [{"plain_text": "rust"}], [{"plain_text": "2015"}]]}})),
        ];
        assert_eq!(
            render_blocks(&[table]),
            "| lang | year |\n| --- | --- |\n| rust | 2015 |"
        );
    }

    #[test]
    fn unsupported_blocks_render_nothing() {
        let blocks = vec![
            block(json!({"type": "synced_block", "synced_block": {}})),
            text("paragraph", "kept"),
            block(json!({"type": "paragraph", "paragraph": "garbage"})),
        ];
        assert_eq!(render_blocks(&blocks), "kept");
    }
}
