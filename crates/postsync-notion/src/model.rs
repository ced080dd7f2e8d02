//! Raw Notion page shapes, read leniently so one odd page cannot fail a batch.

use serde::Deserialize;
use serde_json::{Map, Value};

/// A Notion database page as returned by the query endpoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceRecord {
    pub id: String,
    pub last_edited_time: String,
    pub cover: Value,
    pub icon: Value,
    pub properties: Map<String, Value>,
    /// Markdown body, filled in after the content fetch.
    pub content: String,
}

impl SourceRecord {
    /// Returns `None` for non-page results and pages without an id.
    pub fn from_page(value: &Value) -> Option<Self> {
        if value.get("object").and_then(Value::as_str) != Some("page") {
            return None;
        }
        let id = value.get("id").and_then(Value::as_str)?.to_string();
        Some(Self {
            id,
            last_edited_time: value
                .get("last_edited_time")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            cover: value.get("cover").cloned().unwrap_or(Value::Null),
            icon: value.get("icon").cloned().unwrap_or(Value::Null),
            properties: value
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            content: String::new(),
        })
    }

    pub fn with_content(mut self, markdown: String) -> Self {
        self.content = markdown;
        self
    }

    pub fn property(&self, name: &str) -> PropertyValue {
        PropertyValue::from_json(self.properties.get(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct Annotations {
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default)]
    pub strikethrough: bool,
    #[serde(default)]
    pub underline: bool,
    #[serde(default)]
    pub code: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct RichText {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub plain_text: String,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub annotations: Annotations,
}

pub fn plain_text(segments: &[RichText]) -> String {
    segments.iter().map(|s| s.plain_text.as_str()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SelectOption {
    #[serde(default)]
    pub name: String,
}

/// One database property, discriminated by its `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyValue {
    Title {
        #[serde(default)]
        title: Vec<RichText>,
    },
    RichText {
        #[serde(default)]
        rich_text: Vec<RichText>,
    },
    Date {
        #[serde(default)]
        date: Option<DateRange>,
    },
    LastEditedTime {
        #[serde(default)]
        last_edited_time: String,
    },
    MultiSelect {
        #[serde(default)]
        multi_select: Vec<SelectOption>,
    },
    Select {
        #[serde(default)]
        select: Option<SelectOption>,
    },
    #[serde(skip)]
    Absent,
    #[serde(other)]
    Unsupported,
}

impl PropertyValue {
    /// Malformed payloads of a known kind degrade to `Unsupported`.
    pub fn from_json(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => PropertyValue::Absent,
            Some(value) => {
                serde_json::from_value(value.clone()).unwrap_or(PropertyValue::Unsupported)
            }
        }
    }

    pub fn text(&self) -> String {
        match self {
            PropertyValue::Title { title } => plain_text(title),
            PropertyValue::RichText { rich_text } => plain_text(rich_text),
            PropertyValue::Date { date } => date
                .as_ref()
                .and_then(|d| d.start.clone())
                .unwrap_or_default(),
            PropertyValue::LastEditedTime { last_edited_time } => last_edited_time.clone(),
            PropertyValue::Select { select } => {
                select.as_ref().map(|s| s.name.clone()).unwrap_or_default()
            }
            PropertyValue::MultiSelect { .. }
            | PropertyValue::Unsupported
            | PropertyValue::Absent => String::new(),
        }
    }

    pub fn list(&self) -> Vec<String> {
        match self {
            PropertyValue::MultiSelect { multi_select } => multi_select
                .iter()
                .map(|option| option.name.clone())
                .collect(),
            PropertyValue::Select { select: Some(option) } if !option.name.is_empty() => {
                vec![option.name.clone()]
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileLink {
    #[serde(default)]
    pub url: String,
}

/// Page cover or icon.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Media {
    External { external: FileLink },
    File { file: FileLink },
    Emoji { emoji: String },
    CustomEmoji { custom_emoji: FileLink },
    #[serde(other)]
    Unsupported,
}

impl Media {
    /// URL for linked media, the glyph itself for emoji, empty otherwise.
    pub fn resolve(value: &Value) -> String {
        if value.is_null() {
            return String::new();
        }
        match serde_json::from_value::<Media>(value.clone()) {
            Ok(Media::External { external }) => external.url,
            Ok(Media::File { file }) => file.url,
            Ok(Media::Emoji { emoji }) => emoji,
            Ok(Media::CustomEmoji { custom_emoji }) => custom_emoji.url,
            Ok(Media::Unsupported) | Err(_) => String::new(),
        }
    }
}
