//! API response model and its JSON, XML and HTML renderings

use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde_json::{Map, Value};

/// Structured result of an API view or action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiResponse {
    /// A single named value
    Element { name: String, value: String },
    /// A named, ordered sequence
    List { name: String, items: Vec<ApiResponse> },
    /// Named fields, in insertion order
    Set {
        name: String,
        entries: Vec<(String, ApiResponse)>,
    },
}

impl ApiResponse {
    pub fn element(name: &str, value: impl ToString) -> Self {
        ApiResponse::Element {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    pub fn list(name: &str, items: Vec<ApiResponse>) -> Self {
        ApiResponse::List {
            name: name.to_string(),
            items,
        }
    }

    pub fn set(name: &str, entries: Vec<(&str, ApiResponse)>) -> Self {
        ApiResponse::Set {
            name: name.to_string(),
            entries: entries
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        }
    }

    /// The conventional reply to a successful action.
    pub fn ok() -> Self {
        Self::element("Result", "OK")
    }

    pub fn name(&self) -> &str {
        match self {
            ApiResponse::Element { name, .. }
            | ApiResponse::List { name, .. }
            | ApiResponse::Set { name, .. } => name,
        }
    }

    /// The value alone, without the element name.
    pub fn to_value(&self) -> Value {
        match self {
            ApiResponse::Element { value, .. } => Value::String(value.clone()),
            ApiResponse::List { items, .. } => Value::Array(items.iter().map(Self::to_value).collect()),
            ApiResponse::Set { entries, .. } => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_value());
                }
                Value::Object(map)
            }
        }
    }

    /// JSON body: the value wrapped in an outer array.
    pub fn to_json(&self) -> String {
        Value::Array(vec![self.to_value()]).to_string()
    }

    /// XML document whose root element is named `root`.
    pub fn to_xml(&self, root: &str) -> quick_xml::Result<String> {
        xml_document(|writer| self.write_xml(root, writer))
    }

    fn write_xml(&self, tag: &str, writer: &mut XmlWriter) -> quick_xml::Result<()> {
        let start = open_tag(tag);
        match self {
            ApiResponse::Element { value, .. } => write_text_element(writer, start, value),
            ApiResponse::List { items, .. } if items.is_empty() => writer.write_event(Event::Empty(start)),
            ApiResponse::Set { entries, .. } if entries.is_empty() => writer.write_event(Event::Empty(start)),
            ApiResponse::List { items, .. } => {
                let end = start.to_end().into_owned();
                writer.write_event(Event::Start(start))?;
                for item in items {
                    item.write_xml(item.name(), writer)?;
                }
                writer.write_event(Event::End(end))
            }
            ApiResponse::Set { entries, .. } => {
                let end = start.to_end().into_owned();
                writer.write_event(Event::Start(start))?;
                for (key, value) in entries {
                    value.write_xml(key, writer)?;
                }
                writer.write_event(Event::End(end))
            }
        }
    }

    /// HTML fragment: values as text, lists as `<ul>`, sets as tables.
    pub fn to_html(&self) -> String {
        match self {
            ApiResponse::Element { value, .. } => escape_xml(value),
            ApiResponse::List { items, .. } => {
                let rows: String = items
                    .iter()
                    .map(|item| format!("<li>{}</li>", item.to_html()))
                    .collect();
                format!("<ul>{}</ul>", rows)
            }
            ApiResponse::Set { entries, .. } => {
                let rows: String = entries
                    .iter()
                    .map(|(key, value)| {
                        format!("<tr><td>{}</td><td>{}</td></tr>", escape_xml(key), value.to_html())
                    })
                    .collect();
                format!("<table>{}</table>", rows)
            }
        }
    }
}

/// Minimal head/body shell around an HTML fragment.
pub fn html_page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>{}</title></head><body>{}</body></html>",
        escape_xml(title),
        body
    )
}

pub fn escape_xml(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

pub(crate) type XmlWriter = Writer<Vec<u8>>;

const ENTRY_TAG: &str = "entry";

/// Whether `name` can be used verbatim as an element name.
fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    !name.to_ascii_lowercase().starts_with("xml")
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Start tag for `name`; names that are not valid XML become
/// `<entry key="...">`.
pub(crate) fn open_tag(name: &str) -> BytesStart<'_> {
    if is_xml_name(name) {
        BytesStart::new(name)
    } else {
        let mut start = BytesStart::new(ENTRY_TAG);
        start.push_attribute(("key", name));
        start
    }
}

pub(crate) fn write_text_element(writer: &mut XmlWriter, start: BytesStart<'_>, text: &str) -> quick_xml::Result<()> {
    let end = start.to_end().into_owned();
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(end))
}

/// Writes the UTF-8 declaration, then whatever `body` emits.
pub(crate) fn xml_document<F>(body: F) -> quick_xml::Result<String>
where
    F: FnOnce(&mut XmlWriter) -> quick_xml::Result<()>,
{
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    body(&mut writer)?;
    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}
