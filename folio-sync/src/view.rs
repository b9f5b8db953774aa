//! Materialized view: denormalized fields derived from a document's CRDT
//! state. A cache, recomputed by the collector, never authoritative.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use yrs::types::ToJson;
use yrs::{Any, GetString, ReadTxn, Transact};

use crate::document::{SyncDocument, ROOT_ATTRS, ROOT_BODY, ROOT_SHAPES};

/// Schema a document follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKind {
    /// Rich-text body plus attributes.
    Post,
    /// Shape map plus attributes.
    Canvas,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Post => "post",
            DocumentKind::Canvas => "canvas",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasShape {
    pub id: String,
    /// Value of the shape's `type` key.
    pub kind: String,
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedView {
    pub kind: DocumentKind,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub text: String,
    /// Non-whitespace characters in `text`.
    pub character_count: u64,
    /// Byte length of the canonical update.
    pub blob_size: u64,
    pub attributes: BTreeMap<String, Value>,
    pub shapes: Vec<CanvasShape>,
    pub updated_at: DateTime<Utc>,
}

/// Characters added and removed between two revisions of a text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacterDelta {
    pub additions: u64,
    pub deletions: u64,
}

impl CharacterDelta {
    pub fn is_empty(&self) -> bool {
        self.additions == 0 && self.deletions == 0
    }
}

/// Render the view for `document` as of `updated_at`.
pub fn render(
    document: &SyncDocument,
    kind: DocumentKind,
    updated_at: DateTime<Utc>,
) -> MaterializedView {
    let attributes = read_map(document, ROOT_ATTRS);
    let title = string_attr(&attributes, "title");
    let subtitle = string_attr(&attributes, "subtitle");

    let (text, shapes) = match kind {
        DocumentKind::Post => (plain_text(document), Vec::new()),
        DocumentKind::Canvas => (String::new(), canvas_shapes(document)),
    };
    let character_count = count_characters(&text);

    MaterializedView {
        kind,
        title,
        subtitle,
        text,
        character_count,
        blob_size: document.encode_state().len() as u64,
        attributes,
        shapes,
        updated_at,
    }
}

/// Plain text of the document body; empty when the body was never written.
pub fn plain_text(document: &SyncDocument) -> String {
    let txn = document.doc().transact();
    txn.get_text(ROOT_BODY)
        .map(|body| body.get_string(&txn))
        .unwrap_or_default()
}

pub fn count_characters(text: &str) -> u64 {
    text.chars().filter(|c| !c.is_whitespace()).count() as u64
}

/// Character delta between two revisions, trimming the common prefix and suffix.
pub fn character_delta(before: &str, after: &str) -> CharacterDelta {
    let before: Vec<char> = before.chars().collect();
    let after: Vec<char> = after.chars().collect();

    let prefix = before
        .iter()
        .zip(after.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = before.len().min(after.len()) - prefix;
    let suffix = before
        .iter()
        .rev()
        .zip(after.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let common = prefix + suffix;
    CharacterDelta {
        additions: (after.len() - common) as u64,
        deletions: (before.len() - common) as u64,
    }
}

fn canvas_shapes(document: &SyncDocument) -> Vec<CanvasShape> {
    read_map(document, ROOT_SHAPES)
        .into_iter()
        .map(|(id, value)| {
            let mut attributes = match strip_nul(value) {
                Value::Object(fields) => fields.into_iter().collect::<BTreeMap<_, _>>(),
                other => BTreeMap::from([("value".to_string(), other)]),
            };
            let kind = match attributes.remove("type") {
                Some(Value::String(kind)) => kind,
                _ => String::from("unknown"),
            };
            CanvasShape {
                id: id.replace('\0', ""),
                kind,
                attributes,
            }
        })
        .collect()
}

fn read_map(document: &SyncDocument, name: &str) -> BTreeMap<String, Value> {
    let txn = document.doc().transact();
    match txn.get_map(name).map(|map| map.to_json(&txn)) {
        Some(Any::Map(entries)) => entries
            .iter()
            .map(|(key, value)| (key.clone(), any_to_json(value)))
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn string_attr(attributes: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    attributes
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(n) => Value::from(*n),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), any_to_json(value)))
                .collect(),
        ),
    }
}

fn strip_nul(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace('\0', "")),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nul).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key.replace('\0', ""), strip_nul(value)))
                .collect(),
        ),
        other => other,
    }
}
