// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Journal records and the payloads built from them.
//!
//! A [`LogRecord`] is whatever the journal handed us: an ordered, open-ended map of
//! field name to JSON value. Only three fields are known to the pipeline (the origin
//! tag and the owning user/group ids) and they get typed accessors; everything else
//! is carried through untouched.
//!
//! An [`EnrichedPayload`] is the delivery form of a record: the same fields rendered
//! as strings plus the resolved `UserName` / `GroupName`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field naming the subsystem that emitted the record.
pub const ORIGIN_FIELD: &str = "SYSLOG_IDENTIFIER";
/// Numeric id of the user owning the emitting process.
pub const UID_FIELD: &str = "_UID";
/// Numeric id of the group owning the emitting process.
pub const GID_FIELD: &str = "_GID";
/// Synthesized field holding the resolved user name.
pub const USER_NAME_FIELD: &str = "UserName";
/// Synthesized field holding the resolved group name.
pub const GROUP_NAME_FIELD: &str = "GroupName";

/// A single structured journal entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogRecord {
    fields: Map<String, Value>,
}

impl LogRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly useful when constructing records by hand.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// The origin tag, if present and textual.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.fields.get(ORIGIN_FIELD).and_then(Value::as_str)
    }

    /// Owning user id. `None` when the field is missing or not an integer in `u32` range.
    #[must_use]
    pub fn uid(&self) -> Option<u32> {
        self.fields.get(UID_FIELD).and_then(parse_id)
    }

    /// Owning group id. Same parsing rules as [`LogRecord::uid`].
    #[must_use]
    pub fn gid(&self) -> Option<u32> {
        self.fields.get(GID_FIELD).and_then(parse_id)
    }

    /// Iterates fields in source order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for LogRecord {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for LogRecord {
    type Item = (String, Value);
    type IntoIter = serde_json::map::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// journalctl emits ids as strings, hand-built records often use numbers.
fn parse_id(value: &Value) -> Option<u32> {
    match value {
        Value::String(s) => s.trim().parse::<u32>().ok(),
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        _ => None,
    }
}

/// Renders a journal value as text.
///
/// Strings are kept verbatim. `journalctl --output=json` encodes fields that are not
/// valid UTF-8 as an array of byte values, so those are decoded lossily rather than
/// shipped as a list of numbers. Anything else becomes its compact JSON text.
#[must_use]
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) if !items.is_empty() => match as_bytes(items) {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

fn as_bytes(items: &[Value]) -> Option<Vec<u8>> {
    items
        .iter()
        .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect()
}

/// A record ready to be posted to the collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnrichedPayload {
    fields: Map<String, Value>,
}

impl EnrichedPayload {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Map::with_capacity(capacity),
        }
    }

    pub(crate) fn insert(&mut self, name: String, value: String) {
        self.fields.insert(name, Value::String(value));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.get(ORIGIN_FIELD)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
