//! # Event
//!
//! The unit handed to the pipeline: a JSON object built by a [`Decoder`],
//! then enriched by decoration and the subscription loop.
//!
//! [`Decoder`]: crate::codec::Decoder
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// field holding the subject a message was delivered on
pub const NATS_SUBJECT: &str = "nats_subject";
/// field holding the ingestion time
pub const TIMESTAMP: &str = "@timestamp";
/// field holding the event tags
pub const TAGS: &str = "tags";
/// field holding the event type
pub const TYPE: &str = "type";
/// field holding raw text for codecs that don't produce structure
pub const MESSAGE: &str = "message";

/// A structured event: field name to JSON value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event {
    fields: Map<String, Value>,
}

impl Event {
    /// empty event
    pub fn new() -> Self {
        Self::default()
    }

    /// event with a single `message` field
    pub fn from_message<S: Into<String>>(msg: S) -> Self {
        let mut event = Self::new();
        event.set(MESSAGE, Value::String(msg.into()));
        event
    }

    /// get a field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// set a field, returning the previous value if any
    pub fn set<K: Into<String>, V: Into<Value>>(&mut self, field: K, value: V) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    /// set a field only if it is not present yet
    pub fn set_if_absent<K: Into<String>, V: Into<Value>>(&mut self, field: K, value: V) {
        self.fields.entry(field).or_insert_with(|| value.into());
    }

    /// does the event have this field
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// true if the event has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// add a tag to the `tags` array, skipping duplicates. A non-array `tags`
    /// value is turned into an array holding the old value first.
    pub fn tag<S: AsRef<str>>(&mut self, tag: S) {
        let tag = tag.as_ref();
        let tags = self
            .fields
            .entry(TAGS)
            .or_insert_with(|| Value::Array(Vec::new()));
        if !tags.is_array() {
            let old = tags.take();
            *tags = Value::Array(vec![old]);
        }
        if let Value::Array(tags) = tags {
            if !tags.iter().any(|t| t.as_str() == Some(tag)) {
                tags.push(Value::String(tag.to_owned()));
            }
        }
    }

    /// borrow the underlying map
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl From<Map<String, Value>> for Event {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.fields) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}
