//! # Decoration
//!
//! Enrichment applied to every decoded event before it's handed on: type,
//! tags, static fields and the ingestion timestamp.
use std::{collections::BTreeMap, fmt};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Event, TIMESTAMP, TYPE};

/// Opaque enrichment hook run on each event
pub trait Decorator: Send + Sync + fmt::Debug + 'static {
    /// enrich `event` in place
    fn decorate(&self, event: &mut Event);
}

/// Configured decoration. Never overwrites fields the codec produced, except
/// for `tags` which are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Decoration {
    /// value for the `type` field
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// tags appended to `tags`
    #[serde(default)]
    pub tags: Vec<String>,
    /// static fields added when absent
    #[serde(default)]
    pub add_field: BTreeMap<String, Value>,
}

impl Decorator for Decoration {
    fn decorate(&self, event: &mut Event) {
        if let Some(kind) = &self.kind {
            event.set_if_absent(TYPE, kind.as_str());
        }
        for tag in &self.tags {
            event.tag(tag);
        }
        for (field, value) in &self.add_field {
            event.set_if_absent(field.as_str(), value.clone());
        }
        if !event.contains(TIMESTAMP) {
            event.set(
                TIMESTAMP,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        }
    }
}
