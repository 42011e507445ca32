//! # Codecs
//!
//! A [`Decoder`] turns one raw payload into zero or more [`Event`]s. The
//! subscription loop only depends on the trait, the implementations here are
//! the ones selectable from config.
use std::{fmt, str, sync::Arc};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::event::{Event, MESSAGE};

/// Lazy, finite sequence of events decoded from one payload
pub type Events = Box<dyn Iterator<Item = Event> + Send>;

/// Why a payload could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    /// payload was not valid json
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// payload was not valid utf-8
    #[error("invalid utf-8: {0}")]
    Utf8(#[from] str::Utf8Error),
    /// one line of a line-oriented payload was rejected
    #[error("line {line}: {reason}")]
    Line {
        /// 1-based line number
        line: usize,
        /// what was wrong with it
        reason: String,
    },
}

/// Converts a raw payload into events. May fail per message; a failure must
/// not leave any state behind that affects the next payload.
pub trait Decoder: Send + Sync + fmt::Debug + 'static {
    /// codec name, used in logs
    fn name(&self) -> &'static str;
    /// decode `payload`
    fn decode(&self, payload: Bytes) -> Result<Events, DecodeError>;
}

/// Selects a codec from config
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// one json document per payload
    #[default]
    Json,
    /// one json object per line
    JsonLines,
    /// whole payload as `message`
    Plain,
    /// one `message` event per line
    Line,
}

impl CodecKind {
    /// build the decoder for this kind
    pub fn build(self) -> Arc<dyn Decoder> {
        match self {
            CodecKind::Json => Arc::new(JsonCodec),
            CodecKind::JsonLines => Arc::new(JsonLinesCodec),
            CodecKind::Plain => Arc::new(PlainCodec),
            CodecKind::Line => Arc::new(LineCodec),
        }
    }
}

fn value_to_event(value: Value) -> Event {
    match value {
        Value::Object(map) => Event::from(map),
        other => {
            let mut event = Event::new();
            event.set(MESSAGE, other);
            event
        }
    }
}

/// An object becomes one event, an array one event per element. Anything
/// else is wrapped as `message`. Blank payloads produce no events.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Decoder for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, payload: Bytes) -> Result<Events, DecodeError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Box::new(std::iter::empty()));
        }
        Ok(match serde_json::from_slice::<Value>(&payload)? {
            Value::Array(values) => Box::new(values.into_iter().map(value_to_event)),
            value => Box::new(std::iter::once(value_to_event(value))),
        })
    }
}

/// Newline delimited json. Every non-blank line must be an object; one bad
/// line rejects the whole payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesCodec;

impl Decoder for JsonLinesCodec {
    fn name(&self) -> &'static str {
        "json_lines"
    }

    fn decode(&self, payload: Bytes) -> Result<Events, DecodeError> {
        let text = str::from_utf8(&payload)?;
        let events = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(map)) => Ok(Event::from(map)),
                Ok(_) => Err(DecodeError::Line {
                    line: i + 1,
                    reason: "expected a json object".to_owned(),
                }),
                Err(err) => Err(DecodeError::Line {
                    line: i + 1,
                    reason: err.to_string(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::new(events.into_iter()))
    }
}

/// Whole payload as the `message` field, invalid utf-8 replaced
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

impl Decoder for PlainCodec {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn decode(&self, payload: Bytes) -> Result<Events, DecodeError> {
        let msg = String::from_utf8_lossy(&payload).into_owned();
        Ok(Box::new(std::iter::once(Event::from_message(msg))))
    }
}

/// One `message` event per line, produced lazily
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    fn name(&self) -> &'static str {
        "line"
    }

    fn decode(&self, payload: Bytes) -> Result<Events, DecodeError> {
        let text = str::from_utf8(&payload)?.to_owned();
        Ok(Box::new(OwnedLines { text, pos: 0 }.map(Event::from_message)))
    }
}

/// `str::lines` over an owned buffer, so the iterator can outlive the payload
struct OwnedLines {
    text: String,
    pos: usize,
}

impl Iterator for OwnedLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.pos >= self.text.len() {
            return None;
        }
        let rest = &self.text[self.pos..];
        let (line, advance) = match rest.find('\n') {
            Some(idx) => (&rest[..idx], idx + 1),
            None => (rest, rest.len()),
        };
        self.pos += advance;
        Some(line.strip_suffix('\r').unwrap_or(line).to_owned())
    }
}
