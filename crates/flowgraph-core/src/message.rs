use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use uuid::Uuid;

/// The three closed categories a [`Message`] can belong to.
///
/// `Control` messages carry scheduler/node lifecycle instructions and
/// are never subject to drop/replace/coalesce overflow policies.
/// `Error` messages carry a node's own failure reports downstream.
/// `Data` is everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Data,
    Control,
    Error,
}

/// Structural headers carried by every message: a trace id used to
/// correlate a message across the nodes that forward or derive from it,
/// and the wall-clock time the message was constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Headers {
    pub trace_id: String,
    pub timestamp: SystemTime,
    extra: AHashMap<String, String>,
}

impl Headers {
    fn new(trace_id: Option<String>) -> Self {
        Self {
            trace_id: trace_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: SystemTime::now(),
            extra: AHashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    pub fn timestamp_unix_secs(&self) -> f64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// A set of header overrides to apply with [`Message::with_headers`].
///
/// `trace_id: None` means "keep whatever trace id the message already
/// has"; it is not possible to erase a trace id once set.
#[derive(Debug, Clone, Default)]
pub struct HeaderOverrides {
    pub trace_id: Option<String>,
    pub extra: AHashMap<String, String>,
}

impl HeaderOverrides {
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// The value carried by a [`Message`].
///
/// Closed over the shapes a node graph actually needs to move around;
/// `Json` and `Any` are escape hatches for payloads too irregular for
/// the other variants.
#[derive(Debug, Clone)]
pub enum Payload {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Payload {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Payload::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Payload::Float(v) => Some(*v),
            Payload::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// An immutable unit of data flowing through the graph.
///
/// A `Message` is never mutated after construction; `with_headers`
/// and `with_payload` produce a new message rather than modifying the
/// receiver, so a node can safely forward a reference to the same
/// message to more than one output port.
#[derive(Debug, Clone)]
pub struct Message {
    kind: MessageKind,
    payload: Payload,
    headers: Headers,
    metadata: Option<serde_json::Value>,
}

impl Message {
    pub fn new(kind: MessageKind, payload: Payload) -> Self {
        Self {
            kind,
            payload,
            headers: Headers::new(None),
            metadata: None,
        }
    }

    pub fn data(payload: Payload) -> Self {
        Self::new(MessageKind::Data, payload)
    }

    pub fn control(payload: Payload) -> Self {
        Self::new(MessageKind::Control, payload)
    }

    pub fn error(payload: Payload) -> Self {
        Self::new(MessageKind::Error, payload)
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_data(&self) -> bool {
        self.kind == MessageKind::Data
    }

    pub fn is_control(&self) -> bool {
        self.kind == MessageKind::Control
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }

    pub fn trace_id(&self) -> &str {
        &self.headers.trace_id
    }

    /// Returns a new message with `overrides` merged into the existing
    /// headers. The original message is left untouched.
    pub fn with_headers(&self, overrides: HeaderOverrides) -> Self {
        let mut headers = self.headers.clone();
        if let Some(trace_id) = overrides.trace_id {
            headers.trace_id = trace_id;
        }
        for (k, v) in overrides.extra {
            headers.extra.insert(k, v);
        }
        Self {
            kind: self.kind,
            payload: self.payload.clone(),
            headers,
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_headers_does_not_mutate_original() {
        let msg = Message::data(Payload::Int(1));
        let original_trace = msg.trace_id().to_string();

        let derived = msg.with_headers(HeaderOverrides::default().with_trace_id("abc"));

        assert_eq!(msg.trace_id(), original_trace);
        assert_eq!(derived.trace_id(), "abc");
    }

    #[test]
    fn with_headers_keeps_trace_id_when_not_overridden() {
        let msg = Message::data(Payload::Unit);
        let derived = msg.with_headers(HeaderOverrides::default().with_extra("k", "v"));
        assert_eq!(derived.trace_id(), msg.trace_id());
        assert_eq!(derived.headers().get("k"), Some("v"));
    }

    #[test]
    fn every_message_has_a_trace_id_and_timestamp() {
        let msg = Message::data(Payload::Bool(true));
        assert!(!msg.trace_id().is_empty());
        assert!(msg.headers().timestamp_unix_secs() > 0.0);
    }

    proptest::proptest! {
        #[test]
        fn trace_id_is_always_non_empty(v in proptest::prelude::any::<i64>()) {
            let msg = Message::data(Payload::Int(v));
            proptest::prop_assert!(!msg.trace_id().is_empty());
        }

        #[test]
        fn with_headers_is_idempotent_for_identical_overrides(trace in "[a-z0-9]{1,12}", v in proptest::prelude::any::<i64>()) {
            let msg = Message::data(Payload::Int(v));
            let once = msg.with_headers(HeaderOverrides::default().with_trace_id(trace.clone()));
            let twice = once.with_headers(HeaderOverrides::default().with_trace_id(trace));
            proptest::prop_assert_eq!(once.headers(), twice.headers());
        }
    }
}
