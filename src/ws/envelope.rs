use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved message type whose handlers receive every inbound envelope.
pub const WILDCARD: &str = "*";

/// Inbound wire message: a required `type` tag plus an arbitrary body.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    /// Logical message kind
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Every other top-level field of the frame
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Envelope {
    #[must_use]
    pub fn new(msg_type: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            msg_type: msg_type.into(),
            body,
        }
    }

    /// The frame as received, `type` included.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut full = self.body.clone();
        full.insert("type".to_owned(), Value::String(self.msg_type.clone()));
        Value::Object(full)
    }

    /// Split into the type tag and the remaining fields.
    #[must_use]
    pub fn into_parts(self) -> (String, Value) {
        (self.msg_type, Value::Object(self.body))
    }
}

/// Outbound wire message, serialized as `{"type": .., "payload": ..}`.
#[derive(Debug, Serialize)]
pub(crate) struct OutboundEnvelope<'a, P: Serialize + ?Sized> {
    #[serde(rename = "type")]
    pub msg_type: &'a str,
    pub payload: &'a P,
}
