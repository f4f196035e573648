//! Core traits for the WebSocket layer.

use serde_json::error::Category;

use super::envelope::Envelope;
use super::error::WsError;

/// Message parser trait for converting raw frame bytes into an [`Envelope`].
///
/// A frame that fails to parse is logged and dropped by the connection; it
/// never closes the channel.
///
/// # Example
///
/// ```ignore
/// pub struct PrefixedParser;
///
/// impl MessageParser for PrefixedParser {
///     fn parse(&self, bytes: &[u8]) -> crate::Result<Envelope> {
///         JsonEnvelopeParser.parse(bytes.strip_prefix(b"data:").unwrap_or(bytes))
///     }
/// }
/// ```
pub trait MessageParser: Send + Sync + 'static {
    /// Parse incoming bytes into one envelope.
    fn parse(&self, bytes: &[u8]) -> crate::Result<Envelope>;
}

/// Parses each frame as one JSON object carrying a string `type`.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEnvelopeParser;

impl MessageParser for JsonEnvelopeParser {
    fn parse(&self, bytes: &[u8]) -> crate::Result<Envelope> {
        serde_json::from_slice(bytes).map_err(|e| match e.classify() {
            // Well-formed JSON that is not an object with a string `type`
            Category::Data => WsError::InvalidMessage(e.to_string()).into(),
            _ => WsError::MessageParse(e).into(),
        })
    }
}
