//! Protocol-level errors.

use crate::localization::LocalKey;

/// Raised when a value is out of the expected range, or the data stream
/// ends unexpectedly.
///
/// Every variant maps to a localization key; the dispatch layer turns that
/// key into a `ServerError` wire message for the offending connection and
/// then closes it. Protocol errors are never propagated to other
/// connections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The stream ended in the middle of a message.
    #[error("unexpected end of data")]
    UnexpectedEnd,

    /// A field held a value outside its permitted range.
    #[error("value out of range: {0}")]
    OutOfRange(&'static str),

    /// Anything else; carries the localization key sent to the client.
    #[error("protocol error: {}", .0.as_str())]
    Bad(LocalKey),
}

impl ProtocolError {
    /// Creates an error from a localization key.
    pub fn key(key: &str) -> Self {
        ProtocolError::Bad(LocalKey::new(key))
    }

    /// The localization key reported to the offending client.
    pub fn local_key(&self) -> LocalKey {
        match self {
            ProtocolError::UnexpectedEnd => LocalKey::new("eof_on_socket"),
            ProtocolError::OutOfRange(_) => LocalKey::new("value_out_of_range"),
            ProtocolError::Bad(key) => key.clone(),
        }
    }
}
