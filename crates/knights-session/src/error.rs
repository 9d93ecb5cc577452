//! Session-level errors.

use knights_protocol::LocalKey;

/// Errors raised by session operations.
///
/// `JoinDenied` carries the localization key sent back in a
/// `JoinGameDenied` message; the other variants indicate caller bugs or a
/// session that has already failed fatally.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("join denied: {}", .0.as_str())]
    JoinDenied(LocalKey),

    #[error("no such connection in this game")]
    NoSuchConnection,

    #[error("session failed fatally: {0}")]
    Fatal(String),
}

impl SessionError {
    pub fn denied(key: &str) -> Self {
        SessionError::JoinDenied(LocalKey::new(key))
    }
}
