//! Server-level errors.

/// Errors from server-wide operations (not per-connection protocol
/// errors, which are answered on the wire instead).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerError {
    #[error("game name not set")]
    EmptyGameName,

    #[error("a game named {0:?} already exists")]
    DuplicateGameName(String),

    #[error("configuration loader failed: {0}")]
    ConfigLoader(String),

    #[error("snapshot is corrupt: {0}")]
    BadSnapshot(String),
}
