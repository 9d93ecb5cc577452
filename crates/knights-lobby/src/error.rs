//! Lobby and sync errors.

use knights_protocol::ProtocolError;
use knights_transport::TransportError;
use knights_vm::VmError;

/// Errors in the replication layer.
///
/// Sync errors disconnect the offending peer; a follower restarts its
/// sync from scratch by reconnecting. A detected desync is fatal for the
/// local replica because it would only diverge further.
#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error("bad message from peer: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("sync error: {0}")]
    Sync(&'static str),

    #[error("compression error: {0}")]
    Compression(&'static str),

    /// Checksum mismatch at the same VM time on both replicas.
    #[error("desync detected at vm time {timer_ms} ms")]
    Desync { timer_ms: u32 },
}
