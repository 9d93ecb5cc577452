//! VM-layer errors.

/// Errors from the tick codec or VM execution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    /// Tick frame too short, length overflow, unknown message kind.
    #[error("tick data format error: {0}")]
    TickFormat(&'static str),

    /// A tick message referenced a client number with no (or the wrong)
    /// connection state.
    #[error("bad client number {0}")]
    BadClientNumber(u8),

    /// The simulated server failed; the VM cannot continue.
    #[error("knights game simulation failed: {0}")]
    SimulationFailed(String),

    /// Snapshot bytes could not be decoded.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Sync protocol misuse (duplicate config, block before config, ...).
    #[error("sync error: {0}")]
    Sync(&'static str),
}
