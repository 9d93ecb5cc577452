//! Server-side view encoders.
//!
//! These are the per-player adapters that translate engine callbacks into
//! wire bytes. Each maintains a diff cache so that redundant updates are
//! suppressed: the dungeon view remembers which squares each observer has
//! seen, the mini-map coalesces colour runs and memoises knight locations,
//! and the status display is a stateless passthrough.
//!
//! All cache state is serializable so it can travel inside replicated-VM
//! snapshots; the ordered maps keep those snapshots canonical.

mod dungeon;
mod minimap;
mod sink;
mod status;

pub use dungeon::DungeonViewState;
pub use minimap::MiniMapState;
pub use sink::ViewSink;
