//! Firmware debug-data inspector: compact DWARF type/variable info into a
//! dense database, embed it in a target binary, and walk it live over a
//! target's memory-access protocol.

/// The type/variable graph, its structural equality, and deduplication.
pub mod value;
/// Deterministic columnar binary encoding of a `Graph`.
pub mod codec;
/// DWARF-to-graph ingestion.
pub mod dwarf;
/// Client half of the target memory-access protocol.
pub mod transport;
/// Live typed walk over a target's memory through a decoded graph.
pub mod walker;
/// Embeds an encoded table into a reserved region of a target binary.
pub mod patch;

pub use self::value::{Graph, NodeId, ValueTag};
pub use self::walker::Walker;
