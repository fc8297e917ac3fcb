//! Knowledge synchronization between peers.
//!
//! Outbound: modified globals are packed into an [`UpdateMessage`] and
//! handed to a [`Transport`]. Inbound: frames are decoded, filtered per
//! message and merged per key by [`process_message`].

mod memory;
mod merge;
mod message;
mod transport;

pub use memory::{InMemoryBus, InMemoryTransport};
pub use merge::{apply_update, MergeStats, MergeStatsSnapshot, UpdateOrigin, UpdateOutcome};
pub use message::{UpdateMessage, MAGIC, MESSAGE_UPDATE, WIRE_VERSION};
pub use transport::{process_message, DropReason, ReceiveReport, Transport, TransportSettings};
