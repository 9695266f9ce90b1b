//! Client-side per-peer negotiation records.

mod entry;
mod state;
mod table;

pub use entry::PeerEntry;
pub use state::NegotiationState;
pub use table::PeerTable;
