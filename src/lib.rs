//! Room-scoped WebRTC signaling: the relay that routes negotiation messages
//! between members of a room, and the client orchestrator that drives one
//! peer connection per remote member.

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod rtc;
pub mod signaling;
pub mod transport;

pub use error::{Error, Result};
pub use events::{Notifier, SessionEvent};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use protocol::{ClientMessage, ParticipantId, RelayMessage};
pub use relay::{RelayHandle, RelayRouter, RelayServer};
