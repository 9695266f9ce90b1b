//! Room membership on the relay side.

mod registry;

pub use registry::{RelayChannel, RoomRegistry};
