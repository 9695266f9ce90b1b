use std::fmt;

use serde::{Deserialize, Serialize};

/// Negotiation progress of one peer connection entry.
///
/// `Renegotiating` is only visible internally: a peer that was announced as
/// connected stays connected to application code while its handle is being
/// replaced and re-offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NegotiationState {
    Created,
    Offering,
    Answering,
    Stable,
    Renegotiating,
    Closed,
}

impl NegotiationState {
    /// An offer/answer exchange is in flight; new triggers must wait.
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            NegotiationState::Offering | NegotiationState::Answering | NegotiationState::Renegotiating
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Created => write!(f, "Created"),
            NegotiationState::Offering => write!(f, "Offering"),
            NegotiationState::Answering => write!(f, "Answering"),
            NegotiationState::Stable => write!(f, "Stable"),
            NegotiationState::Renegotiating => write!(f, "Renegotiating"),
            NegotiationState::Closed => write!(f, "Closed"),
        }
    }
}
