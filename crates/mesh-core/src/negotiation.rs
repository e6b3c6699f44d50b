//! Offer/answer negotiation state machine for one peer link.
//!
//! ```text
//!            LocalOffer               RemoteAnswer
//!   New ───────────────▶ HaveLocalOffer ──────────────▶ Stable
//!    │                                                    ▲
//!    │ RemoteOffer                          LocalAnswer   │
//!    └─────────────────▶ HaveRemoteOffer ─────────────────┘
//!
//!   any non-terminal ── Fail ──▶ Failed
//!   any state ──────── Close ──▶ Closed
//! ```
//!
//! The machine is pure and the peer link actor records every state through
//! it, failure and shutdown included: a failed link reports `Failed` and then
//! settles in `Closed` once its transport is released.

use crate::errors::TransitionError;

/// Negotiation state of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// Transport created, no description applied.
    New,
    /// Local offer applied and sent, waiting for the answer.
    HaveLocalOffer,
    /// Remote offer applied, answer not yet applied.
    HaveRemoteOffer,
    /// Both descriptions applied.
    Stable,
    /// Transport released. Terminal.
    Closed,
    /// Negotiation or transport failed. Only `Close` leaves it.
    Failed,
}

/// Inputs that drive the negotiation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationInput {
    /// A locally generated offer was applied.
    LocalOffer,
    /// A remote offer was applied.
    RemoteOffer,
    /// A locally generated answer was applied.
    LocalAnswer,
    /// A remote answer was applied.
    RemoteAnswer,
    /// The link is being closed.
    Close,
    /// A negotiation step or the transport failed.
    Fail,
}

impl NegotiationState {
    /// All states, for exhaustive checks.
    pub const ALL: [NegotiationState; 6] = [
        NegotiationState::New,
        NegotiationState::HaveLocalOffer,
        NegotiationState::HaveRemoteOffer,
        NegotiationState::Stable,
        NegotiationState::Closed,
        NegotiationState::Failed,
    ];

    /// Returns the state as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::New => "new",
            NegotiationState::HaveLocalOffer => "have_local_offer",
            NegotiationState::HaveRemoteOffer => "have_remote_offer",
            NegotiationState::Stable => "stable",
            NegotiationState::Closed => "closed",
            NegotiationState::Failed => "failed",
        }
    }

    /// Whether negotiation can make no further progress.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed)
    }

    /// Whether the remote description has been applied in this state.
    ///
    /// Remote candidates may only be handed to the transport once this holds.
    #[must_use]
    pub const fn has_remote_description(&self) -> bool {
        matches!(
            self,
            NegotiationState::HaveRemoteOffer | NegotiationState::Stable
        )
    }

    /// Apply an input, returning the next state.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when the input is not legal in this state.
    /// `Close` is legal everywhere, so closing is idempotent.
    pub fn apply(self, input: NegotiationInput) -> Result<NegotiationState, TransitionError> {
        use NegotiationInput as I;
        use NegotiationState as S;

        match (self, input) {
            (_, I::Close) => Ok(S::Closed),
            (S::New, I::LocalOffer) => Ok(S::HaveLocalOffer),
            (S::New, I::RemoteOffer) => Ok(S::HaveRemoteOffer),
            (S::HaveRemoteOffer, I::LocalAnswer) => Ok(S::Stable),
            (S::HaveLocalOffer, I::RemoteAnswer) => Ok(S::Stable),
            (state, I::Fail) if !state.is_terminal() => Ok(S::Failed),
            (from, input) => Err(TransitionError { from, input }),
        }
    }
}
