use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-handle negotiation state.
///
/// Offerer path:  new -> have-local-offer -> have-remote-answer -> connected -> closed
/// Answerer path: new -> have-remote-offer -> have-local-answer -> connected -> closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    New,
    HaveLocalOffer,
    HaveRemoteAnswer,
    HaveRemoteOffer,
    HaveLocalAnswer,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn is_closed(self) -> bool {
        self == NegotiationState::Closed
    }

    /// Remote description has been applied in this state.
    pub fn has_remote_description(self) -> bool {
        matches!(
            self,
            NegotiationState::HaveRemoteAnswer
                | NegotiationState::HaveRemoteOffer
                | NegotiationState::HaveLocalAnswer
                | NegotiationState::Connected
        )
    }

    /// Whether moving to `next` is a legal edge. Renegotiation re-enters the
    /// offer/answer states from `connected`.
    pub fn can_transition_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, HaveLocalOffer) | (New, HaveRemoteOffer) => true,
            (HaveLocalOffer, HaveRemoteAnswer) => true,
            (HaveRemoteOffer, HaveLocalAnswer) => true,
            (HaveRemoteAnswer, Connected) | (HaveLocalAnswer, Connected) => true,
            (Connected, HaveLocalOffer) | (Connected, HaveRemoteOffer) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::New => "new",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteAnswer => "have-remote-answer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::HaveLocalAnswer => "have-local-answer",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Which side of the pair sends the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

/// Result of applying an inbound signal to a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Applied,
    Buffered,
    /// Duplicate or out-of-order; ignored, never an error.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::NegotiationState::*;
    use super::*;

    #[test]
    fn offerer_and_answerer_paths_are_legal() {
        for path in [
            [New, HaveLocalOffer, HaveRemoteAnswer, Connected, Closed],
            [New, HaveRemoteOffer, HaveLocalAnswer, Connected, Closed],
        ] {
            for pair in path.windows(2) {
                assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            }
        }
    }

    #[test]
    fn closed_is_terminal() {
        for next in [New, HaveLocalOffer, HaveRemoteOffer, Connected, Closed] {
            assert!(!Closed.can_transition_to(next));
        }
    }

    #[test]
    fn answer_without_offer_is_illegal() {
        assert!(!New.can_transition_to(HaveRemoteAnswer));
        assert!(!HaveRemoteOffer.can_transition_to(HaveRemoteAnswer));
        assert!(!New.has_remote_description());
        assert!(HaveRemoteOffer.has_remote_description());
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(HaveLocalOffer.to_string(), "have-local-offer");
        assert_eq!(
            serde_json::to_string(&HaveRemoteAnswer).unwrap(),
            "\"have-remote-answer\""
        );
    }
}
