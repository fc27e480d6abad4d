//! Channel lifecycle state machine

use serde::{Deserialize, Serialize};

/// Where a channel stands, as seen from the local side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Nothing pending and no session
    NoSession,
    /// We sent an `Init` and wait for the `Response`
    HandshakeInitiated,
    /// We answered an `Init` and wait for the `Confirm`
    HandshakeRespondedTo,
    /// A session is installed
    Established,
    /// The session was revoked
    Revoked,
    /// The session reached its send limit
    Expired,
}

/// Inputs that move a channel between states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Local side starts a handshake
    Initiate,
    /// A verified `Init` arrived from the peer. `local_wins` is the tie-break
    /// result when we have an `Init` of our own in flight.
    PeerInit {
        /// Our own pending `Init` takes precedence
        local_wins: bool,
    },
    /// A verified `Response` to our `Init` arrived
    PeerResponse,
    /// A verified `Confirm` for our `Response` arrived
    PeerConfirm,
    /// The pending handshake passed its deadline or was aborted
    Abandon,
    /// The session was revoked
    Revoke,
    /// The session reached its send limit
    Expire,
}

/// A transition the state machine does not allow
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidTransition {
    /// State the channel was in
    pub from: ChannelState,
    /// Event that was rejected
    pub event: ChannelEvent,
}

impl ChannelState {
    /// Apply an event
    pub fn transition(self, event: ChannelEvent) -> Result<ChannelState, InvalidTransition> {
        use ChannelEvent::*;
        use ChannelState::*;

        let next = match (self, event) {
            (NoSession | Revoked | Expired, Initiate) => HandshakeInitiated,
            (HandshakeInitiated | HandshakeRespondedTo | Established, Initiate) => {
                return Err(InvalidTransition { from: self, event })
            }

            (HandshakeInitiated, PeerInit { local_wins: true }) => HandshakeInitiated,
            (HandshakeInitiated, PeerInit { local_wins: false }) => HandshakeRespondedTo,
            // A peer that lost its session starts over; so does a peer retrying
            (NoSession | HandshakeRespondedTo | Established | Revoked | Expired, PeerInit { .. }) => {
                HandshakeRespondedTo
            }

            (HandshakeInitiated, PeerResponse) => Established,
            (NoSession | HandshakeRespondedTo | Established | Revoked | Expired, PeerResponse) => {
                return Err(InvalidTransition { from: self, event })
            }

            (HandshakeRespondedTo, PeerConfirm) => Established,
            (NoSession | HandshakeInitiated | Established | Revoked | Expired, PeerConfirm) => {
                return Err(InvalidTransition { from: self, event })
            }

            (HandshakeInitiated | HandshakeRespondedTo, Abandon) => NoSession,
            (NoSession | Established | Revoked | Expired, Abandon) => self,

            (Established | Expired, Revoke) => Revoked,
            (Revoked, Revoke) => Revoked,
            (NoSession | HandshakeInitiated | HandshakeRespondedTo, Revoke) => {
                return Err(InvalidTransition { from: self, event })
            }

            (Established, Expire) => Expired,
            (Expired, Expire) => Expired,
            (NoSession | HandshakeInitiated | HandshakeRespondedTo | Revoked, Expire) => {
                return Err(InvalidTransition { from: self, event })
            }
        };
        Ok(next)
    }

    /// A handshake is pending
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ChannelState::HandshakeInitiated | ChannelState::HandshakeRespondedTo
        )
    }

    /// Messages can be encrypted right now
    pub fn can_send(self) -> bool {
        self == ChannelState::Established
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelState::NoSession => "no session",
            ChannelState::HandshakeInitiated => "handshake initiated",
            ChannelState::HandshakeRespondedTo => "handshake responded to",
            ChannelState::Established => "established",
            ChannelState::Revoked => "revoked",
            ChannelState::Expired => "expired",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelEvent::*;
    use super::ChannelState::*;
    use super::*;

    #[test]
    fn test_initiator_path() {
        let state = NoSession.transition(Initiate).unwrap();
        assert_eq!(state, HandshakeInitiated);
        assert_eq!(state.transition(PeerResponse).unwrap(), Established);
    }

    #[test]
    fn test_responder_path() {
        let state = NoSession.transition(PeerInit { local_wins: false }).unwrap();
        assert_eq!(state, HandshakeRespondedTo);
        assert_eq!(state.transition(PeerConfirm).unwrap(), Established);
    }

    #[test]
    fn test_tie_break_paths() {
        assert_eq!(
            HandshakeInitiated.transition(PeerInit { local_wins: true }).unwrap(),
            HandshakeInitiated
        );
        assert_eq!(
            HandshakeInitiated.transition(PeerInit { local_wins: false }).unwrap(),
            HandshakeRespondedTo
        );
    }

    #[test]
    fn test_rehandshake_allowed_after_revoke_or_expiry() {
        assert_eq!(Revoked.transition(Initiate).unwrap(), HandshakeInitiated);
        assert_eq!(Expired.transition(Initiate).unwrap(), HandshakeInitiated);
        assert!(Established.transition(Initiate).is_err());
        assert!(HandshakeInitiated.transition(Initiate).is_err());
    }

    #[test]
    fn test_unexpected_messages_rejected() {
        assert!(NoSession.transition(PeerResponse).is_err());
        assert!(HandshakeInitiated.transition(PeerConfirm).is_err());
        assert!(Established.transition(PeerResponse).is_err());
    }

    #[test]
    fn test_abandon_and_lifecycle() {
        assert_eq!(HandshakeInitiated.transition(Abandon).unwrap(), NoSession);
        assert_eq!(HandshakeRespondedTo.transition(Abandon).unwrap(), NoSession);
        assert_eq!(Established.transition(Expire).unwrap(), Expired);
        assert_eq!(Expired.transition(Revoke).unwrap(), Revoked);
        assert!(NoSession.transition(Revoke).is_err());
        assert!(Established.can_send());
        assert!(HandshakeInitiated.is_pending());
    }
}
