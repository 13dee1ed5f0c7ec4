//! Session transitions
//!
//! [`step`] maps the current state and one input to the next state and the
//! side effects the manager must carry out, in order. It performs no I/O.
//!
//! Local commands issued in the wrong state are errors for the caller.
//! Remote input that does not fit the current state is expected (envelopes
//! race teardown, peers misbehave) and becomes a transition with no state
//! change and an [`Effect::Ignored`] marker.

use super::events::{DisconnectReason, SessionEvent};
use super::state::SessionState;
use crate::peer::ConnectionState;
use crate::signaling::{IceCandidate, SessionDescription, SignalEnvelope};
use crate::{Error, Result};

/// Something that happened to the session
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Local request to open a session with `target_id`
    Initiate { target_id: String },
    /// Local acceptance of the pending offer
    Accept,
    /// Local rejection of the pending offer
    Decline,
    /// Local request to end whatever is in progress
    End,
    /// Envelope from the relay
    Signal(SignalEnvelope),
    /// Candidate gathered by the local connection
    LocalCandidate(IceCandidate),
    /// State change of the live peer connection
    ConnectionChanged(ConnectionState),
    /// The data channel of the live connection closed
    ChannelClosed,
    /// The relay connection went away
    SignalingLost,
    /// The offer timeout elapsed
    WaitTimedOut,
    /// An offer, answer or remote description could not be processed
    NegotiationFailed,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Create an initiator connection, generate an offer and relay it
    StartOffer { target_id: String },
    /// Create an acceptor connection, answer `offer`, relay the answer and
    /// apply buffered candidates
    StartAnswer {
        peer_id: String,
        offer: SessionDescription,
    },
    /// Apply the remote answer, then buffered candidates
    ApplyAnswer { answer: SessionDescription },
    /// Add a remote candidate to the live connection
    AddCandidate(IceCandidate),
    /// Hold a remote candidate until a remote description is applied
    BufferCandidate(IceCandidate),
    /// Relay a local candidate
    SendCandidate {
        to_id: String,
        candidate: IceCandidate,
    },
    SendDecline { to_id: String },
    SendEnd { to_id: String },
    /// Close the data channel and connection, drop buffered candidates and
    /// pending transfers, disarm the offer timer
    Teardown,
    /// Start the offer timer if one is configured
    ArmTimeout,
    /// Publish an event
    Emit(SessionEvent),
    /// The input did not apply to the current state
    Ignored(&'static str),
}

/// Result of one step
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: SessionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: SessionState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }

    fn stay(state: &SessionState, effects: Vec<Effect>) -> Self {
        Self {
            next: state.clone(),
            effects,
        }
    }

    fn ignore(state: &SessionState, why: &'static str) -> Self {
        Self::stay(state, vec![Effect::Ignored(why)])
    }

    /// Whether the input was dropped without effect
    pub fn is_ignored(&self) -> bool {
        matches!(self.effects.as_slice(), [Effect::Ignored(_)])
    }
}

/// Back to idle, telling the peer and the UI
fn close_session(peer_id: &str, reason: DisconnectReason, notify_peer: bool) -> Transition {
    let mut effects = vec![Effect::Teardown];
    if notify_peer {
        effects.push(Effect::SendEnd {
            to_id: peer_id.to_string(),
        });
    }
    effects.push(Effect::Emit(SessionEvent::Disconnected {
        peer_id: peer_id.to_string(),
        reason,
    }));
    Transition::to(SessionState::Idle, effects)
}

/// Compute the transition for `input` in `state`
pub fn step(state: &SessionState, input: Input) -> Result<Transition> {
    use SessionState::*;

    let transition = match input {
        Input::Initiate { target_id } => match state {
            Idle => Transition::to(
                Waiting {
                    target_id: target_id.clone(),
                },
                vec![Effect::StartOffer { target_id }, Effect::ArmTimeout],
            ),
            _ => {
                return Err(Error::SessionBusy(format!(
                    "cannot start a session while {}",
                    state
                )))
            }
        },

        Input::Accept => match state {
            Confirm { from_id, sdp } => Transition::to(
                Chat {
                    peer_id: from_id.clone(),
                },
                vec![Effect::StartAnswer {
                    peer_id: from_id.clone(),
                    offer: sdp.clone(),
                }],
            ),
            _ => {
                return Err(Error::InvalidState(format!(
                    "no incoming offer to accept while {}",
                    state
                )))
            }
        },

        Input::Decline => match state {
            Confirm { from_id, .. } => Transition::to(
                Idle,
                vec![
                    Effect::Teardown,
                    Effect::SendDecline {
                        to_id: from_id.clone(),
                    },
                ],
            ),
            _ => {
                return Err(Error::InvalidState(format!(
                    "no incoming offer to decline while {}",
                    state
                )))
            }
        },

        Input::End => match state {
            Idle => Transition::stay(state, Vec::new()),
            Confirm { from_id, .. } => Transition::to(
                Idle,
                vec![
                    Effect::Teardown,
                    Effect::SendDecline {
                        to_id: from_id.clone(),
                    },
                ],
            ),
            Waiting { target_id: peer } | Chat { peer_id: peer } => {
                close_session(peer, DisconnectReason::LocalEnd, true)
            }
        },

        Input::Signal(envelope) => on_signal(state, envelope),

        Input::LocalCandidate(candidate) => match state {
            Waiting { target_id: peer } | Chat { peer_id: peer } => Transition::stay(
                state,
                vec![Effect::SendCandidate {
                    to_id: peer.clone(),
                    candidate,
                }],
            ),
            _ => Transition::ignore(state, "local candidate without a session"),
        },

        Input::ConnectionChanged(connection_state) if connection_state.is_terminal() => {
            match state {
                Waiting { target_id: peer } | Chat { peer_id: peer } => {
                    close_session(peer, DisconnectReason::ConnectionLost, true)
                }
                _ => Transition::ignore(state, "connection state change without a session"),
            }
        }
        Input::ConnectionChanged(_) => Transition::stay(state, Vec::new()),

        Input::ChannelClosed => match state {
            Waiting { target_id: peer } | Chat { peer_id: peer } => {
                close_session(peer, DisconnectReason::ConnectionLost, true)
            }
            _ => Transition::ignore(state, "channel closed without a session"),
        },

        Input::SignalingLost => match state {
            Waiting { target_id: peer } | Confirm { from_id: peer, .. } => {
                close_session(peer, DisconnectReason::SignalingLost, false)
            }
            // An established session does not need the relay
            Idle | Chat { .. } => Transition::stay(state, Vec::new()),
        },

        Input::WaitTimedOut => match state {
            Waiting { target_id } => close_session(target_id, DisconnectReason::TimedOut, true),
            _ => Transition::ignore(state, "offer timer fired outside waiting"),
        },

        Input::NegotiationFailed => match state {
            Idle => Transition::ignore(state, "negotiation failure without a session"),
            Confirm { from_id, .. } => {
                let mut t = close_session(from_id, DisconnectReason::NegotiationFailed, false);
                t.effects.insert(
                    1,
                    Effect::SendDecline {
                        to_id: from_id.clone(),
                    },
                );
                t
            }
            Waiting { target_id: peer } | Chat { peer_id: peer } => {
                close_session(peer, DisconnectReason::NegotiationFailed, true)
            }
        },
    };

    Ok(transition)
}

fn on_signal(state: &SessionState, envelope: SignalEnvelope) -> Transition {
    use SessionState::*;

    match envelope {
        SignalEnvelope::Offer { from_id, sdp, .. } => match state {
            Idle => Transition::to(
                Confirm {
                    from_id: from_id.clone(),
                    sdp,
                },
                vec![Effect::Emit(SessionEvent::IncomingOffer { from_id })],
            ),
            Confirm {
                from_id: current,
                sdp: pending,
            } if *current == from_id => {
                if *pending == sdp {
                    Transition::ignore(state, "duplicate offer")
                } else {
                    // Renewed offer: candidates buffered for the old one are stale
                    Transition::to(Confirm { from_id, sdp }, vec![Effect::Teardown])
                }
            }
            Waiting { target_id } if *target_id == from_id => {
                let mut t = close_session(&from_id, DisconnectReason::OfferCollision, false);
                t.effects.insert(1, Effect::SendDecline { to_id: from_id });
                t
            }
            _ => Transition::stay(state, vec![Effect::SendDecline { to_id: from_id }]),
        },

        SignalEnvelope::Answer { from_id, sdp, .. } => match state {
            Waiting { target_id } if *target_id == from_id => Transition::to(
                Chat { peer_id: from_id },
                vec![Effect::ApplyAnswer { answer: sdp }],
            ),
            _ => Transition::ignore(state, "answer does not match a pending offer"),
        },

        SignalEnvelope::Candidate {
            from_id, candidate, ..
        } => match state {
            Waiting { target_id: peer } | Confirm { from_id: peer, .. } if *peer == from_id => {
                Transition::stay(state, vec![Effect::BufferCandidate(candidate)])
            }
            Chat { peer_id } if *peer_id == from_id => {
                Transition::stay(state, vec![Effect::AddCandidate(candidate)])
            }
            _ => Transition::ignore(state, "candidate from outside the session"),
        },

        SignalEnvelope::Decline { from_id, .. } => match state {
            Waiting { target_id } if *target_id == from_id => Transition::to(
                Idle,
                vec![
                    Effect::Teardown,
                    Effect::Emit(SessionEvent::Declined { peer_id: from_id }),
                ],
            ),
            Confirm { from_id: peer, .. } | Chat { peer_id: peer } if *peer == from_id => {
                close_session(peer, DisconnectReason::RemoteEnd, false)
            }
            _ => Transition::ignore(state, "decline from outside the session"),
        },

        SignalEnvelope::End { from_id, .. } => match state {
            Waiting { target_id: peer } | Confirm { from_id: peer, .. } | Chat { peer_id: peer }
                if *peer == from_id =>
            {
                close_session(peer, DisconnectReason::RemoteEnd, false)
            }
            _ => Transition::ignore(state, "end from outside the session"),
        },
    }
}
