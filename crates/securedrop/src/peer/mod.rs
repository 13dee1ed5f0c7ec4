//! Peer connection seam
//!
//! The session engine drives negotiation through [`PeerConnector`] and
//! [`PeerLink`], and carries application data over a [`DataLink`]. All
//! asynchronous notifications from the underlying connection arrive as
//! [`PeerEvent`]s on a single queue, tagged with the connection they belong
//! to so that events from a torn-down connection can be told apart.

#[cfg(feature = "rtc")]
pub mod connection;

#[cfg(feature = "rtc")]
pub use connection::{RtcConnector, RtcPeerConnection};

use crate::channels::ChannelPayload;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifies one peer connection instance within a session manager
pub type ConnectionId = u64;

/// Sender half of the peer event queue
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Which side of the negotiation the local client plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the data channel before generating the offer
    Initiator,
    /// Receives the data channel passively
    Acceptor,
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, connection not yet started
    New,
    /// Connection negotiation in progress
    Connecting,
    /// Connection established successfully
    Connected,
    /// Connectivity lost
    Disconnected,
    /// Connection failed
    Failed,
    /// Connection closed
    Closed,
}

impl ConnectionState {
    /// Whether the state ends the session
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// Notification from a peer connection
#[derive(Debug, Clone)]
pub struct PeerEvent {
    /// Connection that produced the event
    pub connection_id: ConnectionId,

    /// What happened
    pub kind: PeerEventKind,
}

/// Kinds of peer connection notifications
#[derive(Clone)]
pub enum PeerEventKind {
    /// A local connectivity candidate to trickle to the remote peer
    LocalCandidate(IceCandidate),
    /// Peer connection state transition
    StateChanged(ConnectionState),
    /// The data channel is open and ready to send
    ChannelOpened(Arc<dyn DataLink>),
    /// A message arrived on the data channel
    ChannelMessage(ChannelPayload),
    /// The data channel closed
    ChannelClosed,
}

impl fmt::Debug for PeerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEventKind::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEventKind::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            PeerEventKind::ChannelOpened(link) => {
                f.debug_tuple("ChannelOpened").field(&link.label()).finish()
            }
            PeerEventKind::ChannelMessage(p) => f.debug_tuple("ChannelMessage").field(p).finish(),
            PeerEventKind::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

impl PeerEvent {
    pub fn new(connection_id: ConnectionId, kind: PeerEventKind) -> Self {
        Self {
            connection_id,
            kind,
        }
    }
}

/// Creates peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a connection to `peer_id`
    ///
    /// With [`Role::Initiator`] the data channel is created here, before any
    /// offer exists, so that it is part of the initial negotiation.
    async fn connect(
        &self,
        peer_id: &str,
        role: Role,
        connection_id: ConnectionId,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerLink>>;
}

/// One live peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Generate the local offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply the remote offer, then generate and apply the local answer
    async fn create_answer(&self, offer: &SessionDescription) -> Result<SessionDescription>;

    /// Apply the remote answer
    async fn apply_answer(&self, answer: &SessionDescription) -> Result<()>;

    /// Add a remote connectivity candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Close the connection; further events are not delivered
    async fn close(&self) -> Result<()>;
}

/// The open data channel of a peer connection
#[async_trait]
pub trait DataLink: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Whether the channel accepts sends
    fn is_open(&self) -> bool;

    /// Send a text frame
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Send a binary frame
    async fn send_binary(&self, data: Bytes) -> Result<()>;

    /// Bytes queued locally and not yet handed to the network
    async fn buffered_amount(&self) -> usize;

    /// Close the channel
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
    }

    #[test]
    fn test_peer_event_debug() {
        let event = PeerEvent::new(3, PeerEventKind::StateChanged(ConnectionState::Connected));
        let rendered = format!("{:?}", event);
        assert!(rendered.contains("connection_id: 3"));
        assert!(rendered.contains("Connected"));
    }
}
