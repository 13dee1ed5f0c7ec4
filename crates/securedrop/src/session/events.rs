//! Events published to the UI layer

use super::history::ChatMessage;
use super::state::SessionState;
use crate::channels::{FileMeta, ReceivedFile, TransferProgress};
use crate::peer::ConnectionState;

/// Why a session returned to idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Ended locally
    LocalEnd,
    /// Remote peer sent `end`, or withdrew its offer
    RemoteEnd,
    /// Peer connection or data channel closed or failed
    ConnectionLost,
    /// Signaling connection lost before the session was established
    SignalingLost,
    /// No answer within the configured offer timeout
    TimedOut,
    /// Both members offered to each other at the same time
    OfferCollision,
    /// Creating or applying a session description failed
    NegotiationFailed,
}

/// Notification from the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session moved to a new state
    StateChanged(SessionState),

    /// A member offered a session; accept or decline it
    IncomingOffer { from_id: String },

    /// The offer sent to `peer_id` was declined
    Declined { peer_id: String },

    /// The session with `peer_id` ended
    Disconnected {
        peer_id: String,
        reason: DisconnectReason,
    },

    /// Underlying peer connection state changed
    ConnectionStateChanged(ConnectionState),

    /// The data channel opened; messages and files may be sent
    ChannelOpen { peer_id: String },

    /// An entry was added to the history
    MessageAppended(ChatMessage),

    /// An entry's status changed
    MessageUpdated(ChatMessage),

    /// The peer announced a file
    FileStarted(FileMeta),

    /// Bytes received for an incoming file
    FileProgress {
        transfer_id: String,
        progress: TransferProgress,
    },

    /// An incoming file completed
    FileReceived(ReceivedFile),

    /// Bytes sent for an outgoing file
    SendProgress {
        transfer_id: String,
        progress: TransferProgress,
    },

    /// A transfer failed and was discarded
    TransferFailed {
        transfer_id: Option<String>,
        reason: String,
    },

    /// The history was discarded because the session ended
    HistoryCleared,

    /// A recoverable error the UI may want to show
    Error { message: String },
}
