//! Error types for SecureDrop sessions

/// Result type alias using SecureDrop Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in SecureDrop operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling connection error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Signaling channel is not connected
    #[error("Signaling transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Another session is already in progress
    #[error("Session busy: {0}")]
    SessionBusy(String),

    /// Operation not allowed in the current session state
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Data channel is not open for sending
    #[error("Data channel not open: {0}")]
    ChannelNotOpen(String),

    /// File transfer failed
    #[error("Transfer error: {0}")]
    TransferError(String),

    /// Invalid data format
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The session manager task is no longer running
    #[error("Session manager stopped: {0}")]
    SessionStopped(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::TransportUnavailable(_)
                | Error::WebSocketError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error was caused by calling an operation at the wrong time
    ///
    /// These are the only errors the session surfaces to UI code; anomalies
    /// in peer input are recovered locally.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::SessionBusy(_) | Error::InvalidState(_) | Error::ChannelNotOpen(_)
        )
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerConnectionError(_) | Error::IceCandidateError(_) | Error::SdpError(_)
        )
    }
}

/// Anomaly in input received from the remote peer
///
/// Never returned from the public API. The session logs it and, when a
/// transfer is involved, marks that transfer failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// Control text that is not a known frame
    #[error("malformed control frame: {0}")]
    MalformedControl(String),

    /// Binary chunk received while no transfer is pending
    #[error("binary chunk with no pending transfer")]
    OrphanChunk,

    /// Raw binary chunk received while several transfers are pending
    #[error("binary chunk is ambiguous between {0} pending transfers")]
    AmbiguousChunk(usize),

    /// Tagged chunk header could not be decoded
    #[error("malformed chunk header: {0}")]
    MalformedChunkHeader(String),

    /// Chunk or completion for a transfer that is not pending
    #[error("unknown transfer {0}")]
    UnknownTransfer(String),

    /// `file-meta` reusing the id of a pending transfer
    #[error("duplicate transfer id {0}")]
    DuplicateTransfer(String),

    /// Announced file exceeds the receive limit
    #[error("file {id} of {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { id: String, size: u64, limit: u64 },

    /// More bytes arrived than the announced size
    #[error("transfer {id} overflowed its declared size of {size} bytes")]
    SizeOverflow { id: String, size: u64 },

    /// Transfer completed with a byte count different from the announced size
    #[error("transfer {id} completed with {received} of {size} bytes")]
    SizeMismatch { id: String, received: u64, size: u64 },
}

impl ProtocolViolation {
    /// Transfer the violation is attributable to, if any
    ///
    /// A duplicate announcement is not attributed: the pending transfer
    /// with that id is unaffected.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            ProtocolViolation::UnknownTransfer(id)
            | ProtocolViolation::FileTooLarge { id, .. }
            | ProtocolViolation::SizeOverflow { id, .. }
            | ProtocolViolation::SizeMismatch { id, .. } => Some(id),
            _ => None,
        }
    }
}
