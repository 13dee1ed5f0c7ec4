//! Configuration types for SecureDrop sessions

use serde::{Deserialize, Serialize};

/// Default data channel label, shared with browser clients
pub const DEFAULT_CHANNEL_LABEL: &str = "secureDropChannel";

/// Default chunk size for file transfers (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk a single data channel message may carry
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

/// Main configuration for a SecureDrop session manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureDropConfig {
    /// WebSocket signaling relay URL (ws:// or wss://)
    pub signaling_url: String,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Label of the data channel created by the initiator
    pub channel_label: String,

    /// Give up on an unanswered offer after this many seconds (default: never)
    pub offer_timeout_secs: Option<u64>,

    /// Capacity of the command queue between handles and the session task
    pub command_buffer: usize,

    /// File transfer settings
    pub transfer: TransferConfig,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// How binary chunks are bound to the transfer they belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkFraming {
    /// Raw chunk bytes with no envelope
    ///
    /// Chunks belong to the only pending transfer, so each side keeps at
    /// most one outgoing transfer in flight. Compatible with browser peers.
    Raw,
    /// Every chunk starts with a `u16` big-endian id length and the UTF-8
    /// transfer id
    ///
    /// Transfers may interleave. Both peers must use this framing.
    Tagged,
}

/// File transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Payload bytes per binary chunk (default: 64 KiB)
    pub chunk_size: usize,

    /// Chunk-to-transfer binding (default: Raw)
    pub chunk_framing: ChunkFraming,

    /// Pause sending while the channel buffers more than this many bytes
    pub max_buffered_amount: usize,

    /// Reject announced incoming files larger than this many bytes
    pub max_incoming_file_size: u64,

    /// Yield to the scheduler after this many chunks
    pub yield_every_chunks: usize,
}

impl Default for SecureDropConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:4000".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            offer_timeout_secs: None,
            command_buffer: 64,
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_framing: ChunkFraming::Raw,
            max_buffered_amount: 1024 * 1024,
            max_incoming_file_size: 512 * 1024 * 1024,
            yield_every_chunks: 16,
        }
    }
}

impl SecureDropConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - no STUN or TURN server is configured
    /// - `signaling_url` is not a WebSocket URL
    /// - a TURN URL does not use the `turn:`/`turns:` scheme
    /// - `offer_timeout_secs` is `Some(0)`
    /// - `command_buffer` is zero
    /// - the transfer settings are out of range
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() && self.turn_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN or TURN server is required".to_string(),
            ));
        }

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if self.channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "channel_label must not be empty".to_string(),
            ));
        }

        if self.offer_timeout_secs == Some(0) {
            return Err(Error::InvalidConfig(
                "offer_timeout_secs must be greater than zero when set".to_string(),
            ));
        }

        if self.command_buffer == 0 {
            return Err(Error::InvalidConfig(
                "command_buffer must be greater than zero".to_string(),
            ));
        }

        self.transfer.validate()
    }

    /// Set the signaling relay URL
    pub fn with_signaling_url(mut self, url: &str) -> Self {
        self.signaling_url = url.to_string();
        self
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Abandon unanswered offers after `secs` seconds
    pub fn with_offer_timeout(mut self, secs: u64) -> Self {
        self.offer_timeout_secs = Some(secs);
        self
    }

    /// Select the chunk framing for file transfers
    pub fn with_chunk_framing(mut self, framing: ChunkFraming) -> Self {
        self.transfer.chunk_framing = framing;
        self
    }

    /// Set the chunk size for file transfers
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.transfer.chunk_size = chunk_size;
        self
    }
}

impl TransferConfig {
    fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "chunk_size must be in range 1-{}, got {}",
                MAX_CHUNK_SIZE, self.chunk_size
            )));
        }

        if self.max_buffered_amount < self.chunk_size {
            return Err(Error::InvalidConfig(format!(
                "max_buffered_amount ({}) must be at least chunk_size ({})",
                self.max_buffered_amount, self.chunk_size
            )));
        }

        if self.yield_every_chunks == 0 {
            return Err(Error::InvalidConfig(
                "yield_every_chunks must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
