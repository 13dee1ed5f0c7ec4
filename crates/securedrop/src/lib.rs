//! SecureDrop: peer-to-peer transfer sessions between two members
//!
//! A member offers a session to another member through a signaling relay.
//! Once the other side accepts, chat messages and files travel directly
//! between the two peers over a WebRTC data channel; the relay only ever
//! sees session-control envelopes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  UI / CLI                                                │
//! │  ↓ SecureDropHandle (commands, state watch, events)      │
//! │  SessionManager (single task, owns all session state)    │
//! │  ├─ machine::step (pure transition rules)                │
//! │  ├─ SignalingTransport ──► relay (JSON-RPC 2.0 over WS)  │
//! │  ├─ PeerConnector / PeerLink (offer, answer, candidates) │
//! │  └─ DataLink ◄─► channels (control frames, file chunks)  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use securedrop::{ChunkFraming, SecureDropConfig};
//!
//! let config = SecureDropConfig::default()
//!     .with_signaling_url("ws://relay.example.com:4000")
//!     .with_offer_timeout(30)
//!     .with_chunk_framing(ChunkFraming::Tagged);
//!
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! # #[cfg(feature = "rtc")]
//! # async fn example() -> securedrop::Result<()> {
//! use securedrop::{SecureDropConfig, SessionManager};
//!
//! let (handle, _task) = SessionManager::connect(SecureDropConfig::default(), "alice").await?;
//! handle.initiate("bob").await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod error;
pub mod identity;
pub mod peer;
pub mod session;
pub mod signaling;

#[cfg(feature = "testing")]
pub mod testing;

pub use channels::{FileMeta, OutgoingFile, ReceivedFile, TransferProgress};
pub use config::{ChunkFraming, SecureDropConfig, TransferConfig, TurnServerConfig};
pub use error::{Error, ProtocolViolation, Result};
pub use identity::{MemberDirectory, MemberProfile, StaticMemberDirectory};
pub use peer::{ConnectionState, DataLink, PeerConnector, PeerLink, Role};
pub use session::{
    ChatMessage, Direction, DisconnectReason, MessagePayload, MessageStatus, SecureDropHandle,
    SessionEvent, SessionManager, SessionState,
};
pub use signaling::{SignalEnvelope, SignalingClient, SignalingTransport};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
