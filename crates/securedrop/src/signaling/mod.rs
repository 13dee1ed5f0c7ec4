//! Signaling transport
//!
//! A fire-and-forget channel to the relay that carries session-control
//! envelopes addressed by member id. Nothing is acknowledged end to end;
//! an envelope for an offline member is simply lost.

pub mod client;
pub mod protocol;

pub use client::SignalingClient;
pub use protocol::{IceCandidate, SdpType, SessionDescription, SignalEnvelope};

use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Receiver of envelopes addressed to the local member
///
/// The channel closes when the signaling connection is lost.
pub type InboundSignals = mpsc::UnboundedReceiver<SignalEnvelope>;

/// Outbound half of a signaling connection
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Member id this connection is registered as
    fn local_id(&self) -> &str;

    /// Whether the connection to the relay is still up
    fn is_connected(&self) -> bool;

    /// Relay an envelope
    ///
    /// # Errors
    ///
    /// `Error::TransportUnavailable` when the connection is gone.
    async fn send(&self, envelope: SignalEnvelope) -> Result<()>;

    async fn send_offer(&self, from_id: &str, to_id: &str, sdp: SessionDescription) -> Result<()> {
        self.send(SignalEnvelope::Offer {
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            sdp,
        })
        .await
    }

    async fn send_answer(&self, from_id: &str, to_id: &str, sdp: SessionDescription) -> Result<()> {
        self.send(SignalEnvelope::Answer {
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            sdp,
        })
        .await
    }

    async fn send_candidate(
        &self,
        from_id: &str,
        to_id: &str,
        candidate: IceCandidate,
    ) -> Result<()> {
        self.send(SignalEnvelope::Candidate {
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            candidate,
        })
        .await
    }

    async fn send_decline(&self, from_id: &str, to_id: &str) -> Result<()> {
        self.send(SignalEnvelope::Decline {
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
        })
        .await
    }

    async fn send_end(&self, from_id: &str, to_id: &str) -> Result<()> {
        self.send(SignalEnvelope::End {
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
        })
        .await
    }
}
