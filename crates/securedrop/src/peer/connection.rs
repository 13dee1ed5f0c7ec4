//! WebRTC peer connection

use super::{
    ConnectionId, ConnectionState, PeerConnector, PeerEvent, PeerEventKind, PeerEventSender,
    PeerLink, Role,
};
use crate::channels::RtcDataChannel;
use crate::config::SecureDropConfig;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Creates WebRTC peer connections from the session configuration
#[derive(Debug, Clone)]
pub struct RtcConnector {
    ice_servers: Vec<RTCIceServer>,
    channel_label: String,
}

impl RtcConnector {
    pub fn new(config: &SecureDropConfig) -> Self {
        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        Self {
            ice_servers,
            channel_label: config.channel_label.clone(),
        }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    #[instrument(skip(self, events), fields(peer_id = %peer_id))]
    async fn connect(
        &self,
        peer_id: &str,
        role: Role,
        connection_id: ConnectionId,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerLink>> {
        info!(
            "Creating peer connection: role={:?}, connection_id={}",
            role, connection_id
        );

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            Error::PeerConnectionError(format!("Failed to register codecs: {}", e))
        })?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::PeerConnectionError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
        })?);

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let state = match s {
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                        ConnectionState::New
                    }
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                };
                debug!("Peer connection {} state: {:?}", connection_id, state);
                let _ = state_events.send(PeerEvent::new(
                    connection_id,
                    PeerEventKind::StateChanged(state),
                ));
                Box::pin(async {})
            },
        ));

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_events = candidate_events.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_events.send(PeerEvent::new(
                            connection_id,
                            PeerEventKind::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }),
                        ));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        match role {
            Role::Initiator => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                open_channel(&peer_connection, &self.channel_label, init, connection_id, events)
                    .await?;
            }
            Role::Acceptor => {
                peer_connection.on_data_channel(Box::new(move |rtc_channel| {
                    info!(
                        "Data channel received: label={}, id={}",
                        rtc_channel.label(),
                        rtc_channel.id()
                    );
                    RtcDataChannel::attach(rtc_channel, connection_id, events.clone());
                    Box::pin(async {})
                }));
            }
        }

        Ok(Box::new(RtcPeerConnection {
            peer_id: peer_id.to_string(),
            peer_connection,
        }))
    }
}

/// Create the initiator's data channel, closing `peer_connection` on failure
async fn open_channel(
    peer_connection: &Arc<RTCPeerConnection>,
    label: &str,
    init: RTCDataChannelInit,
    connection_id: ConnectionId,
    events: PeerEventSender,
) -> Result<()> {
    match peer_connection.create_data_channel(label, Some(init)).await {
        Ok(rtc_channel) => {
            RtcDataChannel::attach(rtc_channel, connection_id, events);
            Ok(())
        }
        Err(e) => {
            if let Err(close_err) = peer_connection.close().await {
                warn!("Failed to close peer connection: {}", close_err);
            }
            Err(Error::DataChannelError(format!(
                "Failed to create data channel: {}",
                e
            )))
        }
    }
}

/// A live WebRTC peer connection
pub struct RtcPeerConnection {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
}

impl RtcPeerConnection {
    async fn local_description(&self) -> Result<SessionDescription> {
        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after negotiation".to_string()))?;

        let sdp_type = match local_desc.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Rollback => SdpType::Rollback,
            RTCSdpType::Answer | RTCSdpType::Unspecified => SdpType::Answer,
        };

        Ok(SessionDescription {
            sdp_type,
            sdp: local_desc.sdp,
        })
    }
}

#[async_trait]
impl PeerLink for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created SDP offer for peer {}", self.peer_id);
        self.local_description().await
    }

    async fn create_answer(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::SdpError(format!(
                "Expected an offer, got {:?}",
                offer.sdp_type
            )));
        }

        let offer = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created SDP answer for peer {}", self.peer_id);
        self.local_description().await
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<()> {
        debug!("Setting remote description for peer {}", self.peer_id);

        let answer = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        debug!(
            "Adding ICE candidate for peer {}: {}",
            self.peer_id, candidate.candidate
        );

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment.clone(),
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for peer {}", self.peer_id);

        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close: {}", e)))
    }
}
