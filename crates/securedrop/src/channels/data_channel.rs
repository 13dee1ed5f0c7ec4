//! WebRTC data channel as a [`DataLink`]

use super::frame::ChannelPayload;
use crate::peer::{ConnectionId, DataLink, PeerEvent, PeerEventKind, PeerEventSender};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Reliable, ordered WebRTC data channel
///
/// Open, close and message callbacks are forwarded to the peer event queue
/// under the connection id the channel belongs to.
pub struct RtcDataChannel {
    label: String,
    rtc_channel: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    /// Wrap `rtc_channel` and install its callbacks
    ///
    /// Works for both locally created and passively received channels.
    pub fn attach(
        rtc_channel: Arc<RTCDataChannel>,
        connection_id: ConnectionId,
        events: PeerEventSender,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            label: rtc_channel.label().to_string(),
            rtc_channel: Arc::clone(&rtc_channel),
        });

        // The RTCDataChannel owns its handlers, so they must not own the wrapper
        let weak = Arc::downgrade(&channel);
        let open_events = events.clone();
        rtc_channel.on_open(Box::new(move || {
            if let Some(channel) = weak.upgrade() {
                debug!("Data channel '{}' opened", channel.label);
                let link: Arc<dyn DataLink> = channel;
                let _ = open_events.send(PeerEvent::new(
                    connection_id,
                    PeerEventKind::ChannelOpened(link),
                ));
            }
            Box::pin(async {})
        }));

        let close_events = events.clone();
        let label = channel.label.clone();
        rtc_channel.on_close(Box::new(move || {
            debug!("Data channel '{}' closed", label);
            let _ = close_events.send(PeerEvent::new(connection_id, PeerEventKind::ChannelClosed));
            Box::pin(async {})
        }));

        let label = channel.label.clone();
        rtc_channel.on_error(Box::new(move |err| {
            error!("Data channel '{}' error: {}", label, err);
            Box::pin(async {})
        }));

        rtc_channel.on_message(Box::new(move |msg| {
            let payload = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => ChannelPayload::Text(text),
                    Err(_) => ChannelPayload::Binary(msg.data),
                }
            } else {
                ChannelPayload::Binary(msg.data)
            };
            let _ = events.send(PeerEvent::new(
                connection_id,
                PeerEventKind::ChannelMessage(payload),
            ));
            Box::pin(async {})
        }));

        channel
    }
}

#[async_trait]
impl DataLink for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.rtc_channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelNotOpen(format!(
                "data channel '{}' is {}",
                self.label,
                self.rtc_channel.ready_state()
            )));
        }

        self.rtc_channel
            .send_text(text.to_string())
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send text: {}", e)))?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelNotOpen(format!(
                "data channel '{}' is {}",
                self.label,
                self.rtc_channel.ready_state()
            )));
        }

        self.rtc_channel
            .send(&data)
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send binary: {}", e)))?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.rtc_channel.buffered_amount().await
    }

    async fn close(&self) -> Result<()> {
        self.rtc_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close channel: {}", e)))?;

        debug!("Data channel '{}' closed", self.label);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    #[tokio::test]
    async fn test_unopened_channel_is_released() {
        let api = APIBuilder::new().build();
        let peer_connection = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        let rtc_channel = peer_connection
            .create_data_channel("secureDropChannel", None)
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let channel = RtcDataChannel::attach(Arc::clone(&rtc_channel), 7, tx);
        assert_eq!(channel.label(), "secureDropChannel");
        assert!(!channel.is_open());

        let weak = Arc::downgrade(&channel);
        drop(channel);
        assert!(weak.upgrade().is_none());

        peer_connection.close().await.unwrap();
    }
}
