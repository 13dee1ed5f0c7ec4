//! WebSocket signaling client

use super::protocol::*;
use super::{InboundSignals, SignalingTransport};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// How long `connect` waits for the relay to confirm registration
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

type RegisterReply = oneshot::Sender<std::result::Result<(), String>>;

/// WebSocket signaling client for JSON-RPC 2.0 envelopes
///
/// Registers the local member id on connect. Sends are queued to a writer
/// task; inbound envelopes addressed to the local member are decoded by a
/// reader task and delivered through the [`InboundSignals`] receiver
/// returned from [`SignalingClient::connect`].
pub struct SignalingClient {
    /// Signaling server URL
    url: String,

    /// Local member id
    user_id: String,

    /// Outgoing message sender
    tx: mpsc::UnboundedSender<Message>,

    /// Cleared by the reader task when the socket goes away
    connected: Arc<AtomicBool>,
}

impl SignalingClient {
    /// Connect to the relay and register as `user_id`
    ///
    /// # Arguments
    ///
    /// * `url` - WebSocket signaling server URL (ws:// or wss://)
    /// * `user_id` - Local member id
    pub async fn connect(url: &str, user_id: &str) -> Result<(Self, InboundSignals)> {
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();

        let (tx, rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        let register_id = uuid::Uuid::new_v4().to_string();
        let (register_tx, register_rx) = oneshot::channel();

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(
            read,
            user_id.to_string(),
            inbound_tx,
            Arc::clone(&connected),
            (register_id.clone(), Arc::new(Mutex::new(Some(register_tx)))),
        ));

        let client = Self {
            url: url.to_string(),
            user_id: user_id.to_string(),
            tx,
            connected,
        };

        let register = JsonRpcRequest::register(user_id, serde_json::json!(register_id));
        client.send_text(register.to_json()?)?;

        match tokio::time::timeout(REGISTER_TIMEOUT, register_rx).await {
            Ok(Ok(Ok(()))) => {
                info!("Registered with signaling server as {}", user_id);
                Ok((client, inbound_rx))
            }
            Ok(Ok(Err(message))) => Err(Error::SignalingError(format!(
                "Registration rejected: {}",
                message
            ))),
            Ok(Err(_)) => Err(Error::SignalingError(
                "Connection closed before registration completed".to_string(),
            )),
            Err(_) => Err(Error::SignalingError(
                "Timed out waiting for registration".to_string(),
            )),
        }
    }

    /// Signaling server URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Close the WebSocket connection
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Message::Close(None));
        }
    }

    /// Sender task: sends messages from channel to WebSocket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }

        let _ = write.close().await;
        debug!("Sender task terminated");
    }

    /// Receiver task: decodes frames from the WebSocket
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        user_id: String,
        inbound: mpsc::UnboundedSender<SignalEnvelope>,
        connected: Arc<AtomicBool>,
        register: (String, Arc<Mutex<Option<RegisterReply>>>),
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if let Err(e) = Self::handle_message(&text, &user_id, &inbound, &register) {
                        warn!("Dropping signaling message: {}", e);
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        connected.store(false, Ordering::SeqCst);
        debug!("Receiver task terminated");
    }

    /// Handle one incoming text frame
    fn handle_message(
        text: &str,
        user_id: &str,
        inbound: &mpsc::UnboundedSender<SignalEnvelope>,
        register: &(String, Arc<Mutex<Option<RegisterReply>>>),
    ) -> Result<()> {
        debug!("Received signaling message: {}", text);

        let (register_id, register_reply) = register;
        let is_register_reply = |id: &serde_json::Value| id.as_str() == Some(register_id.as_str());

        match JsonRpcMessage::from_json(text)? {
            JsonRpcMessage::Request(req) => {
                if !methods::is_envelope(&req.method) {
                    warn!("Unknown signaling method: {}", req.method);
                    return Ok(());
                }

                let envelope = SignalEnvelope::from_request(&req)?;
                if envelope.to_id() != user_id {
                    warn!(
                        "Dropping {} addressed to {}, not {}",
                        envelope.method(),
                        envelope.to_id(),
                        user_id
                    );
                    return Ok(());
                }

                if inbound.send(envelope).is_err() {
                    debug!("Inbound envelope receiver dropped");
                }
            }
            JsonRpcMessage::Response(resp) if is_register_reply(&resp.id) => {
                if let Some(reply) = take_reply(register_reply) {
                    let _ = reply.send(Ok(()));
                }
            }
            JsonRpcMessage::Response(resp) => {
                debug!("Ignoring response for request {}", resp.id);
            }
            JsonRpcMessage::Error(err) if is_register_reply(&err.id) => {
                if let Some(reply) = take_reply(register_reply) {
                    let _ = reply.send(Err(err.error.message));
                }
            }
            JsonRpcMessage::Error(err) => {
                warn!(
                    "Signaling server error {}: {}",
                    err.error.code, err.error.message
                );
            }
        }

        Ok(())
    }

    fn send_text(&self, json: String) -> Result<()> {
        debug!("Sending signaling message: {}", json);

        self.tx.send(Message::Text(json)).map_err(|e| {
            Error::TransportUnavailable(format!("Failed to send message: {}", e))
        })
    }
}

fn take_reply(slot: &Mutex<Option<RegisterReply>>) -> Option<RegisterReply> {
    slot.lock().ok().and_then(|mut guard| guard.take())
}

#[async_trait]
impl SignalingTransport for SignalingClient {
    fn local_id(&self) -> &str {
        &self.user_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::TransportUnavailable(
                "Signaling connection is closed".to_string(),
            ));
        }

        self.send_text(envelope.to_json()?)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}
