//! WebSocket message handler for JSON-RPC 2.0 signaling
//!
//! Each connection registers as one member id and may then relay envelopes
//! to other registered members.

use futures_util::{SinkExt, StreamExt};
use securedrop::signaling::protocol::{
    error_codes, methods, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RegisterParams,
};
use securedrop::SignalEnvelope;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Message, Result as WsResult},
};
use tracing::{debug, error, info, warn};

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Outbound queue depth per connection
const OUTBOUND_BUFFER: usize = 128;

/// Registered member
pub struct MemberConnection {
    /// Connection that owns the registration
    pub connection_id: u64,
    pub connected_at: u64,
    pub tx: mpsc::Sender<Message>,
}

/// Shared state across all WebSocket connections
#[derive(Default)]
pub struct SharedState {
    pub members: RwLock<HashMap<String, MemberConnection>>,
    next_connection: AtomicU64,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Member ids with a live registration, sorted
    pub async fn registered(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.members.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn allocate_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Outbound queue of `user_id`, if online
    async fn route_to(&self, user_id: &str) -> Option<mpsc::Sender<Message>> {
        self.members.read().await.get(user_id).map(|m| m.tx.clone())
    }

    async fn owns(&self, user_id: &str, connection_id: u64) -> bool {
        self.members
            .read()
            .await
            .get(user_id)
            .is_some_and(|m| m.connection_id == connection_id)
    }

    /// Remove `user_id` only while `connection_id` still owns it
    async fn release(&self, user_id: &str, connection_id: u64) -> bool {
        let mut members = self.members.write().await;
        if members
            .get(user_id)
            .is_some_and(|m| m.connection_id == connection_id)
        {
            members.remove(user_id);
            true
        } else {
            false
        }
    }
}

/// Per-connection context
struct Connection {
    id: u64,
    user_id: Option<String>,
    tx: mpsc::Sender<Message>,
}

impl Connection {
    async fn reply(&self, response: JsonRpcResponse) -> HandlerResult {
        self.tx.send(Message::Text(response.to_json()?)).await?;
        Ok(())
    }

    async fn reply_error(&self, code: i32, message: String, id: Value) -> HandlerResult {
        let error = JsonRpcError::new(code, message, id);
        self.tx.send(Message::Text(error.to_json()?)).await?;
        Ok(())
    }
}

/// Handle a single WebSocket connection until it closes or the relay shuts down
pub async fn handle_connection(
    stream: TcpStream,
    state: Arc<SharedState>,
    mut shutdown: broadcast::Receiver<()>,
) -> WsResult<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Channel for sending messages back to this connection
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = ws_tx.send(msg).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut conn = Connection {
        id: state.allocate_connection_id(),
        user_id: None,
        tx: tx.clone(),
    };
    info!("New WebSocket connection {} from {}", conn.id, addr);

    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = handle_message(&text, &state, &mut conn).await {
                        error!("Error handling message: {}", e);
                        let _ = conn
                            .reply_error(error_codes::INTERNAL_ERROR, e.to_string(), json!(null))
                            .await;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket connection closed by client: {}", addr);
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket error from {}: {}", addr, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = shutdown.recv() => {
                let _ = tx.try_send(Message::Close(None));
                break;
            }
        }
    }

    // Cleanup on disconnect
    if let Some(user_id) = conn.user_id.take() {
        if state.release(&user_id, conn.id).await {
            info!("Member {} went offline", user_id);
        }
    }

    drop(conn);
    drop(tx);
    let _ = forward_task.await;

    Ok(())
}

/// Handle a JSON-RPC message
async fn handle_message(
    text: &str,
    state: &Arc<SharedState>,
    conn: &mut Connection,
) -> HandlerResult {
    let request: JsonRpcRequest = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(e) => {
            return conn
                .reply_error(
                    error_codes::PARSE_ERROR,
                    format!("Failed to parse JSON: {}", e),
                    json!(null),
                )
                .await;
        }
    };

    let request_id = request.id.clone().unwrap_or(json!(null));
    let method = request.method.clone();

    match method.as_str() {
        methods::REGISTER => handle_register(request, state, conn).await,
        methods::PING => conn.reply(JsonRpcResponse::new(json!("pong"), request_id)).await,
        m if methods::is_envelope(m) => handle_envelope(request, state, conn).await,
        _ => {
            conn.reply_error(
                error_codes::METHOD_NOT_FOUND,
                format!("Unknown method: {}", method),
                request_id,
            )
            .await
        }
    }
}

/// Handle `register`
///
/// The latest registration of a member id wins; the connection that held it
/// before stops receiving envelopes.
async fn handle_register(
    request: JsonRpcRequest,
    state: &Arc<SharedState>,
    conn: &mut Connection,
) -> HandlerResult {
    let request_id = request.id.clone().unwrap_or(json!(null));

    let params: RegisterParams = match serde_json::from_value(request.params) {
        Ok(params) => params,
        Err(e) => {
            return conn
                .reply_error(
                    error_codes::INVALID_PARAMS,
                    format!("Invalid register params: {}", e),
                    request_id,
                )
                .await;
        }
    };

    let user_id = params.user_id.trim().to_string();
    if user_id.is_empty() {
        return conn
            .reply_error(
                error_codes::INVALID_PARAMS,
                "userId must not be empty".to_string(),
                request_id,
            )
            .await;
    }

    if let Some(previous) = conn.user_id.replace(user_id.clone()) {
        if previous != user_id {
            state.release(&previous, conn.id).await;
        }
    }

    let replaced = state.members.write().await.insert(
        user_id.clone(),
        MemberConnection {
            connection_id: conn.id,
            connected_at: current_timestamp(),
            tx: conn.tx.clone(),
        },
    );
    match replaced {
        Some(old) if old.connection_id != conn.id => {
            info!("Member {} re-registered on connection {}", user_id, conn.id)
        }
        _ => info!("Member {} registered on connection {}", user_id, conn.id),
    }

    if request.id.is_some() {
        conn.reply(JsonRpcResponse::new(
            json!({ "success": true, "userId": user_id }),
            request_id,
        ))
        .await?;
    }

    Ok(())
}

/// Handle a session-control envelope
///
/// The sender must be registered and may only send as itself. Envelopes for
/// members that are not online are dropped.
async fn handle_envelope(
    request: JsonRpcRequest,
    state: &Arc<SharedState>,
    conn: &mut Connection,
) -> HandlerResult {
    let request_id = request.id.clone().unwrap_or(json!(null));

    let envelope = match SignalEnvelope::from_request(&request) {
        Ok(envelope) => envelope,
        Err(e) => {
            return conn
                .reply_error(error_codes::INVALID_PARAMS, e.to_string(), request_id)
                .await;
        }
    };

    let Some(user_id) = conn.user_id.as_deref() else {
        return conn
            .reply_error(
                error_codes::NOT_REGISTERED,
                format!("{} sent before register", envelope.method()),
                request_id,
            )
            .await;
    };

    if envelope.from_id() != user_id {
        warn!(
            "Connection {} registered as {} tried to send as {}",
            conn.id,
            user_id,
            envelope.from_id()
        );
        return conn
            .reply_error(
                error_codes::SENDER_MISMATCH,
                format!(
                    "fromUserId {} does not match registered id {}",
                    envelope.from_id(),
                    user_id
                ),
                request_id,
            )
            .await;
    }

    if !state.owns(user_id, conn.id).await {
        return conn
            .reply_error(
                error_codes::NOT_REGISTERED,
                format!("{} is registered on another connection", user_id),
                request_id,
            )
            .await;
    }

    let delivered = match state.route_to(envelope.to_id()).await {
        Some(target) => {
            debug!(
                "Relaying {} from {} to {}",
                envelope.method(),
                envelope.from_id(),
                envelope.to_id()
            );
            // A recipient that stops reading must not stall the sender
            match target.try_send(Message::Text(envelope.to_json()?)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Outbound queue of {} is full, dropping {}",
                        envelope.to_id(),
                        envelope.method()
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(
                        "Member {} disconnected, dropping {}",
                        envelope.to_id(),
                        envelope.method()
                    );
                    false
                }
            }
        }
        None => {
            debug!(
                "Dropping {} for offline member {}",
                envelope.method(),
                envelope.to_id()
            );
            false
        }
    };

    if request.id.is_some() {
        conn.reply(JsonRpcResponse::new(
            json!({ "delivered": delivered }),
            request_id,
        ))
        .await?;
    }

    Ok(())
}

/// Get current Unix timestamp
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
