//! In-memory signaling relay

use crate::signaling::{InboundSignals, SignalEnvelope, SignalingTransport};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

struct Registration {
    token: u64,
    tx: mpsc::UnboundedSender<SignalEnvelope>,
}

#[derive(Default)]
struct RelayState {
    members: HashMap<String, Registration>,
    next_token: u64,
    routed: Vec<SignalEnvelope>,
}

/// Routes envelopes between in-process members by recipient id
///
/// Behaves like the WebSocket relay: the latest registration of a member
/// wins, envelopes for offline members are dropped, and a member may only
/// send envelopes under its own id.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        // A panicking test thread must not wedge the others
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `user_id`, replacing any earlier registration
    pub fn register(&self, user_id: &str) -> (MemoryTransport, InboundSignals) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_token += 1;
        let token = state.next_token;
        state
            .members
            .insert(user_id.to_string(), Registration { token, tx });

        let transport = MemoryTransport {
            user_id: user_id.to_string(),
            token,
            relay: self.clone(),
        };
        (transport, rx)
    }

    /// Drop the registration of `user_id`, closing its inbound stream
    pub fn disconnect(&self, user_id: &str) {
        self.lock().members.remove(user_id);
    }

    pub fn is_registered(&self, user_id: &str) -> bool {
        self.lock().members.contains_key(user_id)
    }

    /// Hand an envelope to its recipient as if another member had sent it
    ///
    /// Returns whether the recipient was online.
    pub fn inject(&self, envelope: SignalEnvelope) -> bool {
        let state = self.lock();
        match state.members.get(envelope.to_id()) {
            Some(member) => member.tx.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Every envelope routed so far, in order
    pub fn routed(&self) -> Vec<SignalEnvelope> {
        self.lock().routed.clone()
    }

    /// Routed envelopes of one method, e.g. `secureDrop:decline`
    pub fn routed_method(&self, method: &str) -> Vec<SignalEnvelope> {
        self.lock()
            .routed
            .iter()
            .filter(|e| e.method() == method)
            .cloned()
            .collect()
    }

    fn route(&self, token: u64, envelope: SignalEnvelope) -> Result<()> {
        let mut state = self.lock();

        match state.members.get(envelope.from_id()) {
            Some(sender) if sender.token == token => {}
            _ => {
                return Err(Error::TransportUnavailable(format!(
                    "{} is not registered with the relay",
                    envelope.from_id()
                )))
            }
        }

        state.routed.push(envelope.clone());
        match state.members.get(envelope.to_id()) {
            Some(recipient) => {
                let _ = recipient.tx.send(envelope);
            }
            None => debug!(
                "Dropping {} for offline member {}",
                envelope.method(),
                envelope.to_id()
            ),
        }
        Ok(())
    }
}

/// One member's connection to a [`MemoryRelay`]
pub struct MemoryTransport {
    user_id: String,
    token: u64,
    relay: MemoryRelay,
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    fn local_id(&self) -> &str {
        &self.user_id
    }

    fn is_connected(&self) -> bool {
        self.relay
            .lock()
            .members
            .get(&self.user_id)
            .is_some_and(|m| m.token == self.token)
    }

    async fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        if envelope.from_id() != self.user_id {
            return Err(Error::SignalingError(format!(
                "{} cannot send as {}",
                self.user_id,
                envelope.from_id()
            )));
        }
        self.relay.route(self.token, envelope)
    }
}
