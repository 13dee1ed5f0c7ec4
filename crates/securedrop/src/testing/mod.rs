//! In-memory signaling and peer connections
//!
//! Lets several session managers talk to each other inside one process
//! without sockets or WebRTC, for tests and embedders.

pub mod network;
pub mod relay;

pub use network::{MemoryConnector, MemoryDataLink, MemoryNetwork, MemoryPeer};
pub use relay::{MemoryRelay, MemoryTransport};

use crate::config::SecureDropConfig;
use crate::session::{SecureDropHandle, SessionEvent, SessionManager, SessionState};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Register `user_id` with `relay` and start a session manager for it
pub fn spawn_member(
    relay: &MemoryRelay,
    network: &MemoryNetwork,
    user_id: &str,
    config: SecureDropConfig,
) -> Result<(SecureDropHandle, JoinHandle<()>)> {
    let (transport, inbound) = relay.register(user_id);
    SessionManager::start(
        config,
        Arc::new(transport),
        inbound,
        Arc::new(network.connector(user_id)),
    )
}

/// Wait until the session state satisfies `predicate`
pub async fn wait_for_state<F>(
    handle: &SecureDropHandle,
    timeout: Duration,
    mut predicate: F,
) -> Result<SessionState>
where
    F: FnMut(&SessionState) -> bool,
{
    let mut state = handle.watch_state();
    let waited = tokio::time::timeout(timeout, async {
        loop {
            {
                let current = state.borrow_and_update();
                if predicate(&*current) {
                    return Ok(current.clone());
                }
            }
            if state.changed().await.is_err() {
                return Err(Error::SessionStopped(
                    "session manager stopped".to_string(),
                ));
            }
        }
    })
    .await;

    waited.map_err(|_| {
        Error::Other(anyhow::anyhow!(
            "state of {} did not match within {:?}, last {}",
            handle.local_id(),
            timeout,
            handle.state()
        ))
    })?
}

/// Wait for the next event matching `predicate`, skipping others
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Result<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let waited = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::SessionStopped(
                        "event stream closed".to_string(),
                    ))
                }
            }
        }
    })
    .await;

    waited.map_err(|_| {
        Error::Other(anyhow::anyhow!(
            "no matching event within {:?}",
            timeout
        ))
    })?
}
