//! WebSocket signaling server
//!
//! Accepts WebSocket connections and hands each one to
//! [`handle_connection`]. Shutting down stops the accept loop and closes every
//! open connection.

use crate::handler::{handle_connection, SharedState};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// WebSocket signaling relay
pub struct RelayServer {
    listener: TcpListener,

    /// Bound address
    addr: SocketAddr,

    /// Shared state
    state: Arc<SharedState>,
}

impl RelayServer {
    /// Bind the listener
    pub async fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("Signaling relay listening on ws://{}", addr);

        Ok(Self {
            listener,
            addr,
            state: Arc::new(SharedState::new()),
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get shared state (for external access)
    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// Serve connections until `shutdown` completes
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let (close_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let state = Arc::clone(&self.state);
                            let close_rx = close_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state, close_rx).await {
                                    warn!("WebSocket connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept WebSocket connection: {}", e);
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Signaling relay received shutdown signal");
                    break;
                }
            }
        }

        let _ = close_tx.send(());
        info!("Signaling relay accept loop exited");
    }

    /// Serve connections on a background task
    pub fn spawn(self) -> RelayHandle {
        let addr = self.addr;
        let state = self.state();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(self.run(async move {
            let _ = stop_rx.await;
        }));

        RelayHandle {
            addr,
            state,
            stop_tx,
            task,
        }
    }
}

/// Handle for controlling a spawned relay
pub struct RelayHandle {
    addr: SocketAddr,
    state: Arc<SharedState>,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL clients connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// Shut down the relay and close all connections
    pub async fn shutdown(self) {
        info!("Sending shutdown signal to signaling relay");
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            error!("Signaling relay task failed: {}", e);
        }
    }
}
