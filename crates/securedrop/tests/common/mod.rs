#![allow(dead_code)]

use securedrop::testing::{spawn_member, wait_for_event, wait_for_state, MemoryNetwork, MemoryRelay};
use securedrop::{SecureDropConfig, SecureDropHandle, SessionEvent, SessionState};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Relay and peer network shared by the members of one test
#[derive(Clone, Default)]
pub struct Fixture {
    pub relay: MemoryRelay,
    pub network: MemoryNetwork,
}

pub struct Member {
    pub id: String,
    pub handle: SecureDropHandle,
    pub events: broadcast::Receiver<SessionEvent>,
    pub task: JoinHandle<()>,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        Self::default()
    }

    pub fn member(&self, id: &str) -> Member {
        self.member_with(id, SecureDropConfig::default())
    }

    pub fn member_with(&self, id: &str, config: SecureDropConfig) -> Member {
        let (handle, task) = spawn_member(&self.relay, &self.network, id, config).unwrap();
        let events = handle.subscribe();
        Member {
            id: id.to_string(),
            handle,
            events,
            task,
        }
    }
}

impl Member {
    pub async fn wait_state(&self, predicate: impl FnMut(&SessionState) -> bool) -> SessionState {
        wait_for_state(&self.handle, WAIT, predicate).await.unwrap()
    }

    pub async fn wait_idle(&self) {
        self.wait_state(|s| s.is_idle()).await;
    }

    pub async fn wait_event(&mut self, predicate: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
        wait_for_event(&mut self.events, WAIT, predicate)
            .await
            .unwrap()
    }

    /// Collect events until one matches `last`, returning all of them
    pub async fn collect_until(
        &mut self,
        mut last: impl FnMut(&SessionEvent) -> bool,
    ) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = wait_for_event(&mut self.events, WAIT, |_| true)
                .await
                .unwrap();
            let done = last(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }
}

pub fn chat_with(peer: &str) -> SessionState {
    SessionState::Chat {
        peer_id: peer.to_string(),
    }
}

/// Establish a session from `a` to `b` and wait for both data channels
pub async fn connect(a: &mut Member, b: &mut Member) {
    a.handle.initiate(&b.id).await.unwrap();
    b.wait_state(|s| matches!(s, SessionState::Confirm { .. }))
        .await;
    b.handle.accept_incoming().await.unwrap();

    a.wait_event(|e| matches!(e, SessionEvent::ChannelOpen { .. }))
        .await;
    b.wait_event(|e| matches!(e, SessionEvent::ChannelOpen { .. }))
        .await;

    assert_eq!(a.handle.state(), chat_with(&b.id));
    assert_eq!(b.handle.state(), chat_with(&a.id));
}
