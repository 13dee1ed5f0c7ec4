//! In-memory peer connections
//!
//! Offers and answers are opaque tokens registered with a shared
//! [`MemoryNetwork`]. Applying an answer pairs the two endpoints, opens the
//! data channel on both sides and reports both connections as connected.
//! Data channel messages travel over the peers' event queues, so ordering
//! and connection-id tagging behave like the WebRTC implementation.

use crate::channels::ChannelPayload;
use crate::config::DEFAULT_CHANNEL_LABEL;
use crate::peer::{
    ConnectionId, ConnectionState, DataLink, PeerConnector, PeerEvent, PeerEventKind,
    PeerEventSender, PeerLink, Role,
};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;

const OFFER_ATTR: &str = "a=x-memory-offer:";
const ANSWER_ATTR: &str = "a=x-memory-answer:";

/// Endpoint of a data channel that is wired to the other side
struct RemoteEnd {
    connection_id: ConnectionId,
    events: PeerEventSender,
    link: Weak<MemoryDataLink>,
}

/// In-memory data channel endpoint
pub struct MemoryDataLink {
    label: String,
    open: AtomicBool,
    remote: Mutex<Option<RemoteEnd>>,
    buffered: AtomicUsize,
}

impl MemoryDataLink {
    fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            remote: Mutex::new(None),
            buffered: AtomicUsize::new(0),
        })
    }

    fn remote(&self) -> MutexGuard<'_, Option<RemoteEnd>> {
        self.remote.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Report `amount` bytes as queued until the next send
    pub fn set_buffered_amount(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    fn deliver(&self, payload: ChannelPayload) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelNotOpen(format!(
                "data channel '{}' is closed",
                self.label
            )));
        }

        self.buffered.store(0, Ordering::SeqCst);
        let remote = self.remote();
        let end = remote
            .as_ref()
            .ok_or_else(|| Error::ChannelNotOpen("data channel is not connected".to_string()))?;
        end.events
            .send(PeerEvent::new(
                end.connection_id,
                PeerEventKind::ChannelMessage(payload),
            ))
            .map_err(|_| Error::DataChannelError("remote endpoint is gone".to_string()))
    }

    /// Close both ends; the remote side is told its channel closed
    fn shut(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(end) = self.remote().take() {
            if let Some(link) = end.link.upgrade() {
                link.open.store(false, Ordering::SeqCst);
            }
            let _ = end
                .events
                .send(PeerEvent::new(end.connection_id, PeerEventKind::ChannelClosed));
        }
    }
}

#[async_trait]
impl DataLink for MemoryDataLink {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.deliver(ChannelPayload::Text(text.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.deliver(ChannelPayload::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.shut();
        Ok(())
    }
}

/// One side of a connection as seen by the network
struct Endpoint {
    member_id: String,
    connection_id: ConnectionId,
    events: PeerEventSender,
    link: Arc<MemoryDataLink>,
}

impl Endpoint {
    fn notify(&self, kind: PeerEventKind) {
        let _ = self.events.send(PeerEvent::new(self.connection_id, kind));
    }
}

#[derive(Default)]
struct NetworkState {
    offers: HashMap<String, Arc<Endpoint>>,
    answers: HashMap<String, (String, Arc<Endpoint>)>,
    established: Vec<(Arc<Endpoint>, Arc<Endpoint>)>,
    live: HashMap<String, usize>,
    fail_next_offer: bool,
    rejected_candidates: usize,
}

/// Shared medium for [`MemoryPeer`]s
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connector creating peer connections for `member_id`
    pub fn connector(&self, member_id: &str) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            member_id: member_id.to_string(),
            label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }

    /// Peer connections of `member_id` that have not been closed
    pub fn live_connections(&self, member_id: &str) -> usize {
        self.lock().live.get(member_id).copied().unwrap_or(0)
    }

    /// Make the next `create_offer` fail
    pub fn fail_next_offer(&self) {
        self.lock().fail_next_offer = true;
    }

    /// Remote candidates rejected because no remote description was set
    pub fn rejected_candidates(&self) -> usize {
        self.lock().rejected_candidates
    }

    /// Data channel endpoint of the established connection of `member_id`
    pub fn data_link(&self, member_id: &str) -> Option<Arc<MemoryDataLink>> {
        self.lock().established.iter().find_map(|(a, b)| {
            if a.member_id == member_id {
                Some(Arc::clone(&a.link))
            } else if b.member_id == member_id {
                Some(Arc::clone(&b.link))
            } else {
                None
            }
        })
    }

    /// Simulate connectivity loss on every connection of `member_id`
    ///
    /// Both sides see their connection fail. Returns how many connections
    /// were affected.
    pub fn sever(&self, member_id: &str) -> usize {
        let severed: Vec<_> = {
            let mut state = self.lock();
            let (hit, kept): (Vec<_>, Vec<_>) = state
                .established
                .drain(..)
                .partition(|(a, b)| a.member_id == member_id || b.member_id == member_id);
            state.established = kept;
            hit
        };

        for (a, b) in &severed {
            for endpoint in [a, b] {
                endpoint.link.open.store(false, Ordering::SeqCst);
                endpoint.notify(PeerEventKind::StateChanged(ConnectionState::Failed));
            }
        }
        severed.len()
    }

    fn establish(&self, initiator: Arc<Endpoint>, acceptor: Arc<Endpoint>) {
        *initiator.link.remote() = Some(RemoteEnd {
            connection_id: acceptor.connection_id,
            events: acceptor.events.clone(),
            link: Arc::downgrade(&acceptor.link),
        });
        *acceptor.link.remote() = Some(RemoteEnd {
            connection_id: initiator.connection_id,
            events: initiator.events.clone(),
            link: Arc::downgrade(&initiator.link),
        });
        initiator.link.open.store(true, Ordering::SeqCst);
        acceptor.link.open.store(true, Ordering::SeqCst);

        for endpoint in [&initiator, &acceptor] {
            endpoint.notify(PeerEventKind::StateChanged(ConnectionState::Connected));
            endpoint.notify(PeerEventKind::ChannelOpened(
                Arc::clone(&endpoint.link) as Arc<dyn DataLink>
            ));
        }

        debug!(
            "Memory connection {} <-> {} established",
            initiator.member_id, acceptor.member_id
        );
        self.lock().established.push((initiator, acceptor));
    }

    fn forget(&self, endpoint: &Arc<Endpoint>) {
        let mut state = self.lock();
        state.offers.retain(|_, e| !Arc::ptr_eq(e, endpoint));
        state.answers.retain(|_, (_, e)| !Arc::ptr_eq(e, endpoint));
        state
            .established
            .retain(|(a, b)| !Arc::ptr_eq(a, endpoint) && !Arc::ptr_eq(b, endpoint));
        if let Some(count) = state.live.get_mut(&endpoint.member_id) {
            *count = count.saturating_sub(1);
        }
    }
}

/// [`PeerConnector`] over a [`MemoryNetwork`]
pub struct MemoryConnector {
    network: MemoryNetwork,
    member_id: String,
    label: String,
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn connect(
        &self,
        peer_id: &str,
        role: Role,
        connection_id: ConnectionId,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerLink>> {
        debug!(
            "Memory connection {} of {} to {} as {:?}",
            connection_id, self.member_id, peer_id, role
        );

        let endpoint = Arc::new(Endpoint {
            member_id: self.member_id.clone(),
            connection_id,
            events,
            link: MemoryDataLink::new(&self.label),
        });
        endpoint.notify(PeerEventKind::StateChanged(ConnectionState::Connecting));

        *self
            .network
            .lock()
            .live
            .entry(self.member_id.clone())
            .or_default() += 1;

        Ok(Box::new(MemoryPeer {
            network: self.network.clone(),
            endpoint,
            role,
            offer_token: Mutex::new(None),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

/// In-memory [`PeerLink`]
pub struct MemoryPeer {
    network: MemoryNetwork,
    endpoint: Arc<Endpoint>,
    role: Role,
    offer_token: Mutex<Option<String>>,
    remote_set: AtomicBool,
    closed: AtomicBool,
}

impl MemoryPeer {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PeerConnectionError(
                "peer connection is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn gather_candidate(&self) {
        let port = 50_000 + (self.endpoint.connection_id % 10_000) as u16;
        self.endpoint
            .notify(PeerEventKind::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
                    port
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            }));
    }
}

fn description(attr: &str, token: &str) -> String {
    format!(
        "v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n{}{}\r\n",
        attr, token
    )
}

fn token_of(sdp: &str, attr: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.strip_prefix(attr))
        .map(|token| token.trim().to_string())
}

#[async_trait]
impl PeerLink for MemoryPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        if self.role != Role::Initiator {
            return Err(Error::SdpError("acceptor cannot create an offer".to_string()));
        }

        let token = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.network.lock();
            if std::mem::take(&mut state.fail_next_offer) {
                return Err(Error::SdpError("Failed to create offer: injected".to_string()));
            }
            state
                .offers
                .insert(token.clone(), Arc::clone(&self.endpoint));
        }
        *self.offer_token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        self.gather_candidate();
        Ok(SessionDescription::offer(description(OFFER_ATTR, &token)))
    }

    async fn create_answer(&self, offer: &SessionDescription) -> Result<SessionDescription> {
        self.ensure_open()?;
        if offer.sdp_type != SdpType::Offer {
            return Err(Error::SdpError(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }

        let offer_token = token_of(&offer.sdp, OFFER_ATTR)
            .ok_or_else(|| Error::SdpError("offer carries no memory token".to_string()))?;
        let answer_token = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.network.lock();
            if !state.offers.contains_key(&offer_token) {
                return Err(Error::SdpError(format!("unknown offer {}", offer_token)));
            }
            state.answers.insert(
                answer_token.clone(),
                (offer_token, Arc::clone(&self.endpoint)),
            );
        }
        self.remote_set.store(true, Ordering::SeqCst);

        self.gather_candidate();
        Ok(SessionDescription::answer(description(
            ANSWER_ATTR,
            &answer_token,
        )))
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if answer.sdp_type != SdpType::Answer {
            return Err(Error::SdpError(format!(
                "expected an answer, got {:?}",
                answer.sdp_type
            )));
        }

        let own_offer = self
            .offer_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::SdpError("no local offer".to_string()))?;
        let answer_token = token_of(&answer.sdp, ANSWER_ATTR)
            .ok_or_else(|| Error::SdpError("answer carries no memory token".to_string()))?;

        let acceptor = {
            let mut state = self.network.lock();
            match state.answers.remove(&answer_token) {
                Some((offer_token, acceptor)) if offer_token == own_offer => {
                    state.offers.remove(&offer_token);
                    acceptor
                }
                _ => {
                    return Err(Error::SdpError(format!(
                        "answer {} does not match offer {}",
                        answer_token, own_offer
                    )))
                }
            }
        };
        self.remote_set.store(true, Ordering::SeqCst);

        self.network
            .establish(Arc::clone(&self.endpoint), acceptor);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if !self.remote_set.load(Ordering::SeqCst) {
            self.network.lock().rejected_candidates += 1;
            return Err(Error::IceCandidateError(
                "remote description not set".to_string(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(Error::IceCandidateError(format!(
                "malformed candidate {}",
                candidate.candidate
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.endpoint.link.shut();
        self.network.forget(&self.endpoint);
        debug!(
            "Memory connection {} of {} closed",
            self.endpoint.connection_id, self.endpoint.member_id
        );
        Ok(())
    }
}
