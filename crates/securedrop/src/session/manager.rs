//! Session manager
//!
//! One task owns the session state, the live connection, the receive-side
//! transfer records and the message history. Commands from
//! [`SecureDropHandle`], envelopes from the relay, peer connection events and
//! offer timer ticks are processed one at a time, so every handler sees the
//! state it acts on.

use super::events::SessionEvent;
use super::history::{ChatMessage, Direction, MessageHistory, MessagePayload, MessageStatus};
use super::machine::{step, Effect, Input, Transition};
use super::state::SessionState;
use crate::channels::{
    decode_payload, stream_file, ChannelPayload, ControlFrame, FileMeta, InboundFrame,
    OutgoingFile, TransferAssembler,
};
use crate::config::{ChunkFraming, SecureDropConfig, TransferConfig};
use crate::error::ProtocolViolation;
use crate::peer::{
    ConnectionId, DataLink, PeerConnector, PeerEvent, PeerEventKind, PeerEventSender, PeerLink,
    Role,
};
use crate::signaling::{
    IceCandidate, InboundSignals, SessionDescription, SignalEnvelope, SignalingTransport,
};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Capacity of the event broadcast; slow subscribers observe `Lagged`
const EVENT_CAPACITY: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Initiate {
        target_id: String,
        reply: Reply<()>,
    },
    Accept {
        reply: Reply<()>,
    },
    Decline {
        reply: Reply<()>,
    },
    End {
        reply: Reply<()>,
    },
    SendMessage {
        text: String,
        reply: Reply<ChatMessage>,
    },
    BeginFileSend {
        meta: FileMeta,
        reply: Reply<(ChatMessage, Arc<dyn DataLink>)>,
    },
    FinishFileSend {
        transfer_id: String,
        failure: Option<String>,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// The one live peer connection and its data channel
struct ActiveConnection {
    id: ConnectionId,
    peer: Box<dyn PeerLink>,
    data: Option<Arc<dyn DataLink>>,
}

/// Owner of the single SecureDrop session of a member
pub struct SessionManager {
    config: SecureDropConfig,
    local_id: String,
    signaling: Arc<dyn SignalingTransport>,
    inbound: Option<InboundSignals>,
    connector: Arc<dyn PeerConnector>,

    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    history: Arc<RwLock<MessageHistory>>,

    connection: Option<ActiveConnection>,
    pending_candidates: Vec<IceCandidate>,
    assembler: TransferAssembler,

    next_connection_id: ConnectionId,
    timer_generation: u64,

    peer_tx: PeerEventSender,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    timer_tx: mpsc::UnboundedSender<u64>,
    timer_rx: mpsc::UnboundedReceiver<u64>,
    commands: mpsc::Receiver<Command>,
}

impl SessionManager {
    /// Start a session manager task
    ///
    /// # Arguments
    ///
    /// * `config` - Validated before anything starts
    /// * `signaling` - Registered relay connection of the local member
    /// * `inbound` - Envelopes addressed to the local member
    /// * `connector` - Factory for peer connections
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: SecureDropConfig,
        signaling: Arc<dyn SignalingTransport>,
        inbound: InboundSignals,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<(SecureDropHandle, JoinHandle<()>)> {
        config.validate()?;

        let local_id = signaling.local_id().to_string();
        if local_id.is_empty() {
            return Err(Error::InvalidConfig(
                "local member id must not be empty".to_string(),
            ));
        }

        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let history = Arc::new(RwLock::new(MessageHistory::new()));

        let handle = SecureDropHandle {
            local_id: local_id.clone(),
            commands: command_tx,
            state: state_rx,
            events: events.clone(),
            history: Arc::clone(&history),
            transfer: config.transfer.clone(),
            send_slot: Arc::new(Semaphore::new(1)),
        };

        let manager = Self {
            assembler: TransferAssembler::from_config(&config.transfer),
            config,
            local_id,
            signaling,
            inbound: Some(inbound),
            connector,
            state: SessionState::Idle,
            state_tx,
            events,
            history,
            connection: None,
            pending_candidates: Vec::new(),
            next_connection_id: 0,
            timer_generation: 0,
            peer_tx,
            peer_rx,
            timer_tx,
            timer_rx,
            commands: command_rx,
        };

        let task = tokio::spawn(manager.run());
        Ok((handle, task))
    }

    /// Connect to the relay over WebSocket as `user_id` and start a manager
    /// using WebRTC peer connections
    #[cfg(feature = "rtc")]
    pub async fn connect(
        config: SecureDropConfig,
        user_id: &str,
    ) -> Result<(SecureDropHandle, JoinHandle<()>)> {
        config.validate()?;

        let (client, inbound) =
            crate::signaling::SignalingClient::connect(&config.signaling_url, user_id).await?;
        let connector = crate::peer::RtcConnector::new(&config);

        Self::start(config, Arc::new(client), inbound, Arc::new(connector))
    }

    async fn run(mut self) {
        info!("Session manager started for {}", self.local_id);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All handles dropped");
                        self.shutdown().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }

                envelope = recv_inbound(&mut self.inbound) => match envelope {
                    Some(envelope) => self.handle_signal(envelope).await,
                    None => {
                        warn!("Signaling connection lost");
                        self.inbound = None;
                        self.drive_logged(Input::SignalingLost).await;
                    }
                },

                Some(event) = self.peer_rx.recv() => self.handle_peer_event(event).await,

                Some(generation) = self.timer_rx.recv() => {
                    if generation == self.timer_generation {
                        info!("No answer within the offer timeout");
                        self.drive_logged(Input::WaitTimedOut).await;
                    }
                }
            }
        }

        info!("Session manager stopped for {}", self.local_id);
    }

    /// Returns false once the manager should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Initiate { target_id, reply } => {
                let _ = reply.send(self.initiate(target_id).await);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.drive(Input::Accept).await);
            }
            Command::Decline { reply } => {
                let _ = reply.send(self.drive(Input::Decline).await);
            }
            Command::End { reply } => {
                let _ = reply.send(self.drive(Input::End).await);
            }
            Command::SendMessage { text, reply } => {
                let _ = reply.send(self.send_message(text).await);
            }
            Command::BeginFileSend { meta, reply } => {
                let _ = reply.send(self.begin_file_send(meta).await);
            }
            Command::FinishFileSend {
                transfer_id,
                failure,
                reply,
            } => {
                self.finish_file_send(&transfer_id, failure).await;
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn initiate(&mut self, target_id: String) -> Result<()> {
        let target_id = target_id.trim().to_string();
        if target_id.is_empty() {
            return Err(Error::InvalidState(
                "target member id must not be empty".to_string(),
            ));
        }
        if target_id == self.local_id {
            return Err(Error::InvalidState(
                "cannot start a session with yourself".to_string(),
            ));
        }
        if self.inbound.is_none() || !self.signaling.is_connected() {
            return Err(Error::TransportUnavailable(
                "signaling connection is down".to_string(),
            ));
        }

        self.drive(Input::Initiate { target_id }).await
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        if envelope.to_id() != self.local_id {
            debug!(
                "Dropping {} addressed to {}",
                envelope.method(),
                envelope.to_id()
            );
            return;
        }

        debug!("Received {} from {}", envelope.method(), envelope.from_id());
        self.drive_logged(Input::Signal(envelope)).await;
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(connection) = self
            .connection
            .as_mut()
            .filter(|c| c.id == event.connection_id)
        else {
            debug!(
                "Dropping {:?} from stale connection {}",
                event.kind, event.connection_id
            );
            return;
        };

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                self.drive_logged(Input::LocalCandidate(candidate)).await;
            }
            PeerEventKind::StateChanged(connection_state) => {
                debug!("Peer connection state: {:?}", connection_state);
                self.emit(SessionEvent::ConnectionStateChanged(connection_state));
                self.drive_logged(Input::ConnectionChanged(connection_state))
                    .await;
            }
            PeerEventKind::ChannelOpened(link) => {
                info!("Data channel '{}' open", link.label());
                connection.data = Some(link);
                if let Some(peer_id) = self.state.peer_id() {
                    let peer_id = peer_id.to_string();
                    self.emit(SessionEvent::ChannelOpen { peer_id });
                }
            }
            PeerEventKind::ChannelMessage(payload) => self.handle_payload(payload).await,
            PeerEventKind::ChannelClosed => {
                connection.data = None;
                self.drive_logged(Input::ChannelClosed).await;
            }
        }
    }

    /// Run one input through the state machine and carry out its effects
    async fn drive(&mut self, input: Input) -> Result<()> {
        let transition = step(&self.state, input)?;
        self.commit(transition).await
    }

    /// [`drive`](Self::drive) for inputs no caller is waiting on
    async fn drive_logged(&mut self, input: Input) {
        if let Err(e) = self.drive(input).await {
            warn!("Session error: {}", e);
            self.emit(SessionEvent::Error {
                message: e.to_string(),
            });
        }
    }

    /// Apply a transition
    ///
    /// A failed negotiation effect aborts the rest of the transition and
    /// feeds [`Input::NegotiationFailed`] back into the machine. Observers
    /// see the new state, then the transition's events, only after all of
    /// its effects ran.
    async fn commit(&mut self, transition: Transition) -> Result<()> {
        let mut pending = Some(transition);
        let mut failure = None;
        let mut announcements = Vec::new();

        while let Some(Transition { next, effects }) = pending.take() {
            self.state = next;

            for effect in effects {
                if let Effect::Emit(event) = effect {
                    announcements.push(event);
                    continue;
                }
                if let Err(e) = self.apply(effect).await {
                    warn!("Negotiation failed: {}", e);
                    pending = Some(step(&self.state, Input::NegotiationFailed)?);
                    if failure.is_none() {
                        failure = Some(e);
                    }
                    break;
                }
            }
        }

        self.publish_state().await;
        for event in announcements {
            self.emit(event);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn publish_state(&mut self) {
        if *self.state_tx.borrow() == self.state {
            return;
        }

        info!("Session {} -> {}", *self.state_tx.borrow(), self.state);
        let cleared = if self.state.is_idle() {
            let mut history = self.history.write().await;
            let had_entries = !history.is_empty();
            history.clear();
            had_entries
        } else {
            false
        };

        self.state_tx.send_replace(self.state.clone());
        self.emit(SessionEvent::StateChanged(self.state.clone()));
        if cleared {
            self.emit(SessionEvent::HistoryCleared);
        }
    }

    async fn apply(&mut self, effect: Effect) -> Result<()> {
        match effect {
            Effect::StartOffer { target_id } => self.start_offer(&target_id).await?,
            Effect::StartAnswer { peer_id, offer } => self.start_answer(&peer_id, &offer).await?,
            Effect::ApplyAnswer { answer } => self.apply_answer(&answer).await?,
            Effect::AddCandidate(candidate) => self.add_candidate(&candidate).await,
            Effect::BufferCandidate(candidate) => {
                debug!("Buffering remote candidate");
                self.pending_candidates.push(candidate);
            }
            Effect::SendCandidate { to_id, candidate } => {
                let result = self
                    .signaling
                    .send_candidate(&self.local_id, &to_id, candidate)
                    .await;
                log_relay("candidate", &to_id, result);
            }
            Effect::SendDecline { to_id } => {
                let result = self.signaling.send_decline(&self.local_id, &to_id).await;
                log_relay("decline", &to_id, result);
            }
            Effect::SendEnd { to_id } => {
                let result = self.signaling.send_end(&self.local_id, &to_id).await;
                log_relay("end", &to_id, result);
            }
            Effect::Teardown => self.teardown().await,
            Effect::ArmTimeout => self.arm_timeout(),
            Effect::Emit(event) => self.emit(event),
            Effect::Ignored(why) => debug!("Ignored in {}: {}", self.state, why),
        }
        Ok(())
    }

    #[instrument(skip(self), fields(local_id = %self.local_id))]
    async fn start_offer(&mut self, target_id: &str) -> Result<()> {
        self.open_connection(target_id, Role::Initiator).await?;

        let offer = self.live_peer()?.create_offer().await?;
        self.signaling
            .send_offer(&self.local_id, target_id, offer)
            .await?;

        info!("Offer sent to {}", target_id);
        Ok(())
    }

    #[instrument(skip(self, offer), fields(local_id = %self.local_id))]
    async fn start_answer(&mut self, peer_id: &str, offer: &SessionDescription) -> Result<()> {
        self.open_connection(peer_id, Role::Acceptor).await?;

        let answer = self.live_peer()?.create_answer(offer).await?;
        self.signaling
            .send_answer(&self.local_id, peer_id, answer)
            .await?;
        info!("Answer sent to {}", peer_id);

        self.flush_candidates().await;
        Ok(())
    }

    async fn apply_answer(&mut self, answer: &SessionDescription) -> Result<()> {
        self.live_peer()?.apply_answer(answer).await?;
        debug!("Remote answer applied");

        self.flush_candidates().await;
        Ok(())
    }

    async fn open_connection(&mut self, peer_id: &str, role: Role) -> Result<()> {
        if self.connection.is_some() {
            warn!("Replacing a connection that was not torn down");
            self.teardown().await;
        }

        self.next_connection_id += 1;
        let id = self.next_connection_id;
        let peer = self
            .connector
            .connect(peer_id, role, id, self.peer_tx.clone())
            .await?;

        debug!("Opened connection {} to {} as {:?}", id, peer_id, role);
        self.connection = Some(ActiveConnection {
            id,
            peer,
            data: None,
        });
        Ok(())
    }

    fn live_peer(&self) -> Result<&dyn PeerLink> {
        self.connection
            .as_ref()
            .map(|c| c.peer.as_ref())
            .ok_or_else(|| Error::InvalidState("no live peer connection".to_string()))
    }

    async fn add_candidate(&self, candidate: &IceCandidate) {
        let Some(connection) = &self.connection else {
            debug!("Dropping candidate without a connection");
            return;
        };

        // Late or malformed candidates are expected while connections race teardown
        if let Err(e) = connection.peer.add_ice_candidate(candidate).await {
            debug!("Ignoring remote candidate: {}", e);
        }
    }

    async fn flush_candidates(&mut self) {
        let buffered = std::mem::take(&mut self.pending_candidates);
        if !buffered.is_empty() {
            debug!("Applying {} buffered candidates", buffered.len());
        }
        for candidate in &buffered {
            self.add_candidate(candidate).await;
        }
    }

    /// Release the connection and everything tied to the session
    async fn teardown(&mut self) {
        self.timer_generation += 1;
        self.pending_candidates.clear();

        for meta in self.assembler.abort_all() {
            debug!("Discarding incomplete transfer {}", meta.id);
            self.emit(SessionEvent::TransferFailed {
                transfer_id: Some(meta.id),
                reason: "session ended".to_string(),
            });
        }

        if let Some(connection) = self.connection.take() {
            if let Some(data) = &connection.data {
                if let Err(e) = data.close().await {
                    debug!("Closing data channel: {}", e);
                }
            }
            if let Err(e) = connection.peer.close().await {
                debug!("Closing peer connection: {}", e);
            }
            debug!("Connection {} released", connection.id);
        }
    }

    fn arm_timeout(&mut self) {
        self.timer_generation += 1;
        let Some(secs) = self.config.offer_timeout_secs else {
            return;
        };

        let generation = self.timer_generation;
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let _ = timer_tx.send(generation);
        });
    }

    fn open_link(&self) -> Result<Arc<dyn DataLink>> {
        if !matches!(self.state, SessionState::Chat { .. }) {
            return Err(Error::ChannelNotOpen(format!(
                "no session to send on while {}",
                self.state
            )));
        }

        self.connection
            .as_ref()
            .and_then(|c| c.data.clone())
            .filter(|link| link.is_open())
            .ok_or_else(|| Error::ChannelNotOpen("data channel is not open yet".to_string()))
    }

    async fn send_message(&mut self, text: String) -> Result<ChatMessage> {
        let link = self.open_link()?;
        link.send_text(&ControlFrame::Text { text: text.clone() }.to_json()?)
            .await?;

        let message = ChatMessage::new(
            &self.local_id,
            Direction::Outgoing,
            MessagePayload::Text { text },
            MessageStatus::Sent,
        );
        self.append(message.clone()).await;
        Ok(message)
    }

    async fn begin_file_send(&mut self, meta: FileMeta) -> Result<(ChatMessage, Arc<dyn DataLink>)> {
        let link = self.open_link()?;

        let message = ChatMessage::new(
            &self.local_id,
            Direction::Outgoing,
            MessagePayload::File {
                transfer_id: meta.id,
                name: meta.name,
                size: meta.size,
                mime: meta.mime,
                data: None,
            },
            MessageStatus::Sending,
        );
        self.append(message.clone()).await;
        Ok((message, link))
    }

    async fn finish_file_send(&mut self, transfer_id: &str, failure: Option<String>) {
        let status = match failure {
            None => MessageStatus::Sent,
            Some(_) => MessageStatus::Failed,
        };

        let updated = self
            .history
            .write()
            .await
            .update_transfer(transfer_id, Direction::Outgoing, status, None);
        if let Some(message) = updated {
            self.emit(SessionEvent::MessageUpdated(message));
        }

        if let Some(reason) = failure {
            warn!("Sending {} failed: {}", transfer_id, reason);
            self.emit(SessionEvent::TransferFailed {
                transfer_id: Some(transfer_id.to_string()),
                reason,
            });
        }
    }

    async fn handle_payload(&mut self, payload: ChannelPayload) {
        let Some(peer_id) = self.chat_peer() else {
            debug!("Dropping data channel message outside a session");
            return;
        };

        let frame = match decode_payload(payload, self.config.transfer.chunk_framing) {
            Ok(frame) => frame,
            Err(violation) => return self.report_violation(violation).await,
        };

        match frame {
            InboundFrame::Control(ControlFrame::Text { text }) => {
                let message = ChatMessage::new(
                    &peer_id,
                    Direction::Incoming,
                    MessagePayload::Text { text },
                    MessageStatus::Received,
                );
                self.append(message).await;
            }

            InboundFrame::Control(ControlFrame::FileMeta { meta }) => {
                if let Err(violation) = self.assembler.begin(meta.clone()) {
                    return self.report_violation(violation).await;
                }

                let message = ChatMessage::new(
                    &peer_id,
                    Direction::Incoming,
                    MessagePayload::File {
                        transfer_id: meta.id.clone(),
                        name: meta.name.clone(),
                        size: meta.size,
                        mime: meta.mime.clone(),
                        data: None,
                    },
                    MessageStatus::Receiving,
                );
                self.append(message).await;
                self.emit(SessionEvent::FileStarted(meta));
            }

            InboundFrame::Chunk { transfer_id, data } => {
                match self.assembler.push_chunk(transfer_id.as_deref(), data) {
                    Ok((transfer_id, Some(progress))) => {
                        self.emit(SessionEvent::FileProgress {
                            transfer_id,
                            progress,
                        });
                    }
                    Ok((_, None)) => {}
                    Err(violation) => self.report_violation(violation).await,
                }
            }

            InboundFrame::Control(ControlFrame::FileComplete { id }) => {
                match self.assembler.complete(&id) {
                    Ok((file, progress)) => {
                        info!(
                            "Received file {} ({} bytes) from {}",
                            file.meta.name, file.meta.size, peer_id
                        );
                        self.emit(SessionEvent::FileProgress {
                            transfer_id: id.clone(),
                            progress,
                        });

                        let updated = self.history.write().await.update_transfer(
                            &id,
                            Direction::Incoming,
                            MessageStatus::Received,
                            Some(file.data.clone()),
                        );
                        if let Some(message) = updated {
                            self.emit(SessionEvent::MessageUpdated(message));
                        }
                        self.emit(SessionEvent::FileReceived(file));
                    }
                    Err(violation) => self.report_violation(violation).await,
                }
            }
        }
    }

    /// Log a frame dropped for violating the data channel protocol and fail
    /// the transfer it belongs to, if known
    async fn report_violation(&mut self, violation: ProtocolViolation) {
        warn!("Dropping data channel frame: {}", violation);

        let Some(transfer_id) = violation.transfer_id() else {
            return;
        };

        let updated = self.history.write().await.update_transfer(
            transfer_id,
            Direction::Incoming,
            MessageStatus::Failed,
            None,
        );
        if let Some(message) = updated {
            self.emit(SessionEvent::MessageUpdated(message));
        }
        self.emit(SessionEvent::TransferFailed {
            transfer_id: Some(transfer_id.to_string()),
            reason: violation.to_string(),
        });
    }

    fn chat_peer(&self) -> Option<String> {
        match &self.state {
            SessionState::Chat { peer_id } => Some(peer_id.clone()),
            _ => None,
        }
    }

    async fn append(&mut self, message: ChatMessage) {
        self.history.write().await.push(message.clone());
        self.emit(SessionEvent::MessageAppended(message));
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn shutdown(&mut self) {
        info!("Shutting down session manager for {}", self.local_id);
        if let Err(e) = self.drive(Input::End).await {
            warn!("Ending session on shutdown: {}", e);
        }
        self.teardown().await;
    }
}

async fn recv_inbound(inbound: &mut Option<InboundSignals>) -> Option<SignalEnvelope> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn log_relay(kind: &str, to_id: &str, result: Result<()>) {
    match result {
        Ok(()) => debug!("Relayed {} to {}", kind, to_id),
        Err(e) => warn!("Failed to relay {} to {}: {}", kind, to_id, e),
    }
}

/// Cloneable control surface of a [`SessionManager`]
///
/// Every operation is forwarded to the manager task; after the manager
/// stopped they fail with `Error::SessionStopped`.
#[derive(Clone)]
pub struct SecureDropHandle {
    local_id: String,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    history: Arc<RwLock<MessageHistory>>,
    transfer: TransferConfig,
    /// Single outgoing transfer at a time with raw framing
    send_slot: Arc<Semaphore>,
}

impl std::fmt::Debug for SecureDropHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureDropHandle")
            .field("local_id", &self.local_id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl SecureDropHandle {
    /// Local member id
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Subscribe to session events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the message history
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.history.read().await.entries().to_vec()
    }

    /// Offer a session to `target_id`
    ///
    /// # Errors
    ///
    /// `SessionBusy` unless idle, `TransportUnavailable` when the relay is
    /// unreachable, or the negotiation error that aborted the offer.
    pub async fn initiate(&self, target_id: &str) -> Result<()> {
        let target_id = target_id.to_string();
        self.request(|reply| Command::Initiate { target_id, reply })
            .await
    }

    /// Accept the pending incoming offer
    pub async fn accept_incoming(&self) -> Result<()> {
        self.request(|reply| Command::Accept { reply }).await
    }

    /// Decline the pending incoming offer
    pub async fn decline_incoming(&self) -> Result<()> {
        self.request(|reply| Command::Decline { reply }).await
    }

    /// End the session; a no-op when idle
    pub async fn end(&self) -> Result<()> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Send a chat message to the session peer
    ///
    /// # Errors
    ///
    /// `ChannelNotOpen` outside an established session.
    pub async fn send_message(&self, text: &str) -> Result<ChatMessage> {
        let text = text.to_string();
        self.request(|reply| Command::SendMessage { text, reply })
            .await
    }

    /// Send a file to the session peer
    ///
    /// With raw chunk framing concurrent calls are queued so that one file
    /// is in flight at a time. Progress is published as
    /// [`SessionEvent::SendProgress`].
    pub async fn send_file(&self, file: OutgoingFile) -> Result<ChatMessage> {
        let _permit = match self.transfer.chunk_framing {
            ChunkFraming::Raw => Some(
                Arc::clone(&self.send_slot)
                    .acquire_owned()
                    .await
                    .map_err(|_| stopped())?,
            ),
            ChunkFraming::Tagged => None,
        };

        let meta = file.meta(&uuid::Uuid::new_v4().to_string());
        let begin_meta = meta.clone();
        let (mut message, link) = self
            .request(|reply| Command::BeginFileSend {
                meta: begin_meta,
                reply,
            })
            .await?;

        let events = self.events.clone();
        let transfer_id = meta.id.clone();
        let result = stream_file(link.as_ref(), &meta, file, &self.transfer, |progress| {
            let _ = events.send(SessionEvent::SendProgress {
                transfer_id: transfer_id.clone(),
                progress,
            });
        })
        .await;

        let (done_tx, done_rx) = oneshot::channel();
        let finish = Command::FinishFileSend {
            transfer_id: meta.id.clone(),
            failure: result.as_ref().err().map(|e| e.to_string()),
            reply: done_tx,
        };
        if self.commands.send(finish).await.is_ok() {
            let _ = done_rx.await;
        }

        result?;
        message.status = MessageStatus::Sent;
        Ok(message)
    }

    /// End any session and stop the manager task
    ///
    /// Succeeds if the manager already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
        Ok(())
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())?
    }
}

fn stopped() -> Error {
    Error::SessionStopped("session manager is not running".to_string())
}
