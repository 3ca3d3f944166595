//! One collaborative file: the single apply loop that owns the document.
//!
//! ```text
//!  Session handle ──Command──┐
//!                            ▼
//!  Transport ──TransportEvent──► apply loop ──► TextDocument, UpdateLog,
//!                            ▲                  AwarenessRegistry,
//!  ticker (tick_interval) ───┘                  EditorBinding, FollowController
//! ```
//!
//! Every mutation goes through the loop in arrival order, so nothing here
//! needs a lock. The loop suspends only while waiting for the next input.
//!
//! ## Resync handshake
//!
//! ```text
//!  A (reconnected)                       B (or the relay)
//!    │── ResyncRequest{sv_A} ───────────────►│
//!    │◄── ResyncResponse{to: A, sv_B, B∖A} ──│
//!    │── Update{A∖B} ───────────────────────►│
//! ```
//!
//! Local batches are held back while a handshake is outstanding; the
//! `A∖B` push carries them.

use std::time::{Duration, Instant};

use tandem_core::{
    AppliedEffect, ClientId, DocumentConfig, Replica, Snapshot, StateVector, TextDocument,
    UpdateLog,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::awareness::{AwarenessConfig, AwarenessEvent, AwarenessRegistry, RemovalReason};
use crate::binding::{transform_selection, EditEvent, EditorBinding, EditorSurface};
use crate::follow::{FollowController, FollowState};
use crate::protocol::{AwarenessFrame, AwarenessState, ChannelId, ControlFrame, Frame, Selection, SyncMessage};
use crate::transport::{Transport, TransportEvent, TransportStatus};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub display_name: String,
    /// Local operations are batched into one frame per interval.
    pub batch_interval: Duration,
    /// Granularity of flushes, sweeps and timeouts.
    pub tick_interval: Duration,
    /// How long to wait for a `ResyncResponse` before asking again.
    pub resync_timeout: Duration,
    /// Requests sent before giving up and resuming normal broadcast.
    pub resync_retries: u32,
    /// Broadcast a text checksum this often; `None` disables the check.
    pub checksum_interval: Option<Duration>,
    /// Answer peers' resync and snapshot requests.
    pub answer_resync: bool,
    pub document: DocumentConfig,
    pub awareness: AwarenessConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "anonymous".to_string(),
            batch_interval: Duration::from_millis(16),
            tick_interval: Duration::from_millis(10),
            resync_timeout: Duration::from_secs(2),
            resync_retries: 3,
            checksum_interval: None,
            answer_resync: true,
            document: DocumentConfig::default(),
            awareness: AwarenessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session disposed")]
    Disposed,
}

enum Query {
    Text(oneshot::Sender<String>),
    Snapshot(oneshot::Sender<Snapshot>),
    StateVector(oneshot::Sender<StateVector>),
    Follow(oneshot::Sender<FollowState>),
    Peers(oneshot::Sender<Vec<AwarenessState>>),
    Status(oneshot::Sender<TransportStatus>),
}

enum Command {
    Bind(Box<dyn EditorSurface>),
    Unbind,
    LocalEdit(EditEvent),
    LocalSelection(Selection),
    Subscribe(mpsc::UnboundedSender<AwarenessEvent>),
    Follow(ClientId),
    Unfollow,
    Query(Query),
    Dispose,
}

/// Handle to a running session. Every method only enqueues work for the
/// apply loop; dropping the handle disposes the session.
pub struct Session {
    channel: ChannelId,
    client_id: ClientId,
    inbox: mpsc::UnboundedSender<Command>,
}

/// Open a session for `channel` and start its apply loop.
///
/// Must be called from within a tokio runtime. With `initial_snapshot`
/// the document is hydrated before the first connect.
pub fn open_session(
    channel: ChannelId,
    replica: Replica,
    mut transport: Box<dyn Transport>,
    config: SessionConfig,
    initial_snapshot: Option<Snapshot>,
) -> Session {
    let doc = match &initial_snapshot {
        Some(snapshot) => {
            log::info!("Hydrating {channel} from a snapshot of {} operations", snapshot.len());
            TextDocument::from_snapshot(replica, config.document.clone(), snapshot)
        }
        None => TextDocument::with_config(replica, config.document.clone()),
    };

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let events = transport.connect(&channel);
    let state = SessionState {
        channel: channel.clone(),
        replica,
        log: UpdateLog::new(config.batch_interval),
        awareness: AwarenessRegistry::new(
            replica.client_id,
            config.display_name.clone(),
            config.awareness.clone(),
        ),
        follow: FollowController::new(),
        binding: None,
        selection: Selection::caret(0),
        subscribers: Vec::new(),
        transport,
        status: TransportStatus::Disconnected,
        resync: Resync::Idle,
        awaiting_snapshot: false,
        last_checksum: None,
        doc,
        config,
    };
    tokio::spawn(state.run(inbox_rx, events));

    Session {
        channel,
        client_id: replica.client_id,
        inbox: inbox_tx,
    }
}

impl Session {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn submit(&self, command: Command) -> Result<(), SessionError> {
        self.inbox.send(command).map_err(|_| SessionError::Disposed)
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Query) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Query(make(tx)))?;
        rx.await.map_err(|_| SessionError::Disposed)
    }

    /// Attach an editor; its content is replaced with the document's.
    pub fn bind(&self, surface: Box<dyn EditorSurface>) -> Result<(), SessionError> {
        self.submit(Command::Bind(surface))
    }

    pub fn unbind(&self) -> Result<(), SessionError> {
        self.submit(Command::Unbind)
    }

    /// Report an edit the host editor has already applied to its buffer.
    pub fn local_edit(&self, edit: EditEvent) -> Result<(), SessionError> {
        self.submit(Command::LocalEdit(edit))
    }

    pub fn local_selection(&self, selection: Selection) -> Result<(), SessionError> {
        self.submit(Command::LocalSelection(selection))
    }

    /// Stream of awareness changes, starting with every currently known peer.
    pub fn on_awareness_change(&self) -> Result<mpsc::UnboundedReceiver<AwarenessEvent>, SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.submit(Command::Subscribe(tx))?;
        Ok(rx)
    }

    pub fn follow(&self, client_id: ClientId) -> Result<(), SessionError> {
        self.submit(Command::Follow(client_id))
    }

    pub fn unfollow(&self) -> Result<(), SessionError> {
        self.submit(Command::Unfollow)
    }

    pub async fn visible_text(&self) -> Result<String, SessionError> {
        self.query(Query::Text).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot, SessionError> {
        self.query(Query::Snapshot).await
    }

    pub async fn state_vector(&self) -> Result<StateVector, SessionError> {
        self.query(Query::StateVector).await
    }

    pub async fn follow_state(&self) -> Result<FollowState, SessionError> {
        self.query(Query::Follow).await
    }

    pub async fn awareness_peers(&self) -> Result<Vec<AwarenessState>, SessionError> {
        self.query(Query::Peers).await
    }

    pub async fn status(&self) -> Result<TransportStatus, SessionError> {
        self.query(Query::Status).await
    }

    /// Leave the channel and stop the apply loop. Returns immediately.
    pub fn dispose(self) {
        let _ = self.inbox.send(Command::Dispose);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resync {
    Idle,
    Awaiting { sent_at: Instant, attempts: u32 },
}

struct SessionState {
    channel: ChannelId,
    replica: Replica,
    config: SessionConfig,
    doc: TextDocument,
    log: UpdateLog,
    awareness: AwarenessRegistry,
    follow: FollowController,
    binding: Option<EditorBinding>,
    /// Local selection while no editor is bound.
    selection: Selection,
    subscribers: Vec<mpsc::UnboundedSender<AwarenessEvent>>,
    transport: Box<dyn Transport>,
    status: TransportStatus,
    resync: Resync,
    awaiting_snapshot: bool,
    last_checksum: Option<Instant>,
}

impl SessionState {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut events = Some(events);
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Session {} open on {}", self.replica.client_id, self.channel);

        loop {
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(Command::Dispose) | None => break,
                    Some(command) => self.on_command(command, Instant::now()),
                },

                event = async {
                    match events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => match event {
                    Some(event) => self.on_transport(event, Instant::now()),
                    None => {
                        log::warn!("Transport for {} stopped; editing stays local", self.channel);
                        events = None;
                        self.status = TransportStatus::Disconnected;
                    }
                },

                _ = ticker.tick() => self.on_tick(Instant::now()),
            }
        }

        self.shutdown();
    }

    // ── Commands ─────────────────────────────────────────────────

    fn on_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Bind(surface) => {
                if let Some(previous) = self.binding.take() {
                    previous.detach();
                }
                let binding = EditorBinding::attach(surface, &self.doc, &self.awareness.peers());
                self.selection = binding.selection();
                self.binding = Some(binding);
                log::debug!("Editor bound to {}", self.channel);
            }
            Command::Unbind => {
                if let Some(binding) = self.binding.take() {
                    self.selection = binding.selection();
                    binding.detach();
                    log::debug!("Editor unbound from {}", self.channel);
                }
            }
            Command::LocalEdit(edit) => self.on_local_edit(&edit, now),
            Command::LocalSelection(selection) => self.set_local_selection(selection, now),
            Command::Subscribe(tx) => {
                let replay = self
                    .awareness
                    .peers()
                    .into_iter()
                    .map(AwarenessEvent::Updated)
                    .all(|event| tx.send(event).is_ok());
                if replay {
                    self.subscribers.push(tx);
                }
            }
            Command::Follow(target) => {
                self.follow.follow(target);
                let cursor = self.awareness.peer(&target).map(|peer| peer.cursor);
                if let (Some(cursor), Some(binding)) = (cursor, self.binding.as_mut()) {
                    binding.center_on(cursor);
                }
            }
            Command::Unfollow => self.follow.unfollow(),
            Command::Query(query) => self.answer(query),
            Command::Dispose => {}
        }
    }

    fn answer(&self, query: Query) {
        match query {
            Query::Text(tx) => {
                let _ = tx.send(self.doc.visible_text());
            }
            Query::Snapshot(tx) => {
                let _ = tx.send(self.doc.snapshot());
            }
            Query::StateVector(tx) => {
                let _ = tx.send(self.doc.state_vector().clone());
            }
            Query::Follow(tx) => {
                let _ = tx.send(self.follow.state());
            }
            Query::Peers(tx) => {
                let _ = tx.send(self.awareness.peers());
            }
            Query::Status(tx) => {
                let _ = tx.send(self.status);
            }
        }
    }

    fn on_local_edit(&mut self, edit: &EditEvent, now: Instant) {
        let result = match self.binding.as_mut() {
            Some(binding) => binding.local_edit(&mut self.doc, edit),
            None => EditorBinding::edit_document(&mut self.doc, edit),
        };
        match result {
            Ok(ops) => {
                log::trace!("Local edit on {}: {} operations", self.channel, ops.len());
                self.log.record_local(ops, now);
                let selection = match &self.binding {
                    Some(binding) => binding.selection(),
                    None => Selection::caret(edit.offset + edit.inserted_text.chars().count()),
                };
                self.set_local_selection(selection, now);
            }
            Err(e) => {
                log::warn!("Rejected local edit on {}: {e}", self.channel);
                if let Some(binding) = self.binding.as_mut() {
                    binding.rehydrate(&self.doc);
                }
            }
        }
    }

    fn set_local_selection(&mut self, selection: Selection, now: Instant) {
        self.selection = selection;
        let range = (!selection.is_caret()).then_some(selection);
        if let Some(state) = self.awareness.set_local(selection.head, range, now) {
            self.send_awareness(state);
        }
    }

    // ── Transport ────────────────────────────────────────────────

    fn on_transport(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Status(status) => {
                if status == self.status {
                    return;
                }
                log::info!("{} is {status:?}", self.channel);
                self.status = status;
                match status {
                    TransportStatus::Connected => self.on_connected(now),
                    TransportStatus::Connecting | TransportStatus::Disconnected => {
                        self.resync = Resync::Idle;
                    }
                }
            }
            TransportEvent::Frame(bytes) => match SyncMessage::decode(&bytes) {
                Ok(msg) => self.on_message(msg, now),
                Err(e) => log::warn!("Dropping malformed frame on {}: {e}", self.channel),
            },
            TransportEvent::Lagged(n) => {
                log::warn!("{} missed {n} frames, resyncing", self.channel);
                self.start_resync(now);
            }
        }
    }

    fn on_connected(&mut self, now: Instant) {
        self.send(Frame::Control(ControlFrame::Join {
            display_name: self.config.display_name.clone(),
        }));
        self.resync = Resync::Idle;
        self.start_resync(now);
        let state = self.awareness.force_broadcast(now);
        self.send_awareness(state);
    }

    fn send(&mut self, frame: Frame) -> bool {
        if self.status != TransportStatus::Connected {
            return false;
        }
        let label = frame.label();
        let msg = SyncMessage::new(self.replica.client_id, self.channel.clone(), frame);
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode {label} for {}: {e}", self.channel);
                return false;
            }
        };
        match self.transport.send(bytes) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Could not send {label} on {}: {e}", self.channel);
                false
            }
        }
    }

    fn send_awareness(&mut self, state: AwarenessState) {
        self.send(Frame::Awareness(AwarenessFrame { state }));
    }

    fn start_resync(&mut self, now: Instant) {
        let attempts = match self.resync {
            Resync::Awaiting { attempts, .. } => attempts + 1,
            Resync::Idle => 1,
        };
        let state_vector = self.doc.state_vector().clone();
        if self.send(Frame::Control(ControlFrame::ResyncRequest { state_vector })) {
            log::debug!("Resync request {attempts} sent on {}", self.channel);
            self.resync = Resync::Awaiting { sent_at: now, attempts };
        }
    }

    fn on_message(&mut self, msg: SyncMessage, now: Instant) {
        let me = self.replica.client_id;
        if msg.sender == me {
            return;
        }
        if msg.channel != self.channel {
            log::trace!("Ignoring {} for {} on {}", msg.frame.label(), msg.channel, self.channel);
            return;
        }
        self.awareness.touch(&msg.sender, now);

        match msg.frame {
            Frame::Update(update) => {
                let effects = UpdateLog::ingest(&mut self.doc, update.operations);
                self.apply_effects(&effects, now);
            }
            Frame::Awareness(frame) => {
                if let Some(event) = self.awareness.on_remote(frame.state, now) {
                    self.emit(event);
                }
            }
            Frame::Control(control) => self.on_control(msg.sender, control, now),
        }

        if self.doc.take_resync_needed() {
            self.start_resync(now);
        }
    }

    fn on_control(&mut self, sender: ClientId, control: ControlFrame, now: Instant) {
        let me = self.replica.client_id;
        match control {
            ControlFrame::Join { display_name } => {
                log::info!("{display_name} ({sender}) joined {}", self.channel);
                let state = self.awareness.force_broadcast(now);
                self.send_awareness(state);
            }
            ControlFrame::Leave => {
                if let Some(event) = self.awareness.remove(&sender, RemovalReason::Left, now) {
                    self.emit(event);
                }
            }
            ControlFrame::ResyncRequest { state_vector } => {
                if !self.config.answer_resync {
                    return;
                }
                let local = self.doc.state_vector().clone();
                let operations = UpdateLog::diff(&self.doc, &local, &state_vector);
                log::debug!("Answering resync from {sender} with {} operations", operations.len());
                self.send(Frame::Control(ControlFrame::ResyncResponse {
                    to: sender,
                    state_vector: local,
                    operations,
                }));
            }
            ControlFrame::ResyncResponse { to, state_vector, operations } => {
                if to != me {
                    return;
                }
                let received = operations.len();
                let effects = UpdateLog::ingest(&mut self.doc, operations);
                self.apply_effects(&effects, now);

                let local = self.doc.state_vector().clone();
                let missing = UpdateLog::diff(&self.doc, &local, &state_vector);
                let pushed = missing.len();
                self.log.clear_batch();
                if !missing.is_empty() {
                    let frame = self.log.frame_for(&self.doc, missing);
                    self.send(Frame::Update(frame));
                }
                self.resync = Resync::Idle;
                log::info!(
                    "Resync on {} with {sender} done: {received} received, {pushed} pushed",
                    self.channel
                );
            }
            ControlFrame::Checksum { state_vector, digest } => {
                if &state_vector != self.doc.state_vector() {
                    return;
                }
                let local = self.doc.checksum();
                if local != digest && !self.awaiting_snapshot {
                    log::error!(
                        "Divergence on {} against {sender}: digest {local:016x} != {digest:016x} at the same state vector; requesting snapshot",
                        self.channel
                    );
                    if self.send(Frame::Control(ControlFrame::SnapshotRequest)) {
                        self.awaiting_snapshot = true;
                    }
                }
            }
            ControlFrame::SnapshotRequest => {
                if self.config.answer_resync {
                    let snapshot = self.doc.snapshot();
                    self.send(Frame::Control(ControlFrame::SnapshotResponse { to: sender, snapshot }));
                }
            }
            ControlFrame::SnapshotResponse { to, snapshot } => {
                if to == me && self.awaiting_snapshot {
                    self.replace_document(&snapshot);
                }
            }
            ControlFrame::Ping => {
                self.send(Frame::Control(ControlFrame::Pong));
            }
            ControlFrame::Pong => {}
        }
    }

    /// Discard the local replica (buffered operations included) and rebuild
    /// it from `snapshot` under a fresh site id.
    fn replace_document(&mut self, snapshot: &Snapshot) {
        let discarded = self.doc.pending_len() + self.log.pending_len();
        self.replica = self.replica.rotate_site();
        self.doc = TextDocument::from_snapshot(self.replica, self.config.document.clone(), snapshot);
        self.log = UpdateLog::new(self.config.batch_interval);
        self.awaiting_snapshot = false;
        log::error!(
            "Replaced {} from a snapshot of {} operations ({discarded} local operations discarded, new site {})",
            self.channel,
            snapshot.len(),
            self.replica.site_id
        );

        let len = self.doc.len();
        match self.binding.as_mut() {
            Some(binding) => {
                binding.rehydrate(&self.doc);
                self.selection = binding.selection();
            }
            None => {
                self.selection = Selection::new(self.selection.anchor.min(len), self.selection.head.min(len));
            }
        }
    }

    fn apply_effects(&mut self, effects: &[AppliedEffect], now: Instant) {
        if !effects.iter().any(AppliedEffect::is_applied) {
            return;
        }
        let selection = match self.binding.as_mut() {
            Some(binding) => {
                binding.apply_effects(effects);
                binding.selection()
            }
            None => effects.iter().fold(self.selection, |selection, effect| match *effect {
                AppliedEffect::Applied { visible_offset, length, .. } => {
                    transform_selection(selection, visible_offset, length)
                }
                _ => selection,
            }),
        };
        if selection != self.selection {
            self.set_local_selection(selection, now);
        }
    }

    fn emit(&mut self, event: AwarenessEvent) {
        if let Some(binding) = self.binding.as_mut() {
            binding.apply_awareness(&event);
        }
        if let Some(offset) = self.follow.on_awareness(&event) {
            if let Some(binding) = self.binding.as_mut() {
                binding.center_on(offset);
            }
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ── Timers ───────────────────────────────────────────────────

    fn on_tick(&mut self, now: Instant) {
        let expired = self.doc.expire_pending(now);
        if expired > 0 {
            log::warn!("{expired} buffered operations expired on {}", self.channel);
        }
        if self.doc.take_resync_needed() {
            self.start_resync(now);
        }

        if let Resync::Awaiting { sent_at, attempts } = self.resync {
            if now.saturating_duration_since(sent_at) >= self.config.resync_timeout {
                if attempts < self.config.resync_retries {
                    self.start_resync(now);
                } else {
                    log::warn!(
                        "Resync on {} unanswered after {attempts} attempts; resuming broadcast",
                        self.channel
                    );
                    self.resync = Resync::Idle;
                }
            }
        }

        for event in self.awareness.sweep(now) {
            self.emit(event);
        }

        if self.status != TransportStatus::Connected {
            return;
        }

        if self.resync == Resync::Idle && self.log.is_due(now) {
            if let Some(frame) = self.log.flush(&self.doc) {
                self.send(Frame::Update(frame));
            }
        }

        if let Some(state) = self.awareness.poll(now) {
            self.send_awareness(state);
        }

        if let Some(interval) = self.config.checksum_interval {
            let due = self
                .last_checksum
                .map_or(true, |last| now.saturating_duration_since(last) >= interval);
            if due {
                self.last_checksum = Some(now);
                self.send(Frame::Control(ControlFrame::Checksum {
                    state_vector: self.doc.state_vector().clone(),
                    digest: self.doc.checksum(),
                }));
            }
        }
    }

    fn shutdown(&mut self) {
        // Batched edits go out ahead of Leave.
        if self.status == TransportStatus::Connected {
            if let Some(frame) = self.log.flush(&self.doc) {
                self.send(Frame::Update(frame));
            }
        } else if self.log.pending_len() > 0 {
            log::warn!(
                "Closing {} offline with {} unsent operations",
                self.channel,
                self.log.pending_len()
            );
        }
        self.send(Frame::Control(ControlFrame::Leave));
        self.transport.disconnect();
        self.status = TransportStatus::Disconnected;

        for event in self.awareness.clear() {
            self.emit(event);
        }
        self.follow.unfollow();
        if let Some(binding) = self.binding.take() {
            binding.detach();
        }
        self.subscribers.clear();
        log::info!("Session {} closed on {}", self.replica.client_id, self.channel);
    }
}
