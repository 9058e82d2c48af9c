//! Per-session actor.
//!
//! Every session, inbound or outbound, runs as one task that owns its link,
//! its state machine, its transfers and (while `Connected`) its
//! [`ShareLink`]. The engine talks to it through [`SessionCmd`]s and hears
//! back through [`SessionReport`]s.

use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, info, warn};

use cooplink_core::device::DeviceId;
use cooplink_core::error::{CoreError, ErrorCode};
use cooplink_core::fs::inspect_files;
use cooplink_core::protocol::{
    ConnectCancelPayload, ConnectReplyPayload, ConnectRequestPayload, InputEvent, Message,
    OfferedFile,
};
use cooplink_core::settings::{ScreenEdge, Settings};
use cooplink_core::state::{
    Direction, InvalidTransition, SessionId, SessionInput, SessionState, TaskId, TransferState,
};

use crate::engine::EngineConfig;
use crate::link::Link;
use crate::progress::Progress;
use crate::share::{Peripherals, ShareLink};
use crate::transfer::{TransferContext, Transfers, WorkerReport};

const COMMAND_QUEUE: usize = 32;

/// Events a session publishes, tagged with its id by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A peer asks to pair; answer with accept or reject.
    IncomingRequest { peer: DeviceId, peer_name: String },
    StateChanged {
        state: SessionState,
        reason: Option<ErrorCode>,
    },
    /// The peer offers files; answer with `respond_to_offer`.
    IncomingTransferOffer {
        task_id: TaskId,
        files: Vec<OfferedFile>,
        total_bytes: u64,
    },
    TransferProgress { task_id: TaskId, progress: Progress },
    TransferStateChanged {
        task_id: TaskId,
        direction: Direction,
        state: TransferState,
        reason: Option<ErrorCode>,
    },
}

#[derive(Debug)]
pub(crate) struct SessionReport {
    pub(crate) session_id: SessionId,
    pub(crate) event: SessionEvent,
}

/// Where a session's events go.
#[derive(Clone)]
pub(crate) struct EventSink {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<SessionReport>,
}

impl EventSink {
    pub(crate) fn new(session_id: SessionId, tx: mpsc::UnboundedSender<SessionReport>) -> Self {
        Self { session_id, tx }
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(SessionReport {
            session_id: self.session_id,
            event,
        });
    }
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, CoreError>>;

pub(crate) enum SessionCmd {
    Accept(Reply<()>),
    Reject(Reply<()>),
    Cancel(Reply<()>),
    Close(Reply<()>),
    Submit {
        paths: Vec<PathBuf>,
        reply: Reply<TaskId>,
    },
    RespondToOffer {
        task_id: TaskId,
        accept: bool,
        reply: Reply<()>,
    },
    CancelTransfer {
        task_id: TaskId,
        reply: Reply<()>,
    },
    ForwardInput {
        event: InputEvent,
        reply: Reply<bool>,
    },
    EdgeReached {
        edge: ScreenEdge,
        reply: Reply<bool>,
    },
    ReleaseInput(Reply<()>),
    ClipboardChanged(Reply<bool>),
}

impl SessionCmd {
    /// Answers the command with `err`.
    pub(crate) fn fail(self, err: CoreError) {
        match self {
            Self::Accept(reply)
            | Self::Reject(reply)
            | Self::Cancel(reply)
            | Self::Close(reply)
            | Self::ReleaseInput(reply)
            | Self::RespondToOffer { reply, .. }
            | Self::CancelTransfer { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Submit { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::ForwardInput { reply, .. }
            | Self::EdgeReached { reply, .. }
            | Self::ClipboardChanged(reply) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    /// Answers a command addressed to a session that has already ended.
    pub(crate) fn refuse(self, state: SessionState) {
        fn not_connected<T>() -> Result<T, CoreError> {
            Err(CoreError::Code(ErrorCode::SessionNotConnected))
        }
        let invalid = |input| Err(CoreError::InvalidTransition(InvalidTransition::new(state, input)));

        match self {
            Self::Accept(reply) => {
                let _ = reply.send(invalid(SessionInput::Accept));
            }
            Self::Reject(reply) => {
                let _ = reply.send(invalid(SessionInput::Reject));
            }
            Self::Cancel(reply) => {
                let _ = reply.send(invalid(SessionInput::Cancel));
            }
            Self::Close(reply) => {
                let _ = reply.send(invalid(SessionInput::Close));
            }
            Self::Submit { reply, .. } => {
                let _ = reply.send(not_connected());
            }
            Self::RespondToOffer { task_id, reply, .. } | Self::CancelTransfer { task_id, reply } => {
                let _ = reply.send(Err(CoreError::UnknownTransfer(task_id)));
            }
            Self::ForwardInput { reply, .. }
            | Self::EdgeReached { reply, .. }
            | Self::ClipboardChanged(reply) => {
                let _ = reply.send(not_connected());
            }
            Self::ReleaseInput(reply) => {
                let _ = reply.send(not_connected());
            }
        }
    }
}

pub(crate) enum LinkSource {
    /// Outbound: the connect attempt delivers the link.
    Connecting(oneshot::Receiver<anyhow::Result<Link>>),
    /// Inbound: the peer's connect request has already been read.
    Accepted(Link),
}

pub(crate) struct SessionSetup {
    pub(crate) id: SessionId,
    pub(crate) peer: DeviceId,
    pub(crate) peer_name: String,
    pub(crate) direction: Direction,
    /// Our own identity, sent in the connect request.
    pub(crate) hello: ConnectRequestPayload,
    pub(crate) config: EngineConfig,
}

pub(crate) struct SessionDeps {
    pub(crate) settings: watch::Receiver<Settings>,
    pub(crate) peripherals: Arc<dyn Peripherals>,
    pub(crate) transfers: TransferContext,
    pub(crate) reports: mpsc::UnboundedSender<SessionReport>,
}

pub(crate) fn spawn_session(
    setup: SessionSetup,
    deps: SessionDeps,
    source: LinkSource,
) -> (mpsc::Sender<SessionCmd>, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let (worker_tx, worker_rx) = mpsc::unbounded_channel();
    let (link, pending_link) = match source {
        LinkSource::Connecting(rx) => (None, Some(rx)),
        LinkSource::Accepted(link) => (Some(link), None),
    };

    let actor = SessionActor {
        events: EventSink::new(setup.id, deps.reports),
        setup,
        settings: deps.settings,
        peripherals: deps.peripherals,
        transfer_ctx: deps.transfers,
        state: SessionState::Idle,
        link,
        pending_link,
        deadline: None,
        connected_at: Instant::now(),
        transfers: None,
        share: None,
        worker_tx,
        worker_rx,
    };
    let handle = tokio::spawn(actor.run(cmd_rx));
    (cmd_tx, handle)
}

struct SessionActor {
    setup: SessionSetup,
    events: EventSink,
    settings: watch::Receiver<Settings>,
    peripherals: Arc<dyn Peripherals>,
    transfer_ctx: TransferContext,

    state: SessionState,
    link: Option<Link>,
    pending_link: Option<oneshot::Receiver<anyhow::Result<Link>>>,
    /// Response deadline while the handshake is pending.
    deadline: Option<Instant>,
    connected_at: Instant,

    transfers: Option<Transfers>,
    share: Option<ShareLink>,
    worker_tx: mpsc::UnboundedSender<WorkerReport>,
    worker_rx: mpsc::UnboundedReceiver<WorkerReport>,
}

impl SessionActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SessionCmd>) {
        self.start().await;

        let mut heartbeat = interval(self.setup.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut progress = interval(self.setup.config.progress_interval);
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.state.is_terminal() {
            let deadline = self.deadline;
            let offer_deadline = self.transfers.as_ref().and_then(Transfers::deadline);
            let connected = self.state == SessionState::Connected;

            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        debug!(session_id = %self.setup.id, "Engine gone, closing session");
                        self.close().await;
                    }
                },

                linked = recv_link(&mut self.pending_link) => {
                    self.pending_link = None;
                    self.on_linked(linked).await;
                }

                msg = recv_inbound(&mut self.link) => match msg {
                    Some(msg) => self.on_message(msg).await,
                    None => self.on_transport_lost("connection closed").await,
                },

                Some(report) = self.worker_rx.recv() => {
                    if let Some(transfers) = self.transfers.as_mut() {
                        transfers.on_report(report).await;
                    }
                }

                () = sleep_until_opt(deadline) => self.on_response_timeout().await,

                () = sleep_until_opt(offer_deadline) => {
                    if let Some(transfers) = self.transfers.as_mut() {
                        transfers.on_deadline(Instant::now()).await;
                    }
                }

                _ = heartbeat.tick(), if connected => self.on_heartbeat().await,

                _ = progress.tick(), if connected => {
                    if let Some(transfers) = self.transfers.as_mut() {
                        transfers.sample_progress(Instant::now());
                    }
                }
            }
        }

        debug!(session_id = %self.setup.id, state = ?self.state, "Session actor stopped");
        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            cmd.refuse(self.state);
        }
    }

    async fn start(&mut self) {
        self.deadline = Some(Instant::now() + self.setup.config.response_timeout);
        match self.setup.direction {
            Direction::Outbound => {
                self.apply(SessionInput::Request, None).await;
            }
            Direction::Inbound => {
                self.apply(SessionInput::Incoming, None).await;
                self.events.emit(SessionEvent::IncomingRequest {
                    peer: self.setup.peer.clone(),
                    peer_name: self.setup.peer_name.clone(),
                });
            }
        }
    }

    // ── State changes ───────────────────────────────────────────────

    /// Applies `input` and publishes the new state. `reason` overrides the
    /// state's default reason code.
    async fn apply(&mut self, input: SessionInput, reason: Option<ErrorCode>) -> bool {
        match self.state.on(input) {
            Ok(next) => {
                self.enter(next, reason).await;
                true
            }
            Err(e) => {
                debug!(session_id = %self.setup.id, error = %e, "Ignoring session input");
                false
            }
        }
    }

    async fn enter(&mut self, next: SessionState, reason: Option<ErrorCode>) {
        let was_connected = self.state == SessionState::Connected;
        if was_connected && next != SessionState::Connected {
            self.share = None;
            if let Some(mut transfers) = self.transfers.take() {
                transfers.fail_all(ErrorCode::SessionClosed).await;
            }
        }

        info!(session_id = %self.setup.id, peer = %self.setup.peer, from = ?self.state, to = ?next, "Session state changed");
        self.state = next;
        self.events.emit(SessionEvent::StateChanged {
            state: next,
            reason: reason.or_else(|| next.reason()),
        });

        if next == SessionState::Connected {
            self.deadline = None;
            self.connected_at = Instant::now();
            let local_id = self.setup.hello.device_id.clone();
            self.share = Some(ShareLink::new(local_id, Arc::clone(&self.peripherals)));
            if let Some(link) = self.link.as_ref() {
                self.transfers = Some(Transfers::new(
                    self.transfer_ctx.clone(),
                    self.setup.peer.clone(),
                    link.outbound.clone(),
                    self.events.clone(),
                    self.worker_tx.clone(),
                ));
            }
        }

        if next.is_terminal() {
            self.deadline = None;
            self.pending_link = None;
            // Queued frames are flushed before the writer shuts down.
            self.link = None;
        }
    }

    fn send(&self, msg: Message) {
        if let Some(link) = self.link.as_ref()
            && let Err(e) = link.outbound.send(&msg)
        {
            debug!(session_id = %self.setup.id, error = %e, "Send failed");
        }
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn on_command(&mut self, cmd: SessionCmd) {
        match cmd {
            SessionCmd::Accept(reply) => {
                let _ = reply.send(self.accept().await);
            }
            SessionCmd::Reject(reply) => {
                let _ = reply.send(self.reject().await);
            }
            SessionCmd::Cancel(reply) => {
                let _ = reply.send(self.cancel().await);
            }
            SessionCmd::Close(reply) => {
                self.close().await;
                let _ = reply.send(Ok(()));
            }
            SessionCmd::Submit { paths, reply } => {
                let _ = reply.send(self.submit(&paths).await);
            }
            SessionCmd::RespondToOffer {
                task_id,
                accept,
                reply,
            } => {
                let settings = self.settings.borrow().clone();
                let result = match self.transfers.as_mut() {
                    Some(transfers) => transfers.respond(task_id, accept, &settings).await,
                    None => Err(CoreError::UnknownTransfer(task_id)),
                };
                let _ = reply.send(result);
            }
            SessionCmd::CancelTransfer { task_id, reply } => {
                let result = match self.transfers.as_mut() {
                    Some(transfers) => transfers.cancel(task_id).await,
                    None => Err(CoreError::UnknownTransfer(task_id)),
                };
                let _ = reply.send(result);
            }
            SessionCmd::ForwardInput { event, reply } => {
                let _ = reply.send(self.forward_input(event).await);
            }
            SessionCmd::EdgeReached { edge, reply } => {
                let policy = self.settings.borrow().share_policy();
                let result = self
                    .share
                    .as_mut()
                    .map(|share| share.edge_reached(edge, &policy))
                    .ok_or(CoreError::Code(ErrorCode::SessionNotConnected));
                let _ = reply.send(result);
            }
            SessionCmd::ReleaseInput(reply) => {
                let result = self
                    .share
                    .as_mut()
                    .map(ShareLink::release)
                    .ok_or(CoreError::Code(ErrorCode::SessionNotConnected));
                let _ = reply.send(result);
            }
            SessionCmd::ClipboardChanged(reply) => {
                let _ = reply.send(self.clipboard_changed().await);
            }
        }
    }

    async fn accept(&mut self) -> Result<(), CoreError> {
        if self.state != SessionState::AwaitingConfirmation {
            return Err(InvalidTransition::new(self.state, SessionInput::Accept).into());
        }
        self.send(Message::ConnectReply(ConnectReplyPayload {
            accept: true,
            device_name: self.setup.hello.device_name.clone(),
            reason: None,
        }));
        self.apply(SessionInput::Accept, None).await;
        Ok(())
    }

    async fn reject(&mut self) -> Result<(), CoreError> {
        if self.state != SessionState::AwaitingConfirmation {
            return Err(InvalidTransition::new(self.state, SessionInput::Reject).into());
        }
        self.send(Message::ConnectReply(ConnectReplyPayload {
            accept: false,
            device_name: self.setup.hello.device_name.clone(),
            reason: Some(ErrorCode::Rejected),
        }));
        self.apply(SessionInput::Reject, None).await;
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), CoreError> {
        if self.state != SessionState::Requesting {
            return Err(InvalidTransition::new(self.state, SessionInput::Cancel).into());
        }
        self.send(Message::ConnectCancel(ConnectCancelPayload {
            reason: ErrorCode::Canceled,
        }));
        self.apply(SessionInput::Cancel, None).await;
        Ok(())
    }

    async fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.send(Message::Disconnect);
        self.apply(SessionInput::Close, None).await;
    }

    async fn submit(&mut self, paths: &[PathBuf]) -> Result<TaskId, CoreError> {
        let Some(transfers) = self.transfers.as_mut() else {
            return Err(ErrorCode::SessionNotConnected.into());
        };
        let files = inspect_files(paths).await?;
        Ok(transfers.submit(files).await)
    }

    async fn forward_input(&mut self, event: InputEvent) -> Result<bool, CoreError> {
        let policy = self.settings.borrow().share_policy();
        let share = self
            .share
            .as_mut()
            .ok_or(CoreError::Code(ErrorCode::SessionNotConnected))?;
        let Some(payload) = share.outgoing_input(event, &policy) else {
            return Ok(false);
        };
        self.send(Message::InputEvent(payload));
        Ok(true)
    }

    async fn clipboard_changed(&mut self) -> Result<bool, CoreError> {
        let policy = self.settings.borrow().share_policy();
        let share = self
            .share
            .as_mut()
            .ok_or(CoreError::Code(ErrorCode::SessionNotConnected))?;
        let Some(update) = share.local_clipboard_changed(&policy) else {
            return Ok(false);
        };
        self.send(Message::ClipboardUpdate(update));
        Ok(true)
    }

    // ── Link and peer messages ──────────────────────────────────────

    async fn on_linked(&mut self, linked: anyhow::Result<Link>) {
        match linked {
            Ok(link) => {
                debug!(session_id = %self.setup.id, peer = %link.peer, "Link established");
                self.link = Some(link);
                self.send(Message::ConnectRequest(self.setup.hello.clone()));
            }
            Err(e) => {
                warn!(session_id = %self.setup.id, error = %e, "Could not reach peer");
                self.apply(SessionInput::TransportLost, None).await;
            }
        }
    }

    async fn on_message(&mut self, msg: Message) {
        match msg {
            Message::ConnectReply(reply) => self.on_connect_reply(reply).await,
            Message::ConnectCancel(cancel) if self.state == SessionState::AwaitingConfirmation => {
                let input = if cancel.reason == ErrorCode::TimedOut {
                    SessionInput::Timeout
                } else {
                    SessionInput::Cancel
                };
                info!(session_id = %self.setup.id, reason = ?cancel.reason, "Peer withdrew request");
                self.apply(input, None).await;
            }
            Message::Disconnect => {
                info!(session_id = %self.setup.id, "Peer closed session");
                self.apply(SessionInput::Close, None).await;
            }
            Message::TransferOffer(offer) => {
                let settings = self.settings.borrow().clone();
                if let Some(transfers) = self.transfers.as_mut() {
                    transfers.on_offer(offer, &settings).await;
                }
            }
            Message::TransferDecision(decision) => {
                if let Some(transfers) = self.transfers.as_mut() {
                    transfers.on_decision(decision).await;
                }
            }
            Message::FileChunk(chunk) => {
                if let Some(transfers) = self.transfers.as_mut() {
                    transfers.on_chunk(chunk).await;
                }
            }
            Message::FileEnd(end) => {
                if let Some(transfers) = self.transfers.as_mut() {
                    transfers.on_file_end(end).await;
                }
            }
            Message::TransferDone(done) => {
                if let Some(transfers) = self.transfers.as_mut() {
                    transfers.on_done(done).await;
                }
            }
            Message::TransferCancel(cancel) => {
                if let Some(transfers) = self.transfers.as_mut() {
                    transfers.on_cancel(cancel).await;
                }
            }
            Message::InputEvent(event) => {
                let policy = self.settings.borrow().share_policy();
                if let Some(share) = self.share.as_mut() {
                    share.incoming_input(event, &policy);
                }
            }
            Message::ClipboardUpdate(update) => {
                let policy = self.settings.borrow().share_policy();
                if let Some(share) = self.share.as_mut() {
                    share.incoming_clipboard(update, &policy);
                }
            }
            Message::Error(err) => {
                warn!(session_id = %self.setup.id, code = %err.code, message = %err.message, "Peer reported error");
            }
            other => {
                warn!(session_id = %self.setup.id, msg_type = ?other.msg_type(), state = ?self.state, "Unexpected message");
            }
        }
    }

    async fn on_connect_reply(&mut self, reply: ConnectReplyPayload) {
        if self.state != SessionState::Requesting {
            warn!(session_id = %self.setup.id, state = ?self.state, "Unexpected connect reply");
            return;
        }
        if reply.accept {
            info!(session_id = %self.setup.id, peer_name = %reply.device_name, "Peer accepted");
            self.apply(SessionInput::Accept, None).await;
            return;
        }
        match reply.reason {
            Some(ErrorCode::TimedOut) => {
                self.apply(SessionInput::Timeout, None).await;
            }
            Some(ErrorCode::SessionAlreadyActive) => {
                self.apply(SessionInput::Reject, Some(ErrorCode::SessionAlreadyActive))
                    .await;
            }
            _ => {
                self.apply(SessionInput::Reject, None).await;
            }
        }
    }

    async fn on_response_timeout(&mut self) {
        self.deadline = None;
        match self.state {
            SessionState::Requesting => {
                self.send(Message::ConnectCancel(ConnectCancelPayload {
                    reason: ErrorCode::TimedOut,
                }));
            }
            SessionState::AwaitingConfirmation => {
                self.send(Message::ConnectReply(ConnectReplyPayload {
                    accept: false,
                    device_name: self.setup.hello.device_name.clone(),
                    reason: Some(ErrorCode::TimedOut),
                }));
            }
            _ => return,
        }
        info!(session_id = %self.setup.id, "No answer in time");
        self.apply(SessionInput::Timeout, None).await;
    }

    async fn on_heartbeat(&mut self) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        let limit = self.setup.config.heartbeat_interval * self.setup.config.missed_heartbeats;
        let last_heard = (*link.heard.borrow()).max(self.connected_at);
        if last_heard.elapsed() > limit {
            self.on_transport_lost("heartbeat missed").await;
            return;
        }
        self.send(Message::Ping);
    }

    async fn on_transport_lost(&mut self, cause: &str) {
        warn!(session_id = %self.setup.id, peer = %self.setup.peer, cause, "Transport lost");
        self.link = None;
        self.apply(SessionInput::TransportLost, None).await;
    }
}

async fn recv_link(pending_link: &mut Option<oneshot::Receiver<anyhow::Result<Link>>>) -> anyhow::Result<Link> {
    match pending_link {
        Some(rx) => rx
            .await
            .unwrap_or_else(|_| Err(anyhow!("connect attempt abandoned"))),
        None => pending().await,
    }
}

async fn recv_inbound(link: &mut Option<Link>) -> Option<Message> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use dashmap::DashSet;
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::history::TransferHistory;
    use crate::link::spawn_link;
    use crate::share::NullPeripherals;
    use crate::tcp::{TcpConnection, TcpConnector, TcpListenerFactory, TcpReadHalf, TcpWriteHalf};
    use cooplink_core::fs::DiskSpace;
    use cooplink_core::protocol::{TransferCancelPayload, TransferDecisionPayload};
    use cooplink_core::transport::{Connection, Connector, Listener, ListenerFactory, WriteHalf};

    struct Harness<R = Link> {
        cmd_tx: mpsc::Sender<SessionCmd>,
        reports: mpsc::UnboundedReceiver<SessionReport>,
        /// The remote end, driven by the test.
        remote: R,
        _settings: watch::Sender<Settings>,
        dir: tempfile::TempDir,
    }

    /// Remote end without a link: nothing is read and nothing is answered
    /// unless the test does it.
    struct RawPeer {
        _reader: TcpReadHalf,
        writer: TcpWriteHalf,
    }

    impl RawPeer {
        async fn send(&mut self, msg: &Message) {
            self.writer.write_all(&msg.encode().unwrap()).await.unwrap();
        }
    }

    async fn tcp_pair() -> (TcpConnection, TcpConnection) {
        let mut listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let (client, server) = tokio::join!(TcpConnector.connect(addr), listener.accept());
        (client.unwrap(), server.unwrap())
    }

    async fn into_link(conn: TcpConnection) -> Link {
        let peer = conn.peer();
        let (r, w) = conn.into_split().await.unwrap();
        spawn_link(r, w, BytesMut::new(), peer)
    }

    async fn start(direction: Direction) -> Harness {
        let (client, server) = tcp_pair().await;
        let remote = into_link(server).await;
        start_with(direction, into_link(client).await, remote)
    }

    async fn start_raw(direction: Direction) -> Harness<RawPeer> {
        let (client, server) = tcp_pair().await;
        let (reader, writer) = server.into_split().await.unwrap();
        let remote = RawPeer {
            _reader: reader,
            writer,
        };
        start_with(direction, into_link(client).await, remote)
    }

    fn start_with<R>(direction: Direction, local: Link, remote: R) -> Harness<R> {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            save_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let (settings_tx, settings_rx) = watch::channel(settings);
        let (report_tx, reports) = mpsc::unbounded_channel();

        let setup = SessionSetup {
            id: SessionId(1),
            peer: DeviceId::from("remote"),
            peer_name: "Remote".into(),
            direction,
            hello: ConnectRequestPayload {
                device_id: DeviceId::from("local"),
                device_name: "Local".into(),
                listen_port: 47000,
            },
            config: EngineConfig::default(),
        };
        let deps = SessionDeps {
            settings: settings_rx,
            peripherals: Arc::new(NullPeripherals),
            transfers: TransferContext {
                storage: Arc::new(DiskSpace),
                leases: Arc::new(DashSet::new()),
                history: Arc::new(TransferHistory::default()),
                task_ids: Arc::new(AtomicU64::new(1)),
                chunk_size: 64 * 1024,
                response_timeout: Duration::from_secs(30),
            },
            reports: report_tx,
        };
        let source = match direction {
            Direction::Inbound => LinkSource::Accepted(local),
            Direction::Outbound => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Ok(local));
                LinkSource::Connecting(rx)
            }
        };
        let (cmd_tx, _handle) = spawn_session(setup, deps, source);
        Harness {
            cmd_tx,
            reports,
            remote,
            _settings: settings_tx,
            dir,
        }
    }

    async fn next_state<R>(h: &mut Harness<R>) -> (SessionState, Option<ErrorCode>) {
        loop {
            let report = h.reports.recv().await.expect("session reports closed");
            if let SessionEvent::StateChanged { state, reason } = report.event {
                return (state, reason);
            }
        }
    }

    async fn call<T, R>(h: &Harness<R>, make: impl FnOnce(Reply<T>) -> SessionCmd) -> Result<T, CoreError> {
        let (tx, rx) = oneshot::channel();
        h.cmd_tx.send(make(tx)).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn given_inbound_request_when_accepted_then_peer_told_and_connected() {
        let mut h = start(Direction::Inbound).await;
        assert_eq!(next_state(&mut h).await.0, SessionState::AwaitingConfirmation);

        call(&h, SessionCmd::Accept).await.unwrap();
        assert_eq!(next_state(&mut h).await.0, SessionState::Connected);

        match h.remote.inbound.recv().await {
            Some(Message::ConnectReply(reply)) => assert!(reply.accept),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn given_requesting_session_when_accept_called_then_invalid_transition() {
        let mut h = start(Direction::Outbound).await;
        assert_eq!(next_state(&mut h).await.0, SessionState::Requesting);
        let err = call(&h, SessionCmd::Accept).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn given_outbound_session_when_peer_busy_then_rejected_with_already_active() {
        let mut h = start(Direction::Outbound).await;
        assert_eq!(next_state(&mut h).await.0, SessionState::Requesting);
        assert!(matches!(h.remote.inbound.recv().await, Some(Message::ConnectRequest(_))));

        h.remote
            .outbound
            .send(&Message::ConnectReply(ConnectReplyPayload {
                accept: false,
                device_name: "Remote".into(),
                reason: Some(ErrorCode::SessionAlreadyActive),
            }))
            .unwrap();

        assert_eq!(
            next_state(&mut h).await,
            (SessionState::Rejected, Some(ErrorCode::SessionAlreadyActive))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn given_unanswered_request_when_timeout_elapses_then_timed_out_and_peer_notified() {
        let mut h = start(Direction::Outbound).await;
        assert_eq!(next_state(&mut h).await.0, SessionState::Requesting);
        assert!(matches!(h.remote.inbound.recv().await, Some(Message::ConnectRequest(_))));

        assert_eq!(next_state(&mut h).await.0, SessionState::TimedOut);
        match h.remote.inbound.recv().await {
            Some(Message::ConnectCancel(c)) => assert_eq!(c.reason, ErrorCode::TimedOut),
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn connect_raw() -> Harness<RawPeer> {
        let mut h = start_raw(Direction::Inbound).await;
        assert_eq!(next_state(&mut h).await.0, SessionState::AwaitingConfirmation);
        call(&h, SessionCmd::Accept).await.unwrap();
        assert_eq!(next_state(&mut h).await.0, SessionState::Connected);
        h
    }

    #[tokio::test(start_paused = true)]
    async fn given_connected_session_when_peer_goes_silent_then_failed_network_unavailable() {
        let mut h = connect_raw().await;

        // The remote socket stays open but never answers pings.
        assert_eq!(
            next_state(&mut h).await,
            (
                SessionState::Failed(ErrorCode::NetworkUnavailable),
                Some(ErrorCode::NetworkUnavailable)
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn given_peer_sending_only_non_heartbeat_frames_when_limit_passes_then_failed() {
        let mut h = connect_raw().await;
        let chatter = Message::TransferCancel(TransferCancelPayload {
            transfer_id: 99,
            reason: ErrorCode::Canceled,
        });

        let mut failed = None;
        for _ in 0..40 {
            h.remote.send(&chatter).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Ok(report) = h.reports.try_recv()
                && let SessionEvent::StateChanged { state, .. } = report.event
            {
                failed = Some(state);
                break;
            }
        }
        assert_eq!(failed, Some(SessionState::Failed(ErrorCode::NetworkUnavailable)));
    }

    #[tokio::test(start_paused = true)]
    async fn given_peer_pinging_when_limit_passes_then_still_connected() {
        let mut h = connect_raw().await;
        let limit = {
            let config = EngineConfig::default();
            config.heartbeat_interval * config.missed_heartbeats
        };

        let until = Instant::now() + limit * 3;
        while Instant::now() < until {
            h.remote.send(&Message::Ping).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(h.reports.try_recv().is_err());
        call(&h, SessionCmd::ReleaseInput).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn given_peer_not_reading_during_file_send_when_heartbeat_due_then_session_fails() {
        let mut h = connect_raw().await;
        let path = h.dir.path().join("big.bin");
        tokio::fs::write(&path, vec![0x5Au8; 32 * 1024 * 1024]).await.unwrap();

        let task_id = call(&h, |reply| SessionCmd::Submit {
            paths: vec![path],
            reply,
        })
        .await
        .unwrap();
        h.remote
            .send(&Message::TransferDecision(TransferDecisionPayload {
                transfer_id: task_id.0,
                accept: true,
                reason: None,
            }))
            .await;

        // The peer never reads, so the socket fills up and file data backs
        // up behind it. Heartbeats must still be checked.
        let mut task_state = None;
        let session_state = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let report = h.reports.recv().await.expect("session reports closed");
                match report.event {
                    SessionEvent::TransferStateChanged { state, .. } => task_state = Some(state),
                    SessionEvent::StateChanged { state, .. } if state.is_terminal() => return state,
                    _ => {}
                }
            }
        })
        .await
        .expect("session stayed alive with a stalled peer");
        assert_eq!(session_state, SessionState::Failed(ErrorCode::NetworkUnavailable));

        while let Ok(report) = h.reports.try_recv() {
            if let SessionEvent::TransferStateChanged { state, .. } = report.event {
                task_state = Some(state);
            }
        }
        assert_eq!(task_state, Some(TransferState::Failed(ErrorCode::SessionClosed)));
    }

    #[tokio::test]
    async fn given_connected_session_when_peer_disconnects_then_closed() {
        let mut h = start(Direction::Inbound).await;
        next_state(&mut h).await;
        call(&h, SessionCmd::Accept).await.unwrap();
        next_state(&mut h).await;

        h.remote.outbound.send(&Message::Disconnect).unwrap();
        assert_eq!(
            next_state(&mut h).await,
            (SessionState::Closed, Some(ErrorCode::SessionClosed))
        );
    }

    #[tokio::test]
    async fn given_pending_session_when_submitting_then_not_connected() {
        let mut h = start(Direction::Inbound).await;
        next_state(&mut h).await;
        let err = call(&h, |reply| SessionCmd::Submit {
            paths: vec![PathBuf::from("/nonexistent")],
            reply,
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::SessionNotConnected));
    }

    #[tokio::test]
    async fn given_closed_session_when_commands_arrive_then_refused() {
        let mut h = start(Direction::Inbound).await;
        next_state(&mut h).await;
        call(&h, SessionCmd::Close).await.unwrap();
        assert_eq!(next_state(&mut h).await.0, SessionState::Closed);
        assert!(matches!(h.remote.inbound.recv().await, Some(Message::Disconnect)));

        // The actor is gone; the engine answers on its behalf.
        let (tx, rx) = oneshot::channel();
        SessionCmd::Accept(tx).refuse(SessionState::Closed);
        assert!(matches!(rx.await.unwrap(), Err(CoreError::InvalidTransition(_))));
    }
}
