use std::collections::HashMap;
use std::future::pending;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashSet;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cooplink_core::device::{Device, DeviceEvent, DeviceId, Reachability, validate_device_name};
use cooplink_core::error::{CoreError, ErrorCode};
use cooplink_core::fs::{DiskSpace, StorageProbe};
use cooplink_core::protocol::{ConnectReplyPayload, ConnectRequestPayload, InputEvent, Message};
use cooplink_core::settings::{DiscoveryMode, ScreenEdge, Settings, SharePolicy};
use cooplink_core::state::{Direction, SessionId, SessionState, TaskId};
use cooplink_core::transport::{Connection, Connector, Listener, ListenerFactory};

use crate::discovery::{BeaconBinder, DiscoveryConfig, DiscoveryEvent, DiscoveryService, LocalIdentity};
use crate::history::{TransferHistory, TransferRecord};
use crate::link::{Link, read_first_message, spawn_link};
use crate::registry::DeviceRegistry;
use crate::session::{
    LinkSource, Reply, SessionCmd, SessionDeps, SessionEvent, SessionReport, SessionSetup,
    spawn_session,
};
use crate::share::{NullPeripherals, Peripherals};
use crate::transfer::TransferContext;

const COMMAND_QUEUE: usize = 32;
const EVENT_CAPACITY: usize = 128;

// ── Engine events (engine → UI) ─────────────────────────────────────

/// Events emitted by the engine for the CLI / UI to observe.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// The listener is bound and accepting connections on `addr`.
    Accepting { addr: SocketAddr },
    /// The listener has been stopped.
    AcceptingStopped,
    /// A registry change or a discovery network condition.
    Discovery(DiscoveryEvent),
    /// A new session was created (inbound or outbound).
    SessionCreated {
        session_id: SessionId,
        peer: DeviceId,
        direction: Direction,
    },
    /// A session-level event, tagged with the session ID so the UI can
    /// route it to the right view / dialog.
    Session {
        session_id: SessionId,
        event: SessionEvent,
    },
    /// A non-fatal error occurred inside the engine.
    Error { message: String },
}

/// A session as listed by [`EngineHandle::sessions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: DeviceId,
    pub peer_name: String,
    pub direction: Direction,
    pub state: SessionState,
}

// ── Configuration ───────────────────────────────────────────────────

/// Protocol timing shared by all sessions created by the engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How long a connect request or transfer offer waits for an answer.
    pub response_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Heartbeat intervals without a ping or pong before the session fails.
    pub missed_heartbeats: u32,
    pub progress_interval: Duration,
    pub chunk_size: usize,
    /// Limit for reading the first frame of an accepted connection.
    pub handshake_timeout: Duration,
    pub discovery: DiscoveryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(2),
            missed_heartbeats: 3,
            progress_interval: Duration::from_millis(500),
            chunk_size: 64 * 1024,
            handshake_timeout: Duration::from_secs(10),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Capabilities supplied by the host platform.
#[derive(Clone)]
pub struct Platform {
    pub peripherals: Arc<dyn Peripherals>,
    pub storage: Arc<dyn StorageProbe>,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            peripherals: Arc::new(NullPeripherals),
            storage: Arc::new(DiskSpace),
        }
    }
}

// ── Engine commands (handle → engine) ───────────────────────────────

enum EngineCmd {
    StartAccepting {
        addr: String,
        reply: Reply<SocketAddr>,
    },
    StopAccepting(Reply<()>),
    StartDiscovery(Reply<()>),
    StopDiscovery(Reply<()>),
    Rescan,
    RequestSession {
        peer: DeviceId,
        reply: Reply<SessionId>,
    },
    Session {
        session_id: SessionId,
        cmd: SessionCmd,
    },
    Sessions(Reply<Vec<SessionInfo>>),
    UpdateSharePolicy(SharePolicy),
    SetDiscoveryMode(DiscoveryMode),
    Rename(String),
    Shutdown(Reply<()>),
}

// ── Engine handle ───────────────────────────────────────────────────

/// Handle returned by [`Engine::start`]. Cloneable; every clone talks to
/// the same engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCmd>,
    events_tx: broadcast::Sender<EngineEvent>,
    registry: Arc<DeviceRegistry>,
    history: Arc<TransferHistory>,
    local_id: DeviceId,
}

impl EngineHandle {
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    #[must_use]
    pub fn local_id(&self) -> &DeviceId {
        &self.local_id
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> EngineCmd) -> Result<T, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| CoreError::EngineStopped)?;
        rx.await.map_err(|_| CoreError::EngineStopped)?
    }

    async fn session_call<T>(
        &self,
        session_id: SessionId,
        make: impl FnOnce(Reply<T>) -> SessionCmd,
    ) -> Result<T, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCmd::Session {
                session_id,
                cmd: make(tx),
            })
            .await
            .map_err(|_| CoreError::EngineStopped)?;
        rx.await.map_err(|_| CoreError::EngineStopped)?
    }

    async fn notify(&self, cmd: EngineCmd) -> Result<(), CoreError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| CoreError::EngineStopped)
    }

    /// Binds the session listener and returns its bound address.
    pub async fn start_accepting(&self, addr: impl Into<String>) -> Result<SocketAddr, CoreError> {
        let addr = addr.into();
        self.call(|reply| EngineCmd::StartAccepting { addr, reply })
            .await
    }

    pub async fn stop_accepting(&self) -> Result<(), CoreError> {
        self.call(EngineCmd::StopAccepting).await
    }

    /// Starts announcing and listening for peers. Idempotent.
    pub async fn start_discovery(&self) -> Result<(), CoreError> {
        self.call(EngineCmd::StartDiscovery).await
    }

    pub async fn stop_discovery(&self) -> Result<(), CoreError> {
        self.call(EngineCmd::StopDiscovery).await
    }

    /// Asks visible peers to announce themselves now.
    pub async fn rescan(&self) -> Result<(), CoreError> {
        self.notify(EngineCmd::Rescan).await
    }

    /// Adds a peer known by address rather than by beacon.
    pub fn register_peer(&self, device: Device) {
        if let Some(change) = self.registry.register(device) {
            let _ = self
                .events_tx
                .send(EngineEvent::Discovery(DiscoveryEvent::Device(change)));
        }
    }

    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        self.registry.snapshot()
    }

    #[must_use]
    pub fn search(&self, query: &str) -> Vec<Device> {
        self.registry.search(query)
    }

    /// Finished transfers, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<TransferRecord> {
        self.history.snapshot()
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, CoreError> {
        self.call(EngineCmd::Sessions).await
    }

    /// Asks `peer` to pair. Fails with `SessionAlreadyActive` if a session
    /// with the peer is still live, `PeerUnreachable` if the peer is not
    /// connectable.
    pub async fn request_session(&self, peer: DeviceId) -> Result<SessionId, CoreError> {
        self.call(|reply| EngineCmd::RequestSession { peer, reply })
            .await
    }

    pub async fn accept_session(&self, id: SessionId) -> Result<(), CoreError> {
        self.session_call(id, SessionCmd::Accept).await
    }

    pub async fn reject_session(&self, id: SessionId) -> Result<(), CoreError> {
        self.session_call(id, SessionCmd::Reject).await
    }

    /// Withdraws an outbound request that is still `Requesting`.
    pub async fn cancel_session(&self, id: SessionId) -> Result<(), CoreError> {
        self.session_call(id, SessionCmd::Cancel).await
    }

    pub async fn close_session(&self, id: SessionId) -> Result<(), CoreError> {
        self.session_call(id, SessionCmd::Close).await
    }

    /// Queues `paths` for sending over a connected session.
    pub async fn submit_transfer(&self, id: SessionId, paths: Vec<PathBuf>) -> Result<TaskId, CoreError> {
        self.session_call(id, |reply| SessionCmd::Submit { paths, reply })
            .await
    }

    /// Answers a pending incoming offer.
    pub async fn respond_to_offer(&self, id: SessionId, task_id: TaskId, accept: bool) -> Result<(), CoreError> {
        self.session_call(id, |reply| SessionCmd::RespondToOffer {
            task_id,
            accept,
            reply,
        })
        .await
    }

    pub async fn cancel_transfer(&self, id: SessionId, task_id: TaskId) -> Result<(), CoreError> {
        self.session_call(id, |reply| SessionCmd::CancelTransfer { task_id, reply })
            .await
    }

    /// Forwards a local input event; `Ok(false)` when input is not
    /// currently handed over to the peer.
    pub async fn forward_input(&self, id: SessionId, event: InputEvent) -> Result<bool, CoreError> {
        self.session_call(id, |reply| SessionCmd::ForwardInput { event, reply })
            .await
    }

    /// Reports the pointer reaching `edge`; returns whether input is now
    /// handed over to the peer.
    pub async fn edge_reached(&self, id: SessionId, edge: ScreenEdge) -> Result<bool, CoreError> {
        self.session_call(id, |reply| SessionCmd::EdgeReached { edge, reply })
            .await
    }

    pub async fn release_input(&self, id: SessionId) -> Result<(), CoreError> {
        self.session_call(id, SessionCmd::ReleaseInput).await
    }

    /// Reports a local clipboard change; returns whether it was sent.
    pub async fn clipboard_changed(&self, id: SessionId) -> Result<bool, CoreError> {
        self.session_call(id, SessionCmd::ClipboardChanged).await
    }

    pub async fn update_share_policy(&self, policy: SharePolicy) -> Result<(), CoreError> {
        self.notify(EngineCmd::UpdateSharePolicy(policy)).await
    }

    /// Switches between announcing (`Everyone`) and listen-only (`Hidden`).
    pub async fn set_discovery_mode(&self, mode: DiscoveryMode) -> Result<(), CoreError> {
        self.notify(EngineCmd::SetDiscoveryMode(mode)).await
    }

    /// Changes the advertised device name.
    pub async fn rename(&self, name: &str) -> Result<(), CoreError> {
        let name = validate_device_name(name)?;
        self.notify(EngineCmd::Rename(name)).await
    }

    /// Closes every live session, stops discovery and the listener.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.call(EngineCmd::Shutdown).await
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// The cooplink engine.
///
/// Accepts inbound connections, dials peers, runs discovery and one actor
/// per session. The engine is generic over:
/// - `F: ListenerFactory` — creates the session listener
/// - `K: Connector`       — opens outbound connections
/// - `B: BeaconBinder`    — binds the discovery socket
///
/// so the caller can plug in TCP, QUIC, or in-memory transports without
/// changing the engine code.
pub struct Engine {
    settings: Settings,
    config: EngineConfig,
    platform: Platform,
}

impl Engine {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            config: EngineConfig::default(),
            platform: Platform::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Validates the settings, spawns the engine event loop and returns a
    /// handle to control it.
    ///
    /// The engine starts idle: no listener, no discovery, no sessions.
    /// Must be called from within a Tokio runtime.
    pub fn start<F, K, B>(self, factory: F, connector: K, binder: B) -> Result<EngineHandle, CoreError>
    where
        F: ListenerFactory,
        K: Connector,
        B: BeaconBinder,
    {
        let mut settings = self.settings;
        settings.validate()?;
        let local_id = settings.device_id_or_generate();

        let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCmd>(COMMAND_QUEUE);
        let (events_tx, _) = broadcast::channel::<EngineEvent>(EVENT_CAPACITY);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (handshakes_tx, handshakes_rx) = mpsc::unbounded_channel();
        let (discovery, discovery_rx) = DiscoveryService::new(binder, self.config.discovery.clone());
        let (identity_tx, _) = watch::channel(LocalIdentity {
            device_id: local_id.clone(),
            name: settings.device_name.clone(),
            port: 0,
            visible: settings.discovery_mode == DiscoveryMode::Everyone,
        });
        let registry = Arc::new(DeviceRegistry::new());
        let history = Arc::new(TransferHistory::default());

        let transfers = TransferContext {
            storage: Arc::clone(&self.platform.storage),
            leases: Arc::new(DashSet::new()),
            history: Arc::clone(&history),
            task_ids: Arc::new(AtomicU64::new(1)),
            chunk_size: self.config.chunk_size,
            response_timeout: self.config.response_timeout,
        };
        let (settings_tx, _) = watch::channel(settings);

        info!(device_id = %local_id, "Spawning engine event loop");

        let engine_loop = EngineLoop {
            factory,
            connector: Arc::new(connector),
            config: self.config,
            peripherals: self.platform.peripherals,
            transfers,
            local_id: local_id.clone(),
            settings: settings_tx,
            identity: identity_tx,
            registry: Arc::clone(&registry),
            discovery,
            listener: None,
            sessions: HashMap::new(),
            by_peer: HashMap::new(),
            next_session_id: 1,
            events: events_tx.clone(),
            reports_tx,
            handshakes_tx,
        };
        tokio::spawn(engine_loop.run(cmd_rx, reports_rx, handshakes_rx, discovery_rx));

        Ok(EngineHandle {
            cmd_tx,
            events_tx,
            registry,
            history,
            local_id,
        })
    }
}

/// Internal bookkeeping for a spawned session.
struct SessionEntry {
    peer: DeviceId,
    peer_name: String,
    direction: Direction,
    state: SessionState,
    /// `None` once the session has ended.
    cmd_tx: Option<mpsc::Sender<SessionCmd>>,
}

/// A connect request read from an accepted connection.
struct Handshake {
    hello: ConnectRequestPayload,
    link: Link,
}

struct EngineLoop<F: ListenerFactory, K: Connector, B: BeaconBinder> {
    factory: F,
    connector: Arc<K>,
    config: EngineConfig,
    peripherals: Arc<dyn Peripherals>,
    transfers: TransferContext,
    local_id: DeviceId,
    settings: watch::Sender<Settings>,
    identity: watch::Sender<LocalIdentity>,
    registry: Arc<DeviceRegistry>,
    discovery: DiscoveryService<B>,
    listener: Option<F::L>,

    sessions: HashMap<SessionId, SessionEntry>,
    /// Live (non-terminal) session per peer.
    by_peer: HashMap<DeviceId, SessionId>,
    next_session_id: u64,

    events: broadcast::Sender<EngineEvent>,
    reports_tx: mpsc::UnboundedSender<SessionReport>,
    handshakes_tx: mpsc::UnboundedSender<Handshake>,
}

impl<F, K, B> EngineLoop<F, K, B>
where
    F: ListenerFactory,
    K: Connector,
    B: BeaconBinder,
{
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCmd>,
        mut reports_rx: mpsc::UnboundedReceiver<SessionReport>,
        mut handshakes_rx: mpsc::UnboundedReceiver<Handshake>,
        mut discovery_rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
    ) {
        debug!("Engine event loop running");

        loop {
            tokio::select! {
                biased;

                // ── Commands ────────────────────────────────────────
                cmd = cmd_rx.recv() => match cmd {
                    Some(EngineCmd::Shutdown(reply)) => {
                        info!("Received Shutdown command");
                        self.shutdown(&mut reports_rx).await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        debug!("Command channel closed, shutting down");
                        self.shutdown(&mut reports_rx).await;
                        break;
                    }
                },

                // ── Session reports ─────────────────────────────────
                Some(report) = reports_rx.recv() => self.on_report(report),

                // ── Inbound connect requests ────────────────────────
                Some(handshake) = handshakes_rx.recv() => self.on_handshake(handshake).await,

                // ── Discovery ───────────────────────────────────────
                Some(event) = discovery_rx.recv() => self.on_discovery(event),

                // ── Accept inbound connections ──────────────────────
                result = async {
                    match self.listener.as_mut() {
                        Some(l) => l.accept().await,
                        None => pending().await,
                    }
                }, if self.listener.is_some() => match result {
                    Ok(conn) => {
                        let peer = conn.peer();
                        info!(peer = %peer, "Connection accepted");
                        tokio::spawn(read_connect_request(
                            conn,
                            self.config.handshake_timeout,
                            self.handshakes_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        self.publish(EngineEvent::Error {
                            message: format!("{e:#}"),
                        });
                    }
                },
            }
        }

        info!("Engine event loop stopped");
    }

    fn publish(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn publish_device(&self, change: Option<DeviceEvent>) {
        if let Some(change) = change {
            self.publish(EngineEvent::Discovery(DiscoveryEvent::Device(change)));
        }
    }

    async fn on_command(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::StartAccepting { addr, reply } => {
                let _ = reply.send(self.start_accepting(&addr).await);
            }
            EngineCmd::StopAccepting(reply) => {
                info!("Received StopAccepting command");
                self.listener = None;
                self.identity.send_modify(|identity| identity.port = 0);
                self.publish(EngineEvent::AcceptingStopped);
                let _ = reply.send(Ok(()));
            }
            EngineCmd::StartDiscovery(reply) => {
                self.discovery.start(self.identity.subscribe());
                let _ = reply.send(Ok(()));
            }
            EngineCmd::StopDiscovery(reply) => {
                self.discovery.stop().await;
                let _ = reply.send(Ok(()));
            }
            EngineCmd::Rescan => self.discovery.rescan(),
            EngineCmd::RequestSession { peer, reply } => {
                let _ = reply.send(self.request_session(peer));
            }
            EngineCmd::Session { session_id, cmd } => self.forward(session_id, cmd).await,
            EngineCmd::Sessions(reply) => {
                let mut list: Vec<SessionInfo> = self
                    .sessions
                    .iter()
                    .map(|(id, entry)| SessionInfo {
                        id: *id,
                        peer: entry.peer.clone(),
                        peer_name: entry.peer_name.clone(),
                        direction: entry.direction,
                        state: entry.state,
                    })
                    .collect();
                list.sort_by_key(|info| info.id.0);
                let _ = reply.send(Ok(list));
            }
            EngineCmd::UpdateSharePolicy(policy) => {
                debug!(?policy, "Share policy updated");
                self.settings.send_modify(|s| {
                    s.input_sharing = policy.input_sharing;
                    s.clipboard_sharing = policy.clipboard_sharing;
                    s.screen_edge = policy.screen_edge;
                    s.sender_allow_list = policy.sender_allow_list;
                });
            }
            EngineCmd::SetDiscoveryMode(mode) => {
                info!(?mode, "Discovery mode changed");
                self.settings.send_modify(|s| s.discovery_mode = mode);
                self.identity
                    .send_modify(|identity| identity.visible = mode == DiscoveryMode::Everyone);
            }
            EngineCmd::Rename(name) => {
                info!(name = %name, "Device renamed");
                self.settings.send_modify(|s| s.device_name.clone_from(&name));
                self.identity.send_modify(|identity| identity.name = name);
            }
            EngineCmd::Shutdown(_) => {}
        }
    }

    async fn start_accepting(&mut self, addr: &str) -> Result<SocketAddr, CoreError> {
        info!(addr = %addr, "Received StartAccepting command");
        match self.factory.bind(addr).await {
            Ok(listener) => {
                let bound = listener.local_addr();
                self.listener = Some(listener);
                self.identity.send_modify(|identity| identity.port = bound.port());
                self.publish(EngineEvent::Accepting { addr: bound });
                Ok(bound)
            }
            Err(e) => {
                warn!(error = %e, "Failed to bind listener");
                self.publish(EngineEvent::Error {
                    message: format!("{e:#}"),
                });
                Err(CoreError::Io(format!("{e:#}")))
            }
        }
    }

    fn hello(&self) -> ConnectRequestPayload {
        ConnectRequestPayload {
            device_id: self.local_id.clone(),
            device_name: self.settings.borrow().device_name.clone(),
            listen_port: self.identity.borrow().port,
        }
    }

    fn request_session(&mut self, peer: DeviceId) -> Result<SessionId, CoreError> {
        if self.by_peer.contains_key(&peer) {
            debug!(peer = %peer, "Session with peer already active");
            return Err(ErrorCode::SessionAlreadyActive.into());
        }
        let device = self
            .registry
            .get(&peer)
            .filter(|d| d.reachability == Reachability::Connectable)
            .ok_or(CoreError::Code(ErrorCode::PeerUnreachable))?;

        let (link_tx, link_rx) = oneshot::channel();
        let connector = Arc::clone(&self.connector);
        let addr = device.address;
        tokio::spawn(async move {
            let _ = link_tx.send(dial(connector.as_ref(), addr).await);
        });

        let session_id = self.create_session(device.id, device.name, Direction::Outbound, LinkSource::Connecting(link_rx));
        info!(session_id = %session_id, peer = %peer, addr = %addr, "Requesting session");
        Ok(session_id)
    }

    fn create_session(
        &mut self,
        peer: DeviceId,
        peer_name: String,
        direction: Direction,
        source: LinkSource,
    ) -> SessionId {
        let session_id = SessionId(self.next_session_id);
        self.next_session_id += 1;

        let setup = SessionSetup {
            id: session_id,
            peer: peer.clone(),
            peer_name: peer_name.clone(),
            direction,
            hello: self.hello(),
            config: self.config.clone(),
        };
        let deps = SessionDeps {
            settings: self.settings.subscribe(),
            peripherals: Arc::clone(&self.peripherals),
            transfers: self.transfers.clone(),
            reports: self.reports_tx.clone(),
        };
        let (cmd_tx, handle) = spawn_session(setup, deps, source);
        tokio::spawn(watch_session(session_id, handle, self.reports_tx.clone()));

        let state = match direction {
            Direction::Outbound => SessionState::Requesting,
            Direction::Inbound => SessionState::AwaitingConfirmation,
        };
        self.sessions.insert(
            session_id,
            SessionEntry {
                peer: peer.clone(),
                peer_name,
                direction,
                state,
                cmd_tx: Some(cmd_tx),
            },
        );
        self.by_peer.insert(peer.clone(), session_id);
        self.publish(EngineEvent::SessionCreated {
            session_id,
            peer,
            direction,
        });
        session_id
    }

    async fn forward(&mut self, session_id: SessionId, cmd: SessionCmd) {
        let Some(entry) = self.sessions.get(&session_id) else {
            warn!(session_id = %session_id, "Session not found");
            cmd.fail(CoreError::UnknownSession(session_id));
            return;
        };
        let state = entry.state;
        let Some(tx) = entry.cmd_tx.clone() else {
            cmd.refuse(state);
            return;
        };
        if let Err(mpsc::error::SendError(cmd)) = tx.send(cmd).await {
            debug!(session_id = %session_id, "Session already stopped");
            cmd.refuse(state);
        }
    }

    async fn on_handshake(&mut self, handshake: Handshake) {
        let Handshake { hello, link } = handshake;
        if hello.device_id == self.local_id {
            debug!(peer = %link.peer, "Ignoring connection from ourselves");
            return;
        }

        if self.registry.get(&hello.device_id).is_none() {
            let address = SocketAddr::new(link.peer.ip(), hello.listen_port);
            let change = self
                .registry
                .register(Device::new(hello.device_id.clone(), hello.device_name.clone(), address));
            self.publish_device(change);
        }

        if let Some(active) = self.by_peer.get(&hello.device_id) {
            info!(peer = %hello.device_id, active = %active, "Peer already has a session, rejecting");
            let busy = Message::ConnectReply(ConnectReplyPayload {
                accept: false,
                device_name: self.settings.borrow().device_name.clone(),
                reason: Some(ErrorCode::SessionAlreadyActive),
            });
            if let Err(e) = link.outbound.send(&busy) {
                debug!(error = %e, "Could not send busy reply");
            }
            return;
        }

        let session_id = self.create_session(
            hello.device_id.clone(),
            hello.device_name,
            Direction::Inbound,
            LinkSource::Accepted(link),
        );
        info!(session_id = %session_id, peer = %hello.device_id, "Incoming session request");
    }

    fn on_report(&mut self, report: SessionReport) {
        if let SessionEvent::StateChanged { state, .. } = &report.event {
            let finished = self
                .sessions
                .get(&report.session_id)
                .is_some_and(|entry| entry.state.is_terminal());
            if finished {
                return;
            }
            self.on_session_state(report.session_id, *state);
        }
        self.publish(EngineEvent::Session {
            session_id: report.session_id,
            event: report.event,
        });
    }

    fn on_session_state(&mut self, session_id: SessionId, state: SessionState) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };
        entry.state = state;
        if state.is_terminal() {
            entry.cmd_tx = None;
        }
        let peer = entry.peer.clone();

        if state == SessionState::Connected {
            let change = self.registry.mark_connected(&peer);
            self.publish_device(change);
        } else if state.is_terminal() {
            if self.by_peer.get(&peer) == Some(&session_id) {
                self.by_peer.remove(&peer);
            }
            let change = self.registry.mark_disconnected(&peer);
            self.publish_device(change);
        }
    }

    fn on_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Device(change) => {
                let visible = self.registry.apply(&change);
                self.publish_device(visible);
            }
            other => {
                info!(event = ?other, "Discovery network condition");
                self.publish(EngineEvent::Discovery(other));
            }
        }
    }

    async fn shutdown(&mut self, reports_rx: &mut mpsc::UnboundedReceiver<SessionReport>) {
        let mut pending_closes = Vec::new();
        for (id, entry) in &self.sessions {
            if let Some(tx) = &entry.cmd_tx {
                debug!(session_id = %id, "Closing session");
                let (reply, rx) = oneshot::channel();
                if tx.send(SessionCmd::Close(reply)).await.is_ok() {
                    pending_closes.push(rx);
                }
            }
        }
        let closing = async {
            for rx in pending_closes {
                let _ = rx.await;
            }
        };
        if tokio::time::timeout(self.config.handshake_timeout, closing).await.is_err() {
            warn!("Sessions did not close in time");
        }
        while let Ok(report) = reports_rx.try_recv() {
            self.on_report(report);
        }

        self.discovery.stop().await;
        self.listener = None;
    }
}

/// Reports a session whose task died before reaching a terminal state as
/// failed, so its peer is released.
async fn watch_session(
    session_id: SessionId,
    handle: JoinHandle<()>,
    reports: mpsc::UnboundedSender<SessionReport>,
) {
    if let Err(e) = handle.await {
        error!(session_id = %session_id, error = %e, "Session task ended abnormally");
        let _ = reports.send(SessionReport {
            session_id,
            event: SessionEvent::StateChanged {
                state: SessionState::Failed(ErrorCode::SessionClosed),
                reason: Some(ErrorCode::SessionClosed),
            },
        });
    }
}

/// Opens a connection and starts its frame tasks.
async fn dial<K: Connector>(connector: &K, addr: SocketAddr) -> anyhow::Result<Link> {
    let conn = connector.connect(addr).await?;
    let peer = conn.peer();
    let (reader, writer) = conn.into_split().await?;
    Ok(spawn_link(reader, writer, BytesMut::new(), peer))
}

/// Reads the first frame of an accepted connection and hands a connect
/// request to the engine loop. Anything else drops the connection.
async fn read_connect_request<C: Connection>(
    conn: C,
    limit: Duration,
    handshakes: mpsc::UnboundedSender<Handshake>,
) {
    let peer = conn.peer();
    let first = async {
        let (mut reader, writer) = conn.into_split().await?;
        let (msg, pending) = read_first_message(&mut reader, limit).await?;
        anyhow::Ok((msg, spawn_link(reader, writer, pending, peer)))
    }
    .await;

    match first {
        Ok((Message::ConnectRequest(hello), link)) => {
            let _ = handshakes.send(Handshake { hello, link });
        }
        Ok((other, _)) => {
            warn!(peer = %peer, msg_type = ?other.msg_type(), "Expected a connect request, dropping connection");
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "Handshake failed");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
