//! LAN presence: periodic beacons, passive listening and peer aging.
//!
//! The service owns one background task while running. It emits
//! [`DiscoveryEvent`]s on an unbounded channel created once in
//! [`DiscoveryService::new`], so the stream survives `stop` / `start`
//! cycles.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use cooplink_core::device::{Device, DeviceEvent, DeviceId, Reachability};

const SERVICE: &str = "cooplink";
const BEACON_PROTO: u8 = 1;
const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub group: SocketAddrV4,
    pub beacon_interval: Duration,
    /// Beacons a peer may miss before it is marked Offline.
    pub missed_beacons: u32,
    /// Time since the last beacon after which an Offline peer is removed.
    pub removal_grace: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: SocketAddrV4::new(Ipv4Addr::new(239, 255, 0, 1), 30001),
            beacon_interval: Duration::from_secs(1),
            missed_beacons: 3,
            removal_grace: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl DiscoveryConfig {
    fn liveness_window(&self) -> Duration {
        self.beacon_interval * self.missed_beacons
    }
}

/// What this device announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub device_id: DeviceId,
    pub name: String,
    /// Session listener port; nothing is announced while it is 0.
    pub port: u16,
    /// `false` in hidden mode: listen only.
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Device(DeviceEvent),
    /// The beacon socket could not be bound or failed; retrying.
    NetworkUnavailable,
    NetworkRestored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Beacon {
    service: String,
    proto: u8,
    device_id: DeviceId,
    name: String,
    port: u16,
    #[serde(default)]
    probe: bool,
}

impl Beacon {
    fn from_identity(identity: &LocalIdentity, probe: bool) -> Self {
        Self {
            service: SERVICE.into(),
            proto: BEACON_PROTO,
            device_id: identity.device_id.clone(),
            name: identity.name.clone(),
            port: identity.port,
            probe,
        }
    }
}

// ── Beacon transport ────────────────────────────────────────────────

/// A bound datagram endpoint on the discovery group.
pub trait BeaconSocket: Send + Sync + 'static {
    /// Sends one datagram to the whole group.
    fn send<'a>(&'a self, datagram: &'a [u8]) -> impl Future<Output = anyhow::Result<()>> + Send + 'a;

    /// Receives one datagram and its source address.
    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<(usize, SocketAddr)>> + Send + 'a;
}

/// Creates [`BeaconSocket`]s; called again after every network failure.
pub trait BeaconBinder: Send + Sync + 'static {
    type Socket: BeaconSocket;

    fn bind(&self) -> impl Future<Output = anyhow::Result<Self::Socket>> + Send + '_;
}

/// IPv4 UDP multicast on the configured group.
pub struct MulticastBinder {
    group: SocketAddrV4,
}

impl MulticastBinder {
    #[must_use]
    pub fn new(group: SocketAddrV4) -> Self {
        Self { group }
    }
}

pub struct MulticastSocket {
    socket: UdpSocket,
    group: SocketAddrV4,
}

impl BeaconBinder for MulticastBinder {
    type Socket = MulticastSocket;

    fn bind(&self) -> impl Future<Output = anyhow::Result<Self::Socket>> + Send + '_ {
        async move {
            let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.group.port());
            let socket = UdpSocket::bind(local)
                .await
                .with_context(|| format!("failed to bind discovery socket on {local}"))?;
            socket
                .join_multicast_v4(*self.group.ip(), Ipv4Addr::UNSPECIFIED)
                .with_context(|| format!("failed to join multicast group {}", self.group.ip()))?;
            socket
                .set_multicast_loop_v4(true)
                .context("failed to enable multicast loopback")?;
            debug!(group = %self.group, "Discovery socket bound");
            Ok(MulticastSocket {
                socket,
                group: self.group,
            })
        }
    }
}

impl BeaconSocket for MulticastSocket {
    fn send<'a>(&'a self, datagram: &'a [u8]) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.socket
                .send_to(datagram, self.group)
                .await
                .context("failed to send beacon")?;
            Ok(())
        }
    }

    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<(usize, SocketAddr)>> + Send + 'a {
        async move {
            self.socket
                .recv_from(buf)
                .await
                .context("failed to receive beacon")
        }
    }
}

// ── Service ─────────────────────────────────────────────────────────

struct Running {
    stop_tx: watch::Sender<bool>,
    probe: Arc<Notify>,
    task: JoinHandle<PeerTable>,
}

type PeerTable = HashMap<DeviceId, Seen>;

pub struct DiscoveryService<B: BeaconBinder> {
    binder: Arc<B>,
    config: DiscoveryConfig,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    running: Option<Running>,
    /// Peers seen by an earlier run, kept for aging after a restart.
    table: PeerTable,
}

impl<B: BeaconBinder> DiscoveryService<B> {
    pub fn new(
        binder: B,
        config: DiscoveryConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let service = Self {
            binder: Arc::new(binder),
            config,
            events,
            running: None,
            table: HashMap::new(),
        };
        (service, rx)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Starts announcing and listening. Does nothing if already running.
    ///
    /// `identity` is re-read before every beacon, so name, port and
    /// visibility changes take effect without a restart.
    pub fn start(&mut self, identity: watch::Receiver<LocalIdentity>) {
        if self.running.is_some() {
            debug!("Discovery already running");
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let probe = Arc::new(Notify::new());
        let task = tokio::spawn(run(
            Arc::clone(&self.binder),
            self.config.clone(),
            identity,
            Arc::clone(&probe),
            stop_rx,
            std::mem::take(&mut self.table),
            self.events.clone(),
        ));

        info!(group = %self.config.group, "Discovery started");
        self.running = Some(Running {
            stop_tx,
            probe,
            task,
        });
    }

    /// Stops the service and waits until its socket is released.
    ///
    /// Peers it discovered read as `Offline` until beacons are heard again.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.stop_tx.send(true);
        match running.task.await {
            Ok(mut table) => {
                mark_offline(&mut table, &self.events);
                self.table = table;
            }
            Err(e) => warn!(error = %e, "Discovery task ended abnormally"),
        }
        info!("Discovery stopped");
    }

    /// Sends a probe so visible peers answer immediately.
    pub fn rescan(&self) {
        if let Some(running) = &self.running {
            running.probe.notify_one();
        }
    }
}

enum ServeEnd {
    Stopped,
    Failed(anyhow::Error),
}

struct Seen {
    device: Device,
    last_seen: Instant,
}

async fn run<B: BeaconBinder>(
    binder: Arc<B>,
    config: DiscoveryConfig,
    identity: watch::Receiver<LocalIdentity>,
    probe: Arc<Notify>,
    mut stop: watch::Receiver<bool>,
    mut table: PeerTable,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
) -> PeerTable {
    let mut backoff = config.initial_backoff;
    let mut degraded = false;

    loop {
        let bound = tokio::select! {
            _ = stop.changed() => break,
            bound = binder.bind() => bound,
        };

        let failure = match bound {
            Ok(socket) => {
                if degraded {
                    info!("Discovery network restored");
                    degraded = false;
                    let _ = events.send(DiscoveryEvent::NetworkRestored);
                }
                backoff = config.initial_backoff;
                match serve(&socket, &config, &identity, &probe, &mut stop, &mut table, &events).await {
                    ServeEnd::Stopped => break,
                    ServeEnd::Failed(e) => e,
                }
            }
            Err(e) => e,
        };

        warn!(error = %failure, retry_in = ?backoff, "Discovery network unavailable");
        if !degraded {
            degraded = true;
            let _ = events.send(DiscoveryEvent::NetworkUnavailable);
        }
        if !wait_out(backoff, &config, &mut stop, &mut table, &events).await {
            break;
        }
        backoff = (backoff * 2).min(config.max_backoff);
    }

    debug!("Discovery task stopped");
    table
}

/// Sleeps for `backoff` while known peers keep aging. Returns `false` once
/// the service is stopped.
async fn wait_out(
    backoff: Duration,
    config: &DiscoveryConfig,
    stop: &mut watch::Receiver<bool>,
    table: &mut PeerTable,
    events: &mpsc::UnboundedSender<DiscoveryEvent>,
) -> bool {
    let wake = tokio::time::sleep(backoff);
    tokio::pin!(wake);
    let mut aging_tick = aging_interval(config);
    loop {
        tokio::select! {
            _ = stop.changed() => return false,
            () = &mut wake => return true,
            _ = aging_tick.tick() => age(table, config, events),
        }
    }
}

fn aging_interval(config: &DiscoveryConfig) -> tokio::time::Interval {
    let mut tick = tokio::time::interval(config.beacon_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick
}

async fn serve<S: BeaconSocket>(
    socket: &S,
    config: &DiscoveryConfig,
    identity: &watch::Receiver<LocalIdentity>,
    probe: &Notify,
    stop: &mut watch::Receiver<bool>,
    table: &mut PeerTable,
    events: &mpsc::UnboundedSender<DiscoveryEvent>,
) -> ServeEnd {
    let mut beacon_tick = tokio::time::interval(config.beacon_interval);
    beacon_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut aging_tick = aging_interval(config);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => return ServeEnd::Stopped,

            () = probe.notified() => {
                let me = identity.borrow().clone();
                if me.visible {
                    debug!("Sending discovery probe");
                    if let Err(e) = announce(socket, &me, true).await {
                        return ServeEnd::Failed(e);
                    }
                } else {
                    debug!("Hidden mode, probe not sent");
                }
            }

            _ = beacon_tick.tick() => {
                let me = identity.borrow().clone();
                if me.visible && me.port != 0
                    && let Err(e) = announce(socket, &me, false).await
                {
                    return ServeEnd::Failed(e);
                }
            }

            _ = aging_tick.tick() => age(table, config, events),

            received = socket.recv(&mut buf) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => return ServeEnd::Failed(e),
                };
                let me = identity.borrow().clone();
                let Some(beacon) = parse_beacon(&buf[..len], &me.device_id) else {
                    continue;
                };
                if beacon.probe && me.visible && me.port != 0 {
                    debug!(from = %from, "Answering discovery probe");
                    if let Err(e) = announce(socket, &me, false).await {
                        return ServeEnd::Failed(e);
                    }
                }
                if beacon.port != 0 {
                    observe(table, &beacon, from, events);
                }
            }
        }
    }
}

async fn announce<S: BeaconSocket>(
    socket: &S,
    me: &LocalIdentity,
    probe: bool,
) -> anyhow::Result<()> {
    let datagram = serde_json::to_vec(&Beacon::from_identity(me, probe))?;
    socket.send(&datagram).await
}

/// Returns a beacon from another cooplink device speaking our version.
fn parse_beacon(datagram: &[u8], own_id: &DeviceId) -> Option<Beacon> {
    let beacon: Beacon = match serde_json::from_slice(datagram) {
        Ok(b) => b,
        Err(e) => {
            debug!(error = %e, "Ignoring malformed datagram");
            return None;
        }
    };
    if beacon.service != SERVICE || beacon.proto != BEACON_PROTO || &beacon.device_id == own_id {
        return None;
    }
    Some(beacon)
}

fn observe(
    table: &mut PeerTable,
    beacon: &Beacon,
    from: SocketAddr,
    events: &mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let address = SocketAddr::new(from.ip(), beacon.port);
    let device = Device::new(beacon.device_id.clone(), beacon.name.clone(), address);
    let now = Instant::now();

    match table.get_mut(&beacon.device_id) {
        None => {
            debug!(device_id = %device.id, name = %device.name, addr = %address, "Peer appeared");
            let _ = events.send(DiscoveryEvent::Device(DeviceEvent::Appeared(device.clone())));
            table.insert(beacon.device_id.clone(), Seen { device, last_seen: now });
        }
        Some(seen) => {
            seen.last_seen = now;
            if seen.device != device {
                debug!(device_id = %device.id, "Peer updated");
                seen.device = device.clone();
                let _ = events.send(DiscoveryEvent::Device(DeviceEvent::Updated(device)));
            }
        }
    }
}

fn mark_offline(table: &mut PeerTable, events: &mpsc::UnboundedSender<DiscoveryEvent>) {
    for seen in table.values_mut() {
        if seen.device.reachability != Reachability::Offline {
            seen.device.reachability = Reachability::Offline;
            let _ = events.send(DiscoveryEvent::Device(DeviceEvent::Updated(seen.device.clone())));
        }
    }
}

fn age(
    table: &mut PeerTable,
    config: &DiscoveryConfig,
    events: &mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let now = Instant::now();
    table.retain(|id, seen| {
        let silent = now.duration_since(seen.last_seen);
        if silent > config.removal_grace {
            debug!(device_id = %id, "Peer removed");
            let _ = events.send(DiscoveryEvent::Device(DeviceEvent::Disappeared(id.clone())));
            return false;
        }
        if silent > config.liveness_window() && seen.device.reachability != Reachability::Offline {
            debug!(device_id = %id, silent = ?silent, "Peer went offline");
            seen.device.reachability = Reachability::Offline;
            let _ = events.send(DiscoveryEvent::Device(DeviceEvent::Updated(seen.device.clone())));
        }
        true
    });
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-process beacon medium: every socket bound on a hub receives
    //! every datagram sent on it, including its own.

    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::bail;
    use tokio::sync::{Mutex, broadcast};

    use super::{BeaconBinder, BeaconSocket};

    #[derive(Clone)]
    pub struct MemoryHub {
        tx: broadcast::Sender<(Vec<u8>, SocketAddr)>,
        down: Arc<AtomicBool>,
    }

    impl MemoryHub {
        pub fn new() -> Self {
            let (tx, _) = broadcast::channel(256);
            Self {
                tx,
                down: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Simulates the network going away (binds and sends fail).
        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        pub fn binder(&self, addr: &str) -> MemoryBinder {
            MemoryBinder {
                hub: self.clone(),
                addr: addr.parse().unwrap(),
            }
        }

        /// Injects a raw datagram as if sent from `from`.
        pub fn inject(&self, datagram: Vec<u8>, from: &str) {
            let _ = self.tx.send((datagram, from.parse().unwrap()));
        }

        /// Subscribes to all datagrams on the hub.
        pub fn tap(&self) -> broadcast::Receiver<(Vec<u8>, SocketAddr)> {
            self.tx.subscribe()
        }
    }

    pub struct MemoryBinder {
        hub: MemoryHub,
        addr: SocketAddr,
    }

    pub struct MemorySocket {
        hub: MemoryHub,
        addr: SocketAddr,
        rx: Mutex<broadcast::Receiver<(Vec<u8>, SocketAddr)>>,
    }

    impl BeaconBinder for MemoryBinder {
        type Socket = MemorySocket;

        fn bind(&self) -> impl Future<Output = anyhow::Result<Self::Socket>> + Send + '_ {
            async move {
                if self.hub.down.load(Ordering::SeqCst) {
                    bail!("network down");
                }
                Ok(MemorySocket {
                    hub: self.hub.clone(),
                    addr: self.addr,
                    rx: Mutex::new(self.hub.tx.subscribe()),
                })
            }
        }
    }

    impl BeaconSocket for MemorySocket {
        fn send<'a>(&'a self, datagram: &'a [u8]) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
            async move {
                if self.hub.down.load(Ordering::SeqCst) {
                    bail!("network down");
                }
                let _ = self.hub.tx.send((datagram.to_vec(), self.addr));
                Ok(())
            }
        }

        fn recv<'a>(
            &'a self,
            buf: &'a mut [u8],
        ) -> impl Future<Output = anyhow::Result<(usize, SocketAddr)>> + Send + 'a {
            async move {
                let mut rx = self.rx.lock().await;
                loop {
                    match rx.recv().await {
                        Ok((data, from)) => {
                            let n = data.len().min(buf.len());
                            buf[..n].copy_from_slice(&data[..n]);
                            return Ok((n, from));
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => bail!("hub closed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryHub;
    use super::*;

    fn identity(id: &str, port: u16) -> LocalIdentity {
        LocalIdentity {
            device_id: DeviceId::from(id),
            name: format!("dev-{id}"),
            port,
            visible: true,
        }
    }

    fn beacon_bytes(id: &str, port: u16, probe: bool) -> Vec<u8> {
        serde_json::to_vec(&Beacon::from_identity(&identity(id, port), probe)).unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<DiscoveryEvent>) -> DiscoveryEvent {
        tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .expect("timed out waiting for discovery event")
            .expect("event channel closed")
    }

    #[test]
    fn given_own_or_foreign_beacon_when_parsed_then_ignored() {
        let me = DeviceId::from("me");
        assert!(parse_beacon(&beacon_bytes("me", 1, false), &me).is_none());
        assert!(parse_beacon(&beacon_bytes("peer", 1, false), &me).is_some());

        let mut foreign = Beacon::from_identity(&identity("peer", 1), false);
        foreign.service = "other".into();
        assert!(parse_beacon(&serde_json::to_vec(&foreign).unwrap(), &me).is_none());

        let mut future = Beacon::from_identity(&identity("peer", 1), false);
        future.proto = 2;
        assert!(parse_beacon(&serde_json::to_vec(&future).unwrap(), &me).is_none());

        assert!(parse_beacon(b"garbage", &me).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn given_two_visible_services_when_started_then_each_sees_the_other() {
        let hub = MemoryHub::new();
        let (mut a, mut a_rx) = DiscoveryService::new(hub.binder("10.0.0.1:30001"), DiscoveryConfig::default());
        let (mut b, mut b_rx) = DiscoveryService::new(hub.binder("10.0.0.2:30001"), DiscoveryConfig::default());
        let (_a_id, a_id_rx) = watch::channel(identity("a", 4000));
        let (_b_id, b_id_rx) = watch::channel(identity("b", 5000));

        a.start(a_id_rx);
        b.start(b_id_rx);

        match next_event(&mut a_rx).await {
            DiscoveryEvent::Device(DeviceEvent::Appeared(d)) => {
                assert_eq!(d.id, DeviceId::from("b"));
                assert_eq!(d.address, "10.0.0.2:5000".parse().unwrap());
                assert_eq!(d.reachability, Reachability::Connectable);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            next_event(&mut b_rx).await,
            DiscoveryEvent::Device(DeviceEvent::Appeared(d)) if d.id == DeviceId::from("a")
        ));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn given_silent_peer_when_liveness_window_passes_then_offline_then_back_on_beacon() {
        let hub = MemoryHub::new();
        let config = DiscoveryConfig::default();
        let (mut svc, mut rx) = DiscoveryService::new(hub.binder("10.0.0.1:30001"), config.clone());
        let (_id, id_rx) = watch::channel(identity("me", 4000));
        svc.start(id_rx);
        tokio::task::yield_now().await;

        hub.inject(beacon_bytes("x", 6000, false), "10.0.0.9:30001");
        assert!(matches!(next_event(&mut rx).await, DiscoveryEvent::Device(DeviceEvent::Appeared(_))));

        let went_offline_at = match next_event(&mut rx).await {
            DiscoveryEvent::Device(DeviceEvent::Updated(d)) => {
                assert_eq!(d.reachability, Reachability::Offline);
                Instant::now()
            }
            other => panic!("unexpected {other:?}"),
        };

        hub.inject(beacon_bytes("x", 6000, false), "10.0.0.9:30001");
        match next_event(&mut rx).await {
            DiscoveryEvent::Device(DeviceEvent::Updated(d)) => {
                assert_eq!(d.reachability, Reachability::Connectable);
                assert!(Instant::now().duration_since(went_offline_at) < config.beacon_interval);
            }
            other => panic!("unexpected {other:?}"),
        }

        svc.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn given_offline_peer_when_grace_expires_then_disappeared() {
        let hub = MemoryHub::new();
        let (mut svc, mut rx) = DiscoveryService::new(hub.binder("10.0.0.1:30001"), DiscoveryConfig::default());
        let (_id, id_rx) = watch::channel(identity("me", 4000));
        svc.start(id_rx);
        tokio::task::yield_now().await;

        hub.inject(beacon_bytes("x", 6000, false), "10.0.0.9:30001");
        let _appeared = next_event(&mut rx).await;
        let _offline = next_event(&mut rx).await;
        assert_eq!(
            next_event(&mut rx).await,
            DiscoveryEvent::Device(DeviceEvent::Disappeared(DeviceId::from("x")))
        );
        svc.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn given_hidden_mode_when_running_then_no_beacons_sent() {
        let hub = MemoryHub::new();
        let mut tap = hub.tap();
        let (mut svc, _rx) = DiscoveryService::new(hub.binder("10.0.0.1:30001"), DiscoveryConfig::default());
        let mut me = identity("me", 4000);
        me.visible = false;
        let (_id, id_rx) = watch::channel(me);
        svc.start(id_rx);

        tokio::time::sleep(Duration::from_secs(5)).await;
        hub.inject(beacon_bytes("x", 6000, true), "10.0.0.9:30001");
        tokio::time::sleep(Duration::from_secs(1)).await;
        svc.rescan();
        tokio::time::sleep(Duration::from_secs(1)).await;

        while let Ok((data, _)) = tap.try_recv() {
            let beacon: Beacon = serde_json::from_slice(&data).unwrap();
            assert_ne!(beacon.device_id, DeviceId::from("me"), "hidden device announced itself");
        }
        svc.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn given_probe_when_received_then_answered_before_next_interval() {
        let hub = MemoryHub::new();
        let mut config = DiscoveryConfig::default();
        config.beacon_interval = Duration::from_secs(60);
        let (mut svc, _rx) = DiscoveryService::new(hub.binder("10.0.0.1:30001"), config);
        let (_id, id_rx) = watch::channel(identity("me", 4000));
        svc.start(id_rx);
        // First interval tick fires immediately; let it pass.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let mut tap = hub.tap();

        hub.inject(beacon_bytes("x", 6000, true), "10.0.0.9:30001");
        let answered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (data, _) = tap.recv().await.unwrap();
                let beacon: Beacon = serde_json::from_slice(&data).unwrap();
                if beacon.device_id == DeviceId::from("me") {
                    return beacon;
                }
            }
        })
        .await
        .expect("probe not answered");
        assert!(!answered.probe);
        svc.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn given_network_down_when_started_then_unavailable_then_restored() {
        let hub = MemoryHub::new();
        hub.set_down(true);
        let (mut svc, mut rx) = DiscoveryService::new(hub.binder("10.0.0.1:30001"), DiscoveryConfig::default());
        let (_id, id_rx) = watch::channel(identity("me", 4000));
        svc.start(id_rx);

        assert_eq!(next_event(&mut rx).await, DiscoveryEvent::NetworkUnavailable);
        hub.set_down(false);
        assert_eq!(next_event(&mut rx).await, DiscoveryEvent::NetworkRestored);
        svc.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn given_known_peer_when_network_goes_down_then_still_ages_out() {
        let hub = MemoryHub::new();
        let (mut svc, mut rx) = DiscoveryService::new(hub.binder("10.0.0.1:30001"), DiscoveryConfig::default());
        let (_id, id_rx) = watch::channel(identity("me", 4000));
        svc.start(id_rx);
        tokio::task::yield_now().await;

        hub.inject(beacon_bytes("x", 6000, false), "10.0.0.9:30001");
        assert!(matches!(next_event(&mut rx).await, DiscoveryEvent::Device(DeviceEvent::Appeared(_))));
        hub.set_down(true);

        let mut seen = Vec::new();
        let disappeared = DiscoveryEvent::Device(DeviceEvent::Disappeared(DeviceId::from("x")));
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                let event = next_event(&mut rx).await;
                let done = event == disappeared;
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("peer never aged out while the network was down");

        assert!(seen.contains(&DiscoveryEvent::NetworkUnavailable));
        assert!(seen.iter().any(|e| matches!(
            e,
            DiscoveryEvent::Device(DeviceEvent::Updated(d)) if d.reachability == Reachability::Offline
        )));
        svc.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn given_known_peer_when_stopped_then_offline_and_removed_after_restart() {
        let hub = MemoryHub::new();
        let (mut svc, mut rx) = DiscoveryService::new(hub.binder("10.0.0.1:30001"), DiscoveryConfig::default());
        let (_id, id_rx) = watch::channel(identity("me", 4000));
        svc.start(id_rx.clone());
        tokio::task::yield_now().await;

        hub.inject(beacon_bytes("x", 6000, false), "10.0.0.9:30001");
        assert!(matches!(next_event(&mut rx).await, DiscoveryEvent::Device(DeviceEvent::Appeared(_))));

        svc.stop().await;
        match next_event(&mut rx).await {
            DiscoveryEvent::Device(DeviceEvent::Updated(d)) => assert_eq!(d.reachability, Reachability::Offline),
            other => panic!("unexpected {other:?}"),
        }

        tokio::time::sleep(Duration::from_secs(120)).await;
        svc.start(id_rx);
        assert_eq!(
            next_event(&mut rx).await,
            DiscoveryEvent::Device(DeviceEvent::Disappeared(DeviceId::from("x")))
        );
        svc.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn given_stopped_service_when_restarted_then_events_continue_on_same_stream() {
        let hub = MemoryHub::new();
        let (mut svc, mut rx) = DiscoveryService::new(hub.binder("10.0.0.1:30001"), DiscoveryConfig::default());
        let (_id, id_rx) = watch::channel(identity("me", 4000));

        svc.start(id_rx.clone());
        svc.start(id_rx.clone());
        assert!(svc.is_running());
        svc.stop().await;
        assert!(!svc.is_running());

        svc.start(id_rx);
        tokio::task::yield_now().await;
        hub.inject(beacon_bytes("x", 6000, false), "10.0.0.9:30001");
        assert!(matches!(next_event(&mut rx).await, DiscoveryEvent::Device(DeviceEvent::Appeared(_))));
        svc.stop().await;
    }
}
