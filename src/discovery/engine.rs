// UDP discovery engine.
//
// One socket, two tasks: a receive task that validates and resolves replies,
// and a send task that emits probe cycles. Probes go to the IPv4 limited
// broadcast address plus every configured static address; each cycle repeats
// the probe three times with a short gap to tolerate datagram loss.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::protocol::{self, ProtocolError, DEFAULT_DISCOVERY_PORT};
use super::registry::{DeviceRegistry, IgnoreLists};
use super::ControlClient;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device {0:08X} has not been discovered")]
    UnknownDevice(u32),

    #[error("capture device {0} has not been discovered")]
    UnknownTuner(i32),

    #[error("capture device {0} is already in use")]
    TunerBusy(i32),

    #[error("discovery is disabled")]
    Disabled,

    #[error("control query failed: {0}")]
    Control(String),
}

/// Packets per probe cycle and the gap between them.
const PROBE_REPEATS: u32 = 3;
const PROBE_SPACING: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Local bind port; 0 picks an ephemeral port.
    pub bind_port: u16,
    /// Port tuners listen on for probes.
    pub target_port: u16,
    /// Periodic probe interval; zero means only the initial cycle.
    pub broadcast_interval: Duration,
    /// Suppress the periodic cycle and probe only on demand.
    pub smart_broadcast: bool,
    /// Addresses probed by unicast on every cycle.
    pub static_addresses: Vec<Ipv4Addr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_port: 64_998,
            target_port: DEFAULT_DISCOVERY_PORT,
            broadcast_interval: Duration::from_secs(58),
            smart_broadcast: true,
            static_addresses: Vec::new(),
        }
    }
}

struct Shared {
    running: AtomicBool,
    broadcast_wanted: AtomicBool,
    broadcast_notify: Notify,
    crc_errors: AtomicU64,
    dropped_datagrams: AtomicU64,
}

/// The discovery loop. Owns no policy beyond sending and receiving; what to
/// do with a resolved device is the registry's business.
pub struct Discovery {
    shared: Arc<Shared>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                broadcast_wanted: AtomicBool::new(false),
                broadcast_notify: Notify::new(),
                crc_errors: AtomicU64::new(0),
                dropped_datagrams: AtomicU64::new(0),
            }),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Datagrams dropped for a bad checksum.
    pub fn crc_errors(&self) -> u64 {
        self.shared.crc_errors.load(Ordering::Relaxed)
    }

    /// Datagrams dropped as malformed.
    pub fn dropped_datagrams(&self) -> u64 {
        self.shared.dropped_datagrams.load(Ordering::Relaxed)
    }

    /// Requests an on-demand probe cycle (smart-broadcast trigger).
    pub fn request_broadcast(&self) {
        self.shared.broadcast_wanted.store(true, Ordering::Release);
        self.shared.broadcast_notify.notify_one();
    }

    /// Binds the socket and spawns the receive and send tasks. A second
    /// start while running is a no-op.
    pub fn start(
        &self,
        config: DiscoveryConfig,
        registry: Arc<DeviceRegistry>,
        control: Arc<dyn ControlClient>,
        ignore: IgnoreLists,
    ) -> Result<(), DiscoveryError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let socket = match bind_discovery_socket(config.bind_port) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let local_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
        info!(
            port = local_port,
            smart = config.smart_broadcast,
            statics = config.static_addresses.len(),
            "discovery started"
        );

        let cancel = CancellationToken::new();
        *lock(&self.cancel) = Some(cancel.clone());

        let recv_task = tokio::spawn(recv_loop(
            self.shared.clone(),
            socket.clone(),
            cancel.clone(),
            registry,
            control,
            ignore,
        ));
        let send_task = tokio::spawn(send_loop(self.shared.clone(), socket, cancel, config));

        let mut tasks = lock(&self.tasks);
        tasks.push(recv_task);
        tasks.push(send_task);
        Ok(())
    }

    /// Cancels the engine. Blocked receives return immediately; use
    /// [`wait_for_stop`](Self::wait_for_stop) to join the background work.
    pub fn stop(&self) {
        if let Some(cancel) = lock(&self.cancel).take() {
            cancel.cancel();
        }
    }

    /// Joins every task started by [`start`](Self::start).
    pub async fn wait_for_stop(&self) {
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn bind_discovery_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn recv_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    registry: Arc<DeviceRegistry>,
    control: Arc<dyn ControlClient>,
    ignore: IgnoreLists,
) {
    let mut buf = [0u8; 1500];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, peer) = match received {
            Ok(received) => received,
            Err(e) => {
                warn!("discovery receive failed: {e}");
                break;
            }
        };
        let IpAddr::V4(peer_ip) = peer.ip() else {
            continue;
        };

        match protocol::parse_reply(&buf[..len]) {
            Ok(reply) if reply.is_tuner() => {
                match control.resolve(&reply, peer_ip).await {
                    Ok(device) => registry.add_device(device, Ipv4Addr::BROADCAST, &ignore),
                    Err(e) => warn!(
                        device_id = %format_args!("{:08X}", reply.device_id),
                        "control query for a discovered device failed: {e}"
                    ),
                }
            }
            Ok(reply) => {
                trace!(%peer, device_type = reply.device_type, "ignoring non-tuner reply");
            }
            Err(ProtocolError::BadCrc) => {
                shared.crc_errors.fetch_add(1, Ordering::Relaxed);
                trace!(%peer, "dropping datagram with a bad checksum");
            }
            Err(e) => {
                shared.dropped_datagrams.fetch_add(1, Ordering::Relaxed);
                trace!(%peer, "dropping malformed datagram: {e}");
            }
        }
    }
    shared.running.store(false, Ordering::SeqCst);
    debug!("discovery receive task stopped");
}

async fn send_loop(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    config: DiscoveryConfig,
) {
    let probe = protocol::encode_discover_request();
    let mut targets: Vec<SocketAddr> =
        vec![SocketAddr::from((Ipv4Addr::BROADCAST, config.target_port))];
    targets.extend(
        config
            .static_addresses
            .iter()
            .map(|&ip| SocketAddr::from((ip, config.target_port))),
    );

    let periodic = !config.smart_broadcast && !config.broadcast_interval.is_zero();

    send_cycle(&socket, &probe, &targets).await;
    loop {
        let fire = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.broadcast_notify.notified() => {
                shared.broadcast_wanted.swap(false, Ordering::AcqRel)
            }
            _ = tokio::time::sleep(config.broadcast_interval), if periodic => true,
        };
        if fire {
            send_cycle(&socket, &probe, &targets).await;
        }
    }
    debug!("discovery send task stopped");
}

async fn send_cycle(socket: &UdpSocket, probe: &[u8], targets: &[SocketAddr]) {
    for attempt in 0..PROBE_REPEATS {
        if attempt > 0 {
            tokio::time::sleep(PROBE_SPACING).await;
        }
        for target in targets {
            if let Err(e) = socket.send_to(probe, target).await {
                // broadcast can fail on hosts without a broadcast route
                debug!(%target, "discovery probe send failed: {e}");
            }
        }
    }
}
