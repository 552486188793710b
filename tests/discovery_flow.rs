// Discovery scenarios against a scripted UDP tuner: lossy replies, the
// ignore lists, and address bookkeeping, driven through the facade.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use tunerlink::discovery::discoverer::TunerDiscoverer;
use tunerlink::discovery::engine::DiscoveryError;
use tunerlink::discovery::protocol::{self, DiscoverReply};
use tunerlink::discovery::{ControlClient, DeviceLoader, PhysicalDevice, TlvControl, TunerRecord};
use tunerlink::options::OptionStore;

struct CountingLoader {
    advertised: AtomicUsize,
}

impl DeviceLoader for CountingLoader {
    fn advertise_device(&self, _tuner: &TunerRecord) {
        self.advertised.fetch_add(1, Ordering::SeqCst);
    }
}

/// Answers every `reply_every`-th probe with a discover reply for one
/// device; everything else is dropped on the floor.
async fn run_scripted_tuner(
    socket: UdpSocket,
    device_id: u32,
    tuner_count: u8,
    reply_every: usize,
) {
    let mut buf = [0u8; 1500];
    let mut probes = 0usize;
    loop {
        let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
            return;
        };
        // Only count well-formed discover requests.
        if len < 8 || buf[0] != 0x00 || buf[1] != 0x02 {
            continue;
        }
        probes += 1;
        if probes % reply_every != 0 {
            continue;
        }
        let reply = protocol::encode_discover_reply(device_id, Some(tuner_count), None);
        let _ = socket.send_to(&reply, peer).await;
    }
}

fn store_for_port(port: u16) -> Arc<OptionStore> {
    let store = OptionStore::in_memory();
    store.set_raw("hdhr.broadcast_port", "0");
    store.set_raw("hdhr.discovery_port", &port.to_string());
    store.set_raw("hdhr.broadcast_s", "1");
    store.set_raw("hdhr.smart_broadcast", "false");
    store.set_raw("hdhr.static_addresses_csv", "127.0.0.1");
    Arc::new(store)
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

/// A tuner that answers only one probe in three still ends up in the
/// registry exactly once, with one tuner record per advertised tuner.
#[tokio::test]
async fn lossy_replies_register_the_device_exactly_once() {
    let tuner_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = tuner_socket.local_addr().unwrap().port();
    tokio::spawn(run_scripted_tuner(tuner_socket, 0x1010_1010, 2, 3));

    let loader = Arc::new(CountingLoader {
        advertised: AtomicUsize::new(0),
    });
    let discoverer = TunerDiscoverer::new(
        store_for_port(port),
        loader.clone(),
        Arc::new(TlvControl),
    );
    discoverer.start().unwrap();

    let registry = discoverer.registry().clone();
    assert!(
        wait_until(
            || registry.device_count() == 1,
            Duration::from_secs(5)
        )
        .await,
        "device never registered"
    );
    // Let a few more probe cycles land; the device must not be duplicated.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(registry.device_count(), 1);
    let device = registry.physical_device(0x1010_1010).unwrap();
    assert_eq!(device.ip, Ipv4Addr::LOCALHOST);
    assert_eq!(device.tuner_count, 2);
    assert_eq!(discoverer.device_count(), 2);
    assert_eq!(discoverer.all_parent_details().len(), 1);
    assert_eq!(loader.advertised.load(Ordering::SeqCst), 2);

    discoverer.stop();
    discoverer.wait_for_stop().await;
    assert!(!discoverer.is_running());
}

/// Control client that reports a fixed hardware model, standing in for the
/// external control-protocol query.
struct ModelControl {
    model: &'static str,
}

#[async_trait]
impl ControlClient for ModelControl {
    async fn resolve(
        &self,
        reply: &DiscoverReply,
        addr: Ipv4Addr,
    ) -> Result<PhysicalDevice, DiscoveryError> {
        Ok(PhysicalDevice {
            device_id: reply.device_id,
            model: self.model.to_string(),
            tuner_count: reply.tuner_count.unwrap_or(1),
            ip: addr,
            base_url: reply.base_url.clone(),
            legacy: reply.base_url.is_none(),
        })
    }
}

/// An ignored model never reaches the registry no matter how often it
/// replies.
#[tokio::test]
async fn ignored_models_are_never_registered() {
    let tuner_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = tuner_socket.local_addr().unwrap().port();
    tokio::spawn(run_scripted_tuner(tuner_socket, 0x2020_2020, 2, 1));

    let store = store_for_port(port);
    store.set_raw("hdhr.ignore_models", "HDHR3-US");

    let loader = Arc::new(CountingLoader {
        advertised: AtomicUsize::new(0),
    });
    let discoverer = TunerDiscoverer::new(
        store,
        loader.clone(),
        Arc::new(ModelControl { model: "HDHR3-US" }),
    );
    discoverer.start().unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(discoverer.registry().device_count(), 0);
    assert_eq!(discoverer.device_count(), 0);
    assert_eq!(loader.advertised.load(Ordering::SeqCst), 0);

    discoverer.stop();
    discoverer.wait_for_stop().await;
}

/// Loading a capture device hands out an exclusive lease; the second load of
/// the same tuner fails until the first is dropped.
#[tokio::test]
async fn capture_devices_load_with_exclusive_leases() {
    let tuner_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = tuner_socket.local_addr().unwrap().port();
    tokio::spawn(run_scripted_tuner(tuner_socket, 0x3030_3030, 1, 1));

    let loader = Arc::new(CountingLoader {
        advertised: AtomicUsize::new(0),
    });
    let discoverer =
        TunerDiscoverer::new(store_for_port(port), loader, Arc::new(TlvControl));
    discoverer.start().unwrap();

    let registry = discoverer.registry().clone();
    assert!(
        wait_until(|| registry.tuner_count() == 1, Duration::from_secs(5)).await,
        "tuner never registered"
    );
    let tuner_id = discoverer.all_device_details()[0].tuner_id;

    let capture = discoverer.load_capture_device(tuner_id).unwrap();
    assert_eq!(capture.tuner.tuner_id, tuner_id);
    assert_eq!(capture.device.device_id, 0x3030_3030);
    assert!(matches!(
        discoverer.load_capture_device(tuner_id),
        Err(DiscoveryError::TunerBusy(_))
    ));

    drop(capture);
    assert!(discoverer.load_capture_device(tuner_id).is_ok());

    assert!(matches!(
        discoverer.load_capture_device(1),
        Err(DiscoveryError::UnknownTuner(1))
    ));

    discoverer.stop();
    discoverer.wait_for_stop().await;
}
