// Discoverer facade.
//
// The uniform surface the recorder-facing controller drives: lifecycle,
// enumeration, capture-device loading, and the hdhr.* option surface. The
// facade owns no tasks itself; it owns the discovery engine and the registry
// and forwards lifecycle calls.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::engine::{Discovery, DiscoveryConfig, DiscoveryError};
use super::protocol::DEFAULT_DISCOVERY_PORT;
use super::registry::{DeviceRegistry, IgnoreLists, TunerLease};
use super::{ControlClient, DeviceLoader, ParentRecord, PhysicalDevice, TunerRecord};
use crate::options::{OptionError, OptionStore};

pub const NAME: &str = "HDHomeRun";
pub const DESCRIPTION: &str =
    "Discovers capture devices available via the HDHomeRun native protocol.";

/// Integer options and their allowed ranges; used both when priming defaults
/// and when validating `set_options`.
const INTEGER_OPTIONS: &[(&str, i64, i64, i64)] = &[
    // key, default, min, max
    ("hdhr.wait_for_streaming", 15_000, 0, i64::MAX),
    ("hdhr.retry_count", 2, 0, i64::MAX),
    ("hdhr.broadcast_s", 58, 0, i64::MAX),
    ("hdhr.broadcast_port", 64_998, 0, 65_535),
    ("hdhr.discovery_port", DEFAULT_DISCOVERY_PORT as i64, 1024, 65_535),
    ("hdhr.wait_for_offline_detection_s", 8, 0, i64::MAX),
    ("hdhr.offline_detection_min_bytes", 10_528, 0, i64::MAX),
];

const BOOL_OPTIONS: &[(&str, bool)] = &[
    ("hdhr.discoverer_enabled", true),
    ("hdhr.locking", true),
    ("hdhr.smart_broadcast", true),
    ("hdhr.always_tune_legacy", false),
    ("hdhr.allow_http_tuning", true),
];

const STRING_OPTIONS: &[&str] = &["hdhr.extend_transcode_profile"];

const ARRAY_OPTIONS: &[&str] = &[
    "hdhr.static_addresses_csv",
    "hdhr.ignore_models",
    "hdhr.ignore_device_ids",
];

/// A loaded capture device: the tuner's records plus the exclusive-use
/// lease. Dropping it frees the tuner.
pub struct CaptureDevice {
    pub tuner: TunerRecord,
    pub parent: ParentRecord,
    pub device: PhysicalDevice,
    lease: TunerLease,
}

impl CaptureDevice {
    pub fn lease(&self) -> &TunerLease {
        &self.lease
    }
}

pub struct TunerDiscoverer {
    store: Arc<OptionStore>,
    discovery: Discovery,
    registry: Arc<DeviceRegistry>,
    control: Arc<dyn ControlClient>,
}

impl TunerDiscoverer {
    /// Builds the facade and primes the option store: invalid persisted
    /// values are logged and reset to defaults, never propagated.
    pub fn new(
        store: Arc<OptionStore>,
        loader: Arc<dyn DeviceLoader>,
        control: Arc<dyn ControlClient>,
    ) -> Self {
        prime_options(&store);
        Self {
            store,
            discovery: Discovery::new(),
            registry: Arc::new(DeviceRegistry::new(loader)),
            control,
        }
    }

    pub fn name(&self) -> &'static str {
        NAME
    }

    pub fn description(&self) -> &'static str {
        DESCRIPTION
    }

    pub fn is_enabled(&self) -> bool {
        self.store.get_bool("hdhr.discoverer_enabled", true)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.store.set_bool("hdhr.discoverer_enabled", enabled);
        if let Err(e) = self.store.save() {
            warn!("unable to persist device options: {e}");
        }
    }

    /// Starts detection. Disabled or already-running detection is a quiet
    /// no-op, matching how the controller sweeps every discoverer at boot.
    pub fn start(&self) -> Result<(), DiscoveryError> {
        if !self.is_enabled() {
            debug!("discovery is disabled, not starting");
            return Ok(());
        }
        if self.discovery.is_running() {
            return Ok(());
        }
        self.discovery.start(
            self.config(),
            self.registry.clone(),
            self.control.clone(),
            self.ignore_lists(),
        )
    }

    pub fn stop(&self) {
        self.discovery.stop();
    }

    pub async fn wait_for_stop(&self) {
        self.discovery.wait_for_stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.discovery.is_running()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn device_count(&self) -> usize {
        self.registry.tuner_count()
    }

    pub fn all_device_details(&self) -> Vec<TunerRecord> {
        self.registry.all_tuners()
    }

    pub fn device_details(&self, tuner_id: i32) -> Option<TunerRecord> {
        self.registry.tuner(tuner_id)
    }

    pub fn all_parent_details(&self) -> Vec<ParentRecord> {
        self.registry.all_parents()
    }

    pub fn parent_details(&self, parent_id: i32) -> Option<ParentRecord> {
        self.registry.parent(parent_id)
    }

    /// Physical device by id. A miss raises the smart-broadcast flag so the
    /// engine probes for the device the registry was asked about.
    pub fn physical_device(&self, device_id: u32) -> Option<PhysicalDevice> {
        let found = self.registry.physical_device(device_id);
        if found.is_none() {
            debug!(
                device_id = %format_args!("{:08X}", device_id),
                "device lookup missed, requesting a broadcast"
            );
            self.discovery.request_broadcast();
        }
        found
    }

    /// Loads a capture device for exclusive use. The returned value carries
    /// the busy lease; dropping it releases the tuner.
    pub fn load_capture_device(&self, tuner_id: i32) -> Result<CaptureDevice, DiscoveryError> {
        let Some(tuner) = self.registry.tuner(tuner_id) else {
            self.discovery.request_broadcast();
            return Err(DiscoveryError::UnknownTuner(tuner_id));
        };
        let parent = self
            .registry
            .parent(tuner.parent_id)
            .ok_or(DiscoveryError::UnknownTuner(tuner_id))?;
        let device = self
            .registry
            .physical_device(parent.device_id)
            .ok_or(DiscoveryError::UnknownDevice(parent.device_id))?;
        let lease = self.registry.claim_tuner(tuner_id)?;
        info!(tuner = %tuner.name, "capture device loaded");
        Ok(CaptureDevice {
            tuner,
            parent,
            device,
            lease,
        })
    }

    /// Applies option updates, persisting after the batch. Updating the
    /// static address list requests an immediate broadcast so newly
    /// reachable devices load without waiting for the next cycle.
    pub fn set_options(&self, updates: &[(String, String)]) -> Result<(), OptionError> {
        let mut statics_changed = false;
        for (key, value) in updates {
            apply_option(&self.store, key, value)?;
            if key == "hdhr.static_addresses_csv" {
                statics_changed = true;
            }
        }
        self.store.save()?;
        if statics_changed {
            self.discovery.request_broadcast();
        }
        Ok(())
    }

    pub fn streaming_wait(&self) -> Duration {
        let ms = self
            .store
            .get_integer("hdhr.wait_for_streaming", 15_000, 0, i64::MAX)
            .unwrap_or(15_000);
        Duration::from_millis(ms as u64)
    }

    pub fn tuner_locking(&self) -> bool {
        self.store.get_bool("hdhr.locking", true)
    }

    pub fn control_retry_count(&self) -> u32 {
        self.store
            .get_integer("hdhr.retry_count", 2, 0, i64::MAX)
            .unwrap_or(2) as u32
    }

    pub fn broadcast_interval(&self) -> Duration {
        let secs = self
            .store
            .get_integer("hdhr.broadcast_s", 58, 0, i64::MAX)
            .unwrap_or(58);
        Duration::from_secs(secs as u64)
    }

    /// Local bind port for the discovery socket. A configured value below
    /// 1024 is rewritten to 0 (pick an ephemeral port) and persisted.
    pub fn broadcast_port(&self) -> u16 {
        let port = self
            .store
            .get_integer("hdhr.broadcast_port", 64_998, 0, 65_535)
            .unwrap_or(64_998);
        if port > 0 && port < 1024 {
            warn!(port, "broadcast port is below 1024, using an ephemeral port");
            self.store.set_raw("hdhr.broadcast_port", "0");
            if let Err(e) = self.store.save() {
                warn!("unable to persist device options: {e}");
            }
            return 0;
        }
        port as u16
    }

    pub fn smart_broadcast(&self) -> bool {
        self.store.get_bool("hdhr.smart_broadcast", true)
    }

    pub fn always_tune_legacy(&self) -> bool {
        self.store.get_bool("hdhr.always_tune_legacy", false)
    }

    pub fn allow_http_tuning(&self) -> bool {
        self.store.get_bool("hdhr.allow_http_tuning", true)
    }

    pub fn transcode_profile(&self) -> String {
        self.store.get_string("hdhr.extend_transcode_profile", "")
    }

    pub fn offline_detection_wait(&self) -> Duration {
        let secs = self
            .store
            .get_integer("hdhr.wait_for_offline_detection_s", 8, 0, i64::MAX)
            .unwrap_or(8);
        Duration::from_secs(secs as u64)
    }

    pub fn offline_detection_min_bytes(&self) -> u64 {
        self.store
            .get_integer("hdhr.offline_detection_min_bytes", 10_528, 0, i64::MAX)
            .unwrap_or(10_528) as u64
    }

    pub fn static_addresses(&self) -> Vec<Ipv4Addr> {
        self.store
            .get_string_array("hdhr.static_addresses_csv")
            .iter()
            .filter_map(|entry| match entry.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(address = %entry, "ignoring unparsable static address");
                    None
                }
            })
            .collect()
    }

    pub fn ignore_lists(&self) -> IgnoreLists {
        IgnoreLists {
            models: self.store.get_string_array("hdhr.ignore_models"),
            device_ids: self.store.get_string_array("hdhr.ignore_device_ids"),
        }
    }

    fn config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            bind_port: self.broadcast_port(),
            target_port: self
                .store
                .get_integer(
                    "hdhr.discovery_port",
                    DEFAULT_DISCOVERY_PORT as i64,
                    1024,
                    65_535,
                )
                .unwrap_or(DEFAULT_DISCOVERY_PORT as i64) as u16,
            broadcast_interval: self.broadcast_interval(),
            smart_broadcast: self.smart_broadcast(),
            static_addresses: self.static_addresses(),
        }
    }
}

/// Validate-or-revert initialisation: any persisted value outside its range
/// is reset to the default so startup never fails on bad configuration.
fn prime_options(store: &OptionStore) {
    for &(key, default, min, max) in INTEGER_OPTIONS {
        if let Err(e) = store.get_integer(key, default, min, max) {
            warn!("invalid discovery option, reverting to default: {e}");
            store.set_raw(key, &default.to_string());
        }
    }
    for &(key, default) in BOOL_OPTIONS {
        if !store.contains(key) {
            store.set_bool(key, default);
        }
    }
}

fn apply_option(store: &OptionStore, key: &str, value: &str) -> Result<(), OptionError> {
    if let Some(&(key, _, min, max)) = INTEGER_OPTIONS.iter().find(|(k, ..)| *k == key) {
        let parsed: i64 = value.parse().map_err(|_| OptionError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        return store.set_integer(key, parsed, min, max);
    }
    if BOOL_OPTIONS.iter().any(|(k, _)| *k == key) {
        store.set_bool(key, value.trim().eq_ignore_ascii_case("true"));
        return Ok(());
    }
    if STRING_OPTIONS.contains(&key) || ARRAY_OPTIONS.contains(&key) {
        store.set_raw(key, value);
        return Ok(());
    }
    Err(OptionError::UnknownKey(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::TlvControl;

    struct NullLoader;
    impl DeviceLoader for NullLoader {
        fn advertise_device(&self, _tuner: &TunerRecord) {}
    }

    fn discoverer(store: Arc<OptionStore>) -> TunerDiscoverer {
        TunerDiscoverer::new(store, Arc::new(NullLoader), Arc::new(TlvControl))
    }

    #[test]
    fn priming_reverts_invalid_persisted_values() {
        let store = Arc::new(OptionStore::in_memory());
        store.set_raw("hdhr.broadcast_port", "90000");
        let d = discoverer(store.clone());
        assert_eq!(d.broadcast_port(), 64_998);
    }

    #[test]
    fn low_broadcast_ports_become_ephemeral_and_persist() {
        let store = Arc::new(OptionStore::in_memory());
        store.set_raw("hdhr.broadcast_port", "80");
        let d = discoverer(store.clone());
        assert_eq!(d.broadcast_port(), 0);
        assert_eq!(store.get_raw("hdhr.broadcast_port").as_deref(), Some("0"));
    }

    #[test]
    fn set_options_validates_and_rejects_unknown_keys() {
        let store = Arc::new(OptionStore::in_memory());
        let d = discoverer(store.clone());

        d.set_options(&[
            ("hdhr.broadcast_s".to_string(), "120".to_string()),
            ("hdhr.smart_broadcast".to_string(), "false".to_string()),
        ])
        .unwrap();
        assert_eq!(d.broadcast_interval(), Duration::from_secs(120));
        assert!(!d.smart_broadcast());

        assert!(matches!(
            d.set_options(&[("hdhr.bogus".to_string(), "1".to_string())]),
            Err(OptionError::UnknownKey(_))
        ));
        assert!(d
            .set_options(&[("hdhr.broadcast_port".to_string(), "70000".to_string())])
            .is_err());
    }

    #[test]
    fn static_addresses_parse_and_skip_garbage() {
        let store = Arc::new(OptionStore::in_memory());
        store.set_raw("hdhr.static_addresses_csv", "192.168.1.50,not-an-ip");
        let d = discoverer(store);
        assert_eq!(d.static_addresses(), vec![Ipv4Addr::new(192, 168, 1, 50)]);
    }

    #[tokio::test]
    async fn disabled_discoverer_does_not_start() {
        let store = Arc::new(OptionStore::in_memory());
        let d = discoverer(store);
        d.set_enabled(false);
        d.start().unwrap();
        assert!(!d.is_running());
    }
}
