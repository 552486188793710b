// Device registry.
//
// Reconciles discovery arrivals into stable records: one PhysicalDevice per
// device id, one ParentRecord per physical device, one TunerRecord per
// tuner. Everything lives under a single reader/writer lock; critical
// sections are pure map work, so the lock is never held across I/O.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use super::engine::DiscoveryError;
use super::protocol::DEFAULT_DISCOVERY_PORT;
use super::{name_id, DeviceLoader, ParentRecord, PhysicalDevice, TunerRecord};

/// Models and device ids that must never be loaded.
#[derive(Debug, Clone, Default)]
pub struct IgnoreLists {
    pub models: Vec<String>,
    pub device_ids: Vec<String>,
}

impl IgnoreLists {
    pub fn ignores(&self, device: &PhysicalDevice) -> bool {
        if self
            .models
            .iter()
            .any(|model| device.model.eq_ignore_ascii_case(model))
        {
            return true;
        }
        self.device_ids
            .iter()
            .any(|entry| id_matches(entry, device.device_id))
    }
}

/// Case-insensitive hex comparison accepting padded and unpadded forms.
fn id_matches(entry: &str, device_id: u32) -> bool {
    let entry = entry.trim();
    let entry = entry
        .strip_prefix("0x")
        .or_else(|| entry.strip_prefix("0X"))
        .unwrap_or(entry);
    u32::from_str_radix(entry, 16).map_or(false, |value| value == device_id)
}

struct Inner {
    devices: HashMap<u32, PhysicalDevice>,
    parents: HashMap<i32, ParentRecord>,
    tuners: HashMap<i32, TunerRecord>,
    busy: HashSet<i32>,
}

pub struct DeviceRegistry {
    inner: RwLock<Inner>,
    loader: Arc<dyn DeviceLoader>,
}

impl DeviceRegistry {
    pub fn new(loader: Arc<dyn DeviceLoader>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                devices: HashMap::new(),
                parents: HashMap::new(),
                tuners: HashMap::new(),
                busy: HashSet::new(),
            }),
            loader,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Handles one discovery arrival. Known devices only get their address
    /// and feature flags refreshed; new devices grow a parent record and one
    /// tuner record per tuner, each advertised to the device loader.
    pub fn add_device(&self, device: PhysicalDevice, broadcast: Ipv4Addr, ignore: &IgnoreLists) {
        if ignore.ignores(&device) {
            debug!(
                device_id = %format_args!("{:08X}", device.device_id),
                model = %device.model,
                "ignoring discovered device"
            );
            return;
        }

        let mut advertised = Vec::new();
        {
            let mut inner = self.write();
            if let Some(existing) = inner.devices.get_mut(&device.device_id) {
                if existing.ip != device.ip {
                    info!(
                        device = %existing.unique_name(),
                        from = %existing.ip,
                        to = %device.ip,
                        "device changed its ip address"
                    );
                }
                existing.ip = device.ip;
                existing.base_url = device.base_url.clone();
                existing.legacy = device.legacy;
                return;
            }

            let name = device.unique_name();
            info!(device = %name, tuners = device.tuner_count, "discovered a new device");

            let local_address =
                local_address_for(device.ip).or_else(|| local_address_for(broadcast));
            let parent_id = name_id(&name);
            let mut parent = ParentRecord {
                parent_id,
                name: name.clone(),
                local_address,
                device_id: device.device_id,
                child_tuners: Vec::new(),
            };

            for tuner_index in 0..device.tuner_count {
                let tuner_name = device.unique_tuner_name(tuner_index);
                let tuner = TunerRecord {
                    tuner_id: name_id(&tuner_name),
                    parent_id,
                    tuner_index,
                    name: tuner_name,
                    description: device.description(),
                };
                parent.child_tuners.push(tuner.tuner_id);
                inner.tuners.insert(tuner.tuner_id, tuner.clone());
                advertised.push(tuner);
            }

            inner.parents.insert(parent_id, parent);
            inner.devices.insert(device.device_id, device);
        }

        for tuner in &advertised {
            self.loader.advertise_device(tuner);
        }
    }

    pub fn physical_device(&self, device_id: u32) -> Option<PhysicalDevice> {
        self.read().devices.get(&device_id).cloned()
    }

    pub fn device_count(&self) -> usize {
        self.read().devices.len()
    }

    pub fn tuner_count(&self) -> usize {
        self.read().tuners.len()
    }

    pub fn tuner(&self, tuner_id: i32) -> Option<TunerRecord> {
        self.read().tuners.get(&tuner_id).cloned()
    }

    pub fn all_tuners(&self) -> Vec<TunerRecord> {
        self.read().tuners.values().cloned().collect()
    }

    pub fn parent(&self, parent_id: i32) -> Option<ParentRecord> {
        self.read().parents.get(&parent_id).cloned()
    }

    pub fn all_parents(&self) -> Vec<ParentRecord> {
        self.read().parents.values().cloned().collect()
    }

    /// Marks a tuner busy for an exclusive capture session. At most one
    /// lease exists per tuner; dropping it releases the tuner.
    pub fn claim_tuner(self: &Arc<Self>, tuner_id: i32) -> Result<TunerLease, DiscoveryError> {
        let mut inner = self.write();
        if !inner.tuners.contains_key(&tuner_id) {
            return Err(DiscoveryError::UnknownTuner(tuner_id));
        }
        if !inner.busy.insert(tuner_id) {
            return Err(DiscoveryError::TunerBusy(tuner_id));
        }
        Ok(TunerLease {
            registry: Arc::clone(self),
            tuner_id,
        })
    }

    pub fn is_tuner_busy(&self, tuner_id: i32) -> bool {
        self.read().busy.contains(&tuner_id)
    }

    fn release_tuner(&self, tuner_id: i32) {
        self.write().busy.remove(&tuner_id);
    }

    /// Tears the registry down, destroying every record.
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.devices.clear();
        inner.parents.clear();
        inner.tuners.clear();
        inner.busy.clear();
    }
}

/// Exclusive-use marker for one tuner; releases on drop.
pub struct TunerLease {
    registry: Arc<DeviceRegistry>,
    tuner_id: i32,
}

impl TunerLease {
    pub fn tuner_id(&self) -> i32 {
        self.tuner_id
    }
}

impl Drop for TunerLease {
    fn drop(&mut self) {
        self.registry.release_tuner(self.tuner_id);
    }
}

/// Local NIC address that routes towards `remote`, found by connecting a
/// throwaway UDP socket (no packets are sent).
fn local_address_for(remote: Ipv4Addr) -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((remote, DEFAULT_DISCOVERY_PORT)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        advertised: AtomicUsize,
    }

    impl DeviceLoader for CountingLoader {
        fn advertise_device(&self, _tuner: &TunerRecord) {
            self.advertised.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn device(device_id: u32, model: &str, ip: [u8; 4]) -> PhysicalDevice {
        PhysicalDevice {
            device_id,
            model: model.to_string(),
            tuner_count: 2,
            ip: Ipv4Addr::from(ip),
            base_url: None,
            legacy: true,
        }
    }

    fn registry() -> (Arc<DeviceRegistry>, Arc<CountingLoader>) {
        let loader = Arc::new(CountingLoader {
            advertised: AtomicUsize::new(0),
        });
        (
            Arc::new(DeviceRegistry::new(loader.clone())),
            loader,
        )
    }

    #[test]
    fn a_new_device_creates_parent_and_tuners() {
        let (registry, loader) = registry();
        registry.add_device(
            device(0x1010_1010, "", [192, 168, 1, 50]),
            Ipv4Addr::BROADCAST,
            &IgnoreLists::default(),
        );

        assert_eq!(registry.device_count(), 1);
        assert_eq!(registry.tuner_count(), 2);
        assert_eq!(registry.all_parents().len(), 1);
        assert_eq!(loader.advertised.load(Ordering::SeqCst), 2);

        let parent = registry.all_parents().pop().unwrap();
        assert_eq!(parent.child_tuners.len(), 2);
        for tuner_id in &parent.child_tuners {
            let tuner = registry.tuner(*tuner_id).unwrap();
            assert_eq!(tuner.parent_id, parent.parent_id);
        }
    }

    #[test]
    fn repeated_arrivals_refresh_the_address_without_new_children() {
        let (registry, loader) = registry();
        let ignore = IgnoreLists::default();
        registry.add_device(
            device(0x1010_1010, "", [192, 168, 1, 50]),
            Ipv4Addr::BROADCAST,
            &ignore,
        );
        let before: Vec<i32> = registry.all_tuners().iter().map(|t| t.tuner_id).collect();

        registry.add_device(
            device(0x1010_1010, "", [192, 168, 1, 77]),
            Ipv4Addr::BROADCAST,
            &ignore,
        );

        assert_eq!(
            registry.physical_device(0x1010_1010).unwrap().ip,
            Ipv4Addr::new(192, 168, 1, 77)
        );
        assert_eq!(registry.tuner_count(), 2);
        let after: Vec<i32> = registry.all_tuners().iter().map(|t| t.tuner_id).collect();
        let mut before = before;
        let mut after = after;
        before.sort_unstable();
        after.sort_unstable();
        assert_eq!(before, after);
        assert_eq!(loader.advertised.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ignore_lists_match_models_and_hex_ids() {
        let (registry, _) = registry();
        let ignore = IgnoreLists {
            models: vec!["hdhr3-us".to_string()],
            device_ids: vec!["10a05d4".to_string()],
        };

        registry.add_device(
            device(0x1234_5678, "HDHR3-US", [192, 168, 1, 50]),
            Ipv4Addr::BROADCAST,
            &ignore,
        );
        // unpadded hex id, case-insensitive
        registry.add_device(
            device(0x010A_05D4, "", [192, 168, 1, 51]),
            Ipv4Addr::BROADCAST,
            &ignore,
        );

        assert_eq!(registry.device_count(), 0);
        assert_eq!(registry.tuner_count(), 0);
    }

    #[test]
    fn tuner_leases_are_exclusive_and_release_on_drop() {
        let (registry, _) = registry();
        registry.add_device(
            device(0x2020_2020, "", [192, 168, 1, 60]),
            Ipv4Addr::BROADCAST,
            &IgnoreLists::default(),
        );
        let tuner_id = registry.all_tuners()[0].tuner_id;

        let lease = registry.claim_tuner(tuner_id).unwrap();
        assert!(registry.is_tuner_busy(tuner_id));
        assert!(matches!(
            registry.claim_tuner(tuner_id),
            Err(DiscoveryError::TunerBusy(_))
        ));

        drop(lease);
        assert!(!registry.is_tuner_busy(tuner_id));
        assert!(registry.claim_tuner(tuner_id).is_ok());

        assert!(matches!(
            registry.claim_tuner(12345),
            Err(DiscoveryError::UnknownTuner(12345))
        ));
    }
}
