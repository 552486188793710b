// Tuner discovery and bookkeeping.
//
// `protocol` speaks the HDHomeRun discovery framing, `engine` runs the UDP
// probe/receive loop, `registry` reconciles replies into stable device
// records, and `discoverer` is the facade the recorder-facing controller
// drives.

pub mod discoverer;
pub mod engine;
pub mod protocol;
pub mod registry;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use crc::{Crc, CRC_32_ISO_HDLC};

use self::engine::DiscoveryError;
use self::protocol::DiscoverReply;

const NAME_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Stable 32-bit identifier derived from a unique device or tuner name.
pub fn name_id(name: &str) -> i32 {
    NAME_CRC.checksum(name.as_bytes()) as i32
}

/// A physical tuner box on the network. At most one exists per device id;
/// after creation only the address and feature flags are refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    pub device_id: u32,
    /// Hardware model ("HDHR3-US", ...); empty when the control query has
    /// not supplied one.
    pub model: String,
    pub tuner_count: u8,
    pub ip: Ipv4Addr,
    pub base_url: Option<String>,
    /// Legacy devices tune by RF parameters and carry no base URL.
    pub legacy: bool,
}

impl PhysicalDevice {
    /// Unique, stable device name; the parent record id is derived from it.
    pub fn unique_name(&self) -> String {
        format!("HDHomeRun {:08X}", self.device_id)
    }

    pub fn unique_tuner_name(&self, tuner_index: u8) -> String {
        format!("{} Tuner {}", self.unique_name(), tuner_index)
    }

    pub fn description(&self) -> String {
        if self.model.is_empty() {
            "HDHomeRun capture device.".to_string()
        } else {
            format!("HDHomeRun {} capture device.", self.model)
        }
    }
}

/// Registry record for one physical device: the network-facing half of the
/// parent/child pair. Owns its child tuner ids; the back-reference from a
/// tuner is the parent id, resolved through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRecord {
    pub parent_id: i32,
    pub name: String,
    /// Local NIC address whose network reaches the device.
    pub local_address: Option<std::net::IpAddr>,
    pub device_id: u32,
    pub child_tuners: Vec<i32>,
}

/// One logical capture device (a single tuner). Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunerRecord {
    pub tuner_id: i32,
    pub parent_id: i32,
    pub tuner_index: u8,
    pub name: String,
    pub description: String,
}

/// Collaborator that receives newly discovered capture devices.
pub trait DeviceLoader: Send + Sync {
    fn advertise_device(&self, tuner: &TunerRecord);

    /// Whether the recorder is still waiting for expected devices to appear.
    fn is_waiting_for_devices(&self) -> bool {
        true
    }
}

/// External HDHomeRun control-protocol client.
///
/// A discovery reply does not carry everything a `PhysicalDevice` needs (the
/// hardware model in particular); filling the gaps takes a follow-up query
/// over the control protocol, which lives outside this crate.
#[async_trait]
pub trait ControlClient: Send + Sync {
    async fn resolve(
        &self,
        reply: &DiscoverReply,
        addr: Ipv4Addr,
    ) -> Result<PhysicalDevice, DiscoveryError>;
}

/// Resolver that uses only what the reply TLVs carry: no model, tuner count
/// from the TLV (single tuner assumed when absent), legacy inferred from the
/// missing base URL.
pub struct TlvControl;

#[async_trait]
impl ControlClient for TlvControl {
    async fn resolve(
        &self,
        reply: &DiscoverReply,
        addr: Ipv4Addr,
    ) -> Result<PhysicalDevice, DiscoveryError> {
        Ok(PhysicalDevice {
            device_id: reply.device_id,
            model: String::new(),
            tuner_count: reply.tuner_count.unwrap_or(1),
            ip: addr,
            base_url: reply.base_url.clone(),
            legacy: reply.base_url.is_none(),
        })
    }
}
