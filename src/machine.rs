//! Machine and network-interface data model.
//!
//! These are the objects held in the on-disk stores. A `Machine` is a
//! declarative request for one VM on this host; a `NetworkInterface` is a
//! sibling store entity owning the lifecycle of one virtual NIC, so NIC
//! plugins can reconcile it independently of the machine.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::store::StoreObject;

/// Finalizer placed on machines and on the NICs they reference.
pub const MACHINE_FINALIZER: &str = "machine";

/// Finalizer owned by the NIC reconciler itself.
pub const NIC_FINALIZER: &str = "networkinterface";

/// Metadata shared by all store objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub resource_version: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Metadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            labels: BTreeMap::new(),
            finalizers: Vec::new(),
            resource_version: 0,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Append a finalizer if absent. Returns whether the set changed.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Remove a finalizer if present. Returns whether the set changed.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerState {
    #[default]
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MachineState {
    #[default]
    Pending,
    Running,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub metadata: Metadata,
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    #[serde(default)]
    pub power: PowerState,
    pub cpu_millis: i64,
    pub memory_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignition: Option<Vec<u8>>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub network_interfaces: Vec<NicSpec>,
    /// Assigned lazily by the reconciler; never changes once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_socket_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    #[serde(default)]
    pub state: MachineState,
    #[serde(default)]
    pub volume_status: Vec<VolumeStatus>,
    #[serde(default)]
    pub network_interface_status: Vec<MachineNicStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub connection: VolumeConnection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeConnection {
    /// Plugin selector, e.g. "ceph" or "local-disk".
    pub driver: String,
    /// Opaque, stable identifier for the prepared volume. Doubles as the
    /// disk id inside the live VM config.
    pub handle: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub secret_data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VolumeState {
    #[default]
    Pending,
    Prepared,
    Attached,
}

/// How the VMM reaches a prepared volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeAccess {
    File { path: PathBuf },
    VhostUser { socket: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeStatus {
    pub name: String,
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub state: VolumeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<VolumeAccess>,
}

impl VolumeStatus {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: String::new(),
            state: VolumeState::Pending,
            access: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NicSpec {
    pub name: String,
    pub network_id: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NicState {
    #[default]
    Pending,
    Attached,
}

/// A network interface as a first-class store entity.
///
/// Id format is `NIC--<machineId>--<nicName>` so watchers can recover the
/// owning machine, and the VMM device id can be decoded back to the logical
/// NIC name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub metadata: Metadata,
    pub spec: NetworkInterfaceSpec,
    #[serde(default)]
    pub status: NetworkInterfaceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterfaceSpec {
    pub name: String,
    pub network_id: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterfaceStatus {
    #[serde(default)]
    pub state: NicState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// Plugin-assigned MAC, used at hot-plug time unless the spec carries
    /// an explicit `mac` attribute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

/// Per-NIC entry in the machine status, rebuilt from the NIC store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineNicStatus {
    pub name: String,
    #[serde(default)]
    pub state: NicState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl StoreObject for Machine {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

impl StoreObject for NetworkInterface {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

const NIC_ID_PREFIX: &str = "NIC";

/// Encode the NIC store id for a machine/NIC pair.
pub fn nic_object_id(machine_id: &str, nic_name: &str) -> String {
    format!("{}--{}--{}", NIC_ID_PREFIX, machine_id, nic_name)
}

/// Decode a NIC store id back to `(machine_id, nic_name)`.
///
/// Holds for all inputs where `--` appears in neither component.
pub fn parse_nic_object_id(id: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = id.split("--").collect();
    if parts.len() != 3 || parts[0] != NIC_ID_PREFIX {
        return None;
    }
    Some((parts[1], parts[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nic_id_round_trip() {
        let id = nic_object_id("machine-1", "eth0");
        assert_eq!(id, "NIC--machine-1--eth0");
        assert_eq!(parse_nic_object_id(&id), Some(("machine-1", "eth0")));
    }

    #[test]
    fn nic_id_rejects_foreign_ids() {
        assert_eq!(parse_nic_object_id("machine-1"), None);
        assert_eq!(parse_nic_object_id("VOL--machine-1--data"), None);
        assert_eq!(parse_nic_object_id("NIC--too--many--parts"), None);
    }

    #[test]
    fn finalizer_helpers() {
        let mut meta = Metadata::new("m");
        assert!(meta.add_finalizer(MACHINE_FINALIZER));
        assert!(!meta.add_finalizer(MACHINE_FINALIZER));
        assert!(meta.has_finalizer(MACHINE_FINALIZER));
        assert!(meta.remove_finalizer(MACHINE_FINALIZER));
        assert!(!meta.remove_finalizer(MACHINE_FINALIZER));
        assert!(meta.finalizers.is_empty());
    }

    #[test]
    fn machine_serialization_round_trip() {
        let mut machine = Machine {
            metadata: Metadata::new("m-1"),
            spec: MachineSpec {
                power: PowerState::On,
                cpu_millis: 4000,
                memory_bytes: 4 << 30,
                image: Some("registry.example/os:1.0".into()),
                ..Default::default()
            },
            status: MachineStatus::default(),
        };
        machine.spec.volumes.push(VolumeSpec {
            name: "data".into(),
            device: None,
            connection: VolumeConnection {
                driver: "local-disk".into(),
                handle: "vol-1".into(),
                ..Default::default()
            },
            deleted_at: None,
        });

        let raw = serde_json::to_string(&machine).unwrap();
        let back: Machine = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.metadata.id, "m-1");
        assert_eq!(back.spec.cpu_millis, 4000);
        assert_eq!(back.spec.volumes[0].connection.handle, "vol-1");
    }
}
