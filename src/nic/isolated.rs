//! Isolated network interface plugin.
//!
//! No uplink: cloud-hypervisor creates the tap device itself at
//! `vm.add-net` time, so nothing here needs privileges. The plugin's job is
//! a stable handle and MAC (tap names have a 15-char `IFNAMSIZ` limit, so
//! the NIC object id is digested, not embedded; the MAC comes from the same
//! digest) and a per-NIC scratch directory.

use async_trait::async_trait;

use super::error;
use super::NicPlugin;
use super::PreparedNic;
use super::Result;
use crate::host::Paths;
use crate::machine::NetworkInterface;
use snafu::ResultExt;

pub const PLUGIN_NAME: &str = "isolated";

pub struct IsolatedNicPlugin {
    paths: Paths,
}

impl IsolatedNicPlugin {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl NicPlugin for IsolatedNicPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn prepare(&self, machine_id: &str, nic: &NetworkInterface) -> Result<PreparedNic> {
        let dir = self.paths.machine_nic_dir(machine_id, &nic.spec.name);
        tokio::fs::create_dir_all(&dir)
            .await
            .context(error::IoSnafu { path: dir })?;

        Ok(PreparedNic {
            handle: tap_name(&nic.metadata.id),
            mac_address: Some(mac_address(&nic.metadata.id)),
        })
    }

    async fn release(&self, machine_id: &str, nic: &NetworkInterface) -> Result<()> {
        let dir = self.paths.machine_nic_dir(machine_id, &nic.spec.name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(super::NicError::Io { path: dir, source }),
        }
    }
}

/// Deterministic tap name within `IFNAMSIZ` (15 chars): `tap-` + 8 hex
/// digits of an FNV-1a digest of the NIC object id.
fn tap_name(nic_object_id: &str) -> String {
    format!("tap-{:08x}", fnv1a(nic_object_id.as_bytes()))
}

/// Stable locally-administered MAC from the same digest as the tap name.
fn mac_address(nic_object_id: &str) -> String {
    let digest = fnv1a(nic_object_id.as_bytes()).to_be_bytes();
    format!(
        "02:00:{:02x}:{:02x}:{:02x}:{:02x}",
        digest[0], digest[1], digest[2], digest[3]
    )
}

fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
