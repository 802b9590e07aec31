//! Volume plugins.
//!
//! A plugin turns a volume connection into something the VMM can attach: a
//! host file/block device or a vhost-user-blk socket. Plugins are selected
//! by the connection's driver name.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use snafu::Snafu;

use crate::machine::VolumeSpec;
use crate::machine::VolumeStatus;

pub mod ceph;
pub mod localdisk;

#[derive(Debug, Snafu)]
#[snafu(module(error), visibility(pub(crate)))]
pub enum VolumeError {
    #[snafu(display("no volume plugin for driver {driver:?}"))]
    PluginNotFound { driver: String },

    #[snafu(display("volume {volume}: missing required attribute {attribute:?}"))]
    MissingAttribute { volume: String, attribute: &'static str },

    #[snafu(display("volume {volume}: source {} does not exist", path.display()))]
    SourceMissing { volume: String, path: PathBuf },

    #[snafu(display("failed to start qemu-storage-daemon {}: {source}", bin.display()))]
    SpawnDaemon { bin: PathBuf, source: std::io::Error },

    #[snafu(display("vhost-user socket {} not ready after {timeout_ms}ms", path.display()))]
    SocketTimeout { path: PathBuf, timeout_ms: u64 },

    #[snafu(display("volume io on {}: {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },

    #[snafu(display("invalid pid file {}", path.display()))]
    InvalidPidFile { path: PathBuf },
}

pub type Result<T, E = VolumeError> = std::result::Result<T, E>;

/// One volume driver.
#[async_trait]
pub trait VolumePlugin: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Prepare the volume for attachment. Idempotent; returns a status in
    /// state `Prepared` with access coordinates. `Attached` is only ever set
    /// by the reconciler once the disk is live in the VM.
    async fn apply(&self, machine_id: &str, volume: &VolumeSpec) -> Result<VolumeStatus>;

    /// Release everything `apply` set up for the handle. Idempotent.
    async fn delete(&self, machine_id: &str, handle: &str) -> Result<()>;
}

#[derive(Default)]
pub struct VolumePluginManager {
    plugins: Vec<Arc<dyn VolumePlugin>>,
}

impl VolumePluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn VolumePlugin>) {
        self.plugins.push(plugin);
    }

    pub fn find_by_spec(&self, volume: &VolumeSpec) -> Result<Arc<dyn VolumePlugin>> {
        let driver = volume.connection.driver.as_str();
        self.plugins
            .iter()
            .find(|p| p.name() == driver)
            .cloned()
            .ok_or_else(|| VolumeError::PluginNotFound { driver: driver.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::VolumeConnection;

    #[derive(Debug)]
    struct FakePlugin;

    #[async_trait]
    impl VolumePlugin for FakePlugin {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn apply(&self, _machine_id: &str, volume: &VolumeSpec) -> Result<VolumeStatus> {
            Ok(VolumeStatus::pending(&volume.name))
        }

        async fn delete(&self, _machine_id: &str, _handle: &str) -> Result<()> {
            Ok(())
        }
    }

    fn volume(driver: &str) -> VolumeSpec {
        VolumeSpec {
            name: "data".into(),
            device: None,
            connection: VolumeConnection { driver: driver.into(), ..Default::default() },
            deleted_at: None,
        }
    }

    #[test]
    fn dispatches_by_driver() {
        let mut manager = VolumePluginManager::new();
        manager.register(Arc::new(FakePlugin));

        assert!(manager.find_by_spec(&volume("fake")).is_ok());
        let err = manager.find_by_spec(&volume("rbd")).unwrap_err();
        assert!(matches!(err, VolumeError::PluginNotFound { .. }));
    }
}
