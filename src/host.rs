//! On-disk layout of the provider root directory.
//!
//! ```text
//! <root>/
//!   images/                    # OCI cache
//!   plugins/<name>/            # plugin-global scratch
//!   store/{machines,networkinterfaces}/
//!   machines/<id>/
//!     api.sock
//!     rootfs/rootfs
//!     volumes/<plugin>/<handle>/
//!     networkinterfaces/<name>/
//!     ignitions/data.ign
//! ```
//!
//! The machine directory tree is single-writer by construction (the
//! reconciler); everything else only reads it.

use std::path::Path;
use std::path::PathBuf;

pub const API_SOCKET_NAME: &str = "api.sock";
const IMAGES_DIR: &str = "images";
const PLUGINS_DIR: &str = "plugins";
const STORE_DIR: &str = "store";
const MACHINES_DIR: &str = "machines";
const MACHINE_ROOTFS_DIR: &str = "rootfs";
const MACHINE_ROOTFS_FILE: &str = "rootfs";
const MACHINE_VOLUMES_DIR: &str = "volumes";
const MACHINE_NICS_DIR: &str = "networkinterfaces";
const MACHINE_IGNITIONS_DIR: &str = "ignitions";
const MACHINE_IGNITION_FILE: &str = "data.ign";

#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join(PLUGINS_DIR)
    }

    pub fn plugin_dir(&self, plugin: &str) -> PathBuf {
        self.plugins_dir().join(plugin)
    }

    pub fn machine_store_dir(&self) -> PathBuf {
        self.root.join(STORE_DIR).join("machines")
    }

    pub fn nic_store_dir(&self) -> PathBuf {
        self.root.join(STORE_DIR).join("networkinterfaces")
    }

    pub fn machines_dir(&self) -> PathBuf {
        self.root.join(MACHINES_DIR)
    }

    pub fn machine_dir(&self, machine_id: &str) -> PathBuf {
        self.machines_dir().join(machine_id)
    }

    pub fn machine_api_socket(&self, machine_id: &str) -> PathBuf {
        self.machine_dir(machine_id).join(API_SOCKET_NAME)
    }

    pub fn machine_rootfs_dir(&self, machine_id: &str) -> PathBuf {
        self.machine_dir(machine_id).join(MACHINE_ROOTFS_DIR)
    }

    pub fn machine_rootfs_file(&self, machine_id: &str) -> PathBuf {
        self.machine_rootfs_dir(machine_id).join(MACHINE_ROOTFS_FILE)
    }

    pub fn machine_volumes_dir(&self, machine_id: &str) -> PathBuf {
        self.machine_dir(machine_id).join(MACHINE_VOLUMES_DIR)
    }

    pub fn machine_volume_plugin_dir(&self, machine_id: &str, plugin: &str) -> PathBuf {
        self.machine_volumes_dir(machine_id).join(plugin)
    }

    pub fn machine_volume_dir(&self, machine_id: &str, plugin: &str, handle: &str) -> PathBuf {
        self.machine_volume_plugin_dir(machine_id, plugin).join(handle)
    }

    pub fn machine_nics_dir(&self, machine_id: &str) -> PathBuf {
        self.machine_dir(machine_id).join(MACHINE_NICS_DIR)
    }

    pub fn machine_nic_dir(&self, machine_id: &str, nic_name: &str) -> PathBuf {
        self.machine_nics_dir(machine_id).join(nic_name)
    }

    pub fn machine_ignitions_dir(&self, machine_id: &str) -> PathBuf {
        self.machine_dir(machine_id).join(MACHINE_IGNITIONS_DIR)
    }

    pub fn machine_ignition_file(&self, machine_id: &str) -> PathBuf {
        self.machine_ignitions_dir(machine_id).join(MACHINE_IGNITION_FILE)
    }

    /// Create the base directory tree. Called once at startup.
    pub async fn ensure_base(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::create_dir_all(self.images_dir()).await?;
        tokio::fs::create_dir_all(self.plugins_dir()).await?;
        tokio::fs::create_dir_all(self.machines_dir()).await?;
        Ok(())
    }

    /// Create the per-machine directory tree. Idempotent.
    pub async fn make_machine_dirs(&self, machine_id: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.machine_dir(machine_id)).await?;
        tokio::fs::create_dir_all(self.machine_rootfs_dir(machine_id)).await?;
        tokio::fs::create_dir_all(self.machine_volumes_dir(machine_id)).await?;
        tokio::fs::create_dir_all(self.machine_ignitions_dir(machine_id)).await?;
        tokio::fs::create_dir_all(self.machine_nics_dir(machine_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let paths = Paths::new("/srv/provider");
        assert_eq!(
            paths.machine_rootfs_file("m-1"),
            PathBuf::from("/srv/provider/machines/m-1/rootfs/rootfs")
        );
        assert_eq!(
            paths.machine_api_socket("m-1"),
            PathBuf::from("/srv/provider/machines/m-1/api.sock")
        );
        assert_eq!(
            paths.machine_volume_dir("m-1", "ceph", "vol-7"),
            PathBuf::from("/srv/provider/machines/m-1/volumes/ceph/vol-7")
        );
    }

    #[tokio::test]
    async fn machine_dirs_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        paths.ensure_base().await.unwrap();
        paths.make_machine_dirs("m-1").await.unwrap();
        paths.make_machine_dirs("m-1").await.unwrap();
        assert!(paths.machine_ignitions_dir("m-1").is_dir());
        assert!(paths.machine_nics_dir("m-1").is_dir());
    }
}
