//! Provider configuration.

use std::path::PathBuf;

use crate::reconciler::DEFAULT_WORKERS;

/// Everything the daemon needs to run, assembled from CLI flags in `main`.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Unix socket path the Machine Runtime gRPC server listens on.
    pub address: PathBuf,

    /// Root of the provider's on-disk state (images, machines, stores).
    pub root_dir: PathBuf,

    /// Path to the cloud-hypervisor binary.
    pub cloud_hypervisor_bin: PathBuf,

    /// Firmware payload handed to every created VM.
    pub firmware_path: Option<PathBuf>,

    /// Path to the qemu-storage-daemon binary (ceph volumes).
    pub qemu_storage_daemon_bin: PathBuf,

    /// External image fetch command; invoked as `<bin> <ref> <dest-dir>`.
    pub image_puller_bin: Option<PathBuf>,

    /// Machine classes file (JSON list of name/cpu_millis/memory_bytes).
    pub machine_classes_file: Option<PathBuf>,

    /// Start VM child processes in their own session so they survive
    /// daemon restarts.
    pub detach_vms: bool,

    /// Reconciler worker count.
    pub workers: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        Self {
            address: PathBuf::from("/var/run/machine-runtime.sock"),
            root_dir: home.join(".chv-provider"),
            cloud_hypervisor_bin: PathBuf::from("cloud-hypervisor"),
            firmware_path: None,
            qemu_storage_daemon_bin: PathBuf::from("qemu-storage-daemon"),
            image_puller_bin: None,
            machine_classes_file: None,
            detach_vms: true,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be at least 1".to_string());
        }
        if self.workers > 256 {
            return Err(format!("workers {} exceeds maximum 256", self.workers));
        }
        if self.address.as_os_str().is_empty() {
            return Err("address must not be empty".to_string());
        }
        if self.cloud_hypervisor_bin.as_os_str().is_empty() {
            return Err("cloud-hypervisor binary path must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ProviderConfig::default().validate().is_ok());
    }

    #[test]
    fn worker_bounds() {
        let mut config = ProviderConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());
        config.workers = 300;
        assert!(config.validate().is_err());
        config.workers = 15;
        assert!(config.validate().is_ok());
    }
}
