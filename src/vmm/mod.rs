//! VMM manager: owns the child cloud-hypervisor process of every machine on
//! the host and the typed client for its API socket.
//!
//! Every public operation holds the machine's mutex for its whole duration,
//! giving mutual exclusion per machine without blocking other machines. The
//! client map is never read without that mutex held.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use snafu::Snafu;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::host::Paths;
use crate::machine::Machine;
use crate::machine::NetworkInterface;
use crate::machine::VolumeAccess;
use crate::machine::VolumeStatus;

pub mod client;
pub(crate) mod process;

pub use client::ConsoleConfig;
pub use client::CpusConfig;
pub use client::DiskConfig;
pub use client::MemoryConfig;
pub use client::NetConfig;
pub use client::PayloadConfig;
pub use client::PlatformConfig;
pub use client::VmConfig;
pub use client::VmInfo;
pub use client::VmState;
pub use client::VmmClient;

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const POWER_OFF_TIMEOUT: Duration = Duration::from_secs(10);
const POWER_OFF_POLL: Duration = Duration::from_millis(200);
/// Grace period between SIGTERM and SIGKILL on teardown.
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
#[snafu(module(error), visibility(pub(crate)))]
pub enum VmmError {
    /// No VMM is tracked for the machine, or the process is already gone.
    /// Callers treat this as idempotent success on teardown paths.
    #[snafu(display("no VMM for machine {machine_id}"))]
    NotFound { machine_id: String },

    /// The VMM is alive but no VM has been created on it yet.
    #[snafu(display("VM is not created"))]
    VmNotCreated,

    #[snafu(display("failed to connect to VMM API socket {}: {source}", path.display()))]
    ConnectSocket { path: PathBuf, source: std::io::Error },

    #[snafu(display("VMM API socket {} not ready after {timeout_ms}ms", path.display()))]
    SocketTimeout { path: PathBuf, timeout_ms: u64 },

    #[snafu(display("HTTP request to VMM API failed: {source}"))]
    HttpRequest { source: hyper::Error },

    #[snafu(display("failed to read VMM API response body: {source}"))]
    ReadBody { source: hyper::Error },

    #[snafu(display("VMM API returned error {status}: {body}"))]
    Api { status: u16, body: String },

    #[snafu(display("failed to serialize VMM API request: {source}"))]
    SerializeRequest { source: serde_json::Error },

    #[snafu(display("failed to deserialize VMM API response: {source}"))]
    DeserializeResponse { source: serde_json::Error },

    #[snafu(display("failed to start cloud-hypervisor {}: {source}", bin.display()))]
    SpawnVmm { bin: PathBuf, source: std::io::Error },

    #[snafu(display("socket io on {}: {source}", path.display()))]
    SocketIo { path: PathBuf, source: std::io::Error },

    #[snafu(display("VM of machine {machine_id} did not reach Shutdown within {timeout_ms}ms"))]
    PowerOffTimeout { machine_id: String, timeout_ms: u64 },

    #[snafu(display("volume {name} carries no access coordinates"))]
    MissingVolumeAccess { name: String },
}

impl VmmError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VmmError::NotFound { .. })
    }

    pub fn is_vm_not_created(&self) -> bool {
        matches!(self, VmmError::VmNotCreated)
    }
}

pub type Result<T, E = VmmError> = std::result::Result<T, E>;

pub struct VmmManager {
    paths: Paths,
    bin: PathBuf,
    firmware_path: Option<PathBuf>,
    detach_vms: bool,

    clients: Mutex<HashMap<String, VmmClient>>,
    children: Mutex<HashMap<String, Child>>,
    /// Per-machine mutexes behind a small meta-lock.
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VmmManager {
    pub fn new(
        paths: Paths,
        bin: impl Into<PathBuf>,
        firmware_path: Option<PathBuf>,
        detach_vms: bool,
    ) -> Self {
        Self {
            paths,
            bin: bin.into(),
            firmware_path,
            detach_vms,
            clients: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    async fn lock_machine(&self, machine_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().expect("vmm lock map");
            locks
                .entry(machine_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    async fn client(&self, machine_id: &str) -> Result<VmmClient> {
        self.clients
            .lock()
            .await
            .get(machine_id)
            .cloned()
            .ok_or_else(|| VmmError::NotFound { machine_id: machine_id.to_string() })
    }

    /// The API socket path for a machine. Derived from the machine id, so
    /// allocation is stable across daemon restarts and cannot collide with
    /// another machine's live socket.
    pub fn free_api_socket(&self, machine_id: &str) -> PathBuf {
        self.paths.machine_api_socket(machine_id)
    }

    /// Ensure a cloud-hypervisor process serves the machine's API socket.
    ///
    /// Re-entering with a live socket is a no-op; a present-but-dead socket
    /// file is replaced by a fresh child.
    pub async fn ensure_vmm(&self, machine_id: &str, api_socket: &std::path::Path) -> Result<()> {
        let _guard = self.lock_machine(machine_id).await;

        let present = process::is_socket_present(api_socket)
            .await
            .map_err(|source| VmmError::SocketIo { path: api_socket.to_path_buf(), source })?;
        let active = present && process::is_socket_active(api_socket).await;

        if !active {
            process::cleanup_socket(api_socket)
                .await
                .map_err(|source| VmmError::SocketIo { path: api_socket.to_path_buf(), source })?;

            let child = process::spawn_vmm(&self.bin, api_socket, self.detach_vms)?;
            self.children.lock().await.insert(machine_id.to_string(), child);
        }

        let client = VmmClient::new(api_socket);
        client.wait_for_socket(SOCKET_WAIT_TIMEOUT).await?;

        let mut clients = self.clients.lock().await;
        if !clients.contains_key(machine_id) {
            debug!(machine_id, socket = %api_socket.display(), "installing VMM client");
            clients.insert(machine_id.to_string(), client);
        }
        Ok(())
    }

    pub async fn ping(&self, machine_id: &str) -> Result<()> {
        let _guard = self.lock_machine(machine_id).await;
        let client = self.client(machine_id).await?;
        let ping = client.vmm_ping().await?;
        trace!(
            machine_id,
            version = %ping.version,
            pid = ping.pid.unwrap_or(-1),
            "VMM ping"
        );
        Ok(())
    }

    /// Live VM state and config. Maps the VMM's 500/"VM is not created"
    /// answer to [`VmmError::VmNotCreated`].
    pub async fn vm_info(&self, machine_id: &str) -> Result<VmInfo> {
        let _guard = self.lock_machine(machine_id).await;
        let client = self.client(machine_id).await?;
        client.vm_info().await
    }

    /// Create the VM from the machine spec. Hot-pluggable devices (NICs,
    /// volume disks) are deliberately absent so creation stays idempotent;
    /// they are attached by the reconciler's hot-plug passes.
    pub async fn create_vm(&self, machine: &Machine) -> Result<()> {
        let machine_id = machine.metadata.id.as_str();
        let _guard = self.lock_machine(machine_id).await;
        let client = self.client(machine_id).await?;

        let vcpus = boot_vcpus(machine.spec.cpu_millis);
        let mut disks = Vec::new();
        if machine.spec.image.is_some() {
            disks.push(DiskConfig {
                path: Some(
                    self.paths.machine_rootfs_file(machine_id).to_string_lossy().into_owned(),
                ),
                ..Default::default()
            });
        }

        let config = VmConfig {
            payload: Some(PayloadConfig {
                firmware: self
                    .firmware_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                ..Default::default()
            }),
            cpus: Some(CpusConfig { boot_vcpus: vcpus, max_vcpus: vcpus }),
            memory: Some(MemoryConfig {
                size: machine.spec.memory_bytes,
                shared: Some(true),
                hugepages: None,
            }),
            serial: Some(ConsoleConfig { mode: "Tty".into(), file: None }),
            console: Some(ConsoleConfig { mode: "Off".into(), file: None }),
            disks: if disks.is_empty() { None } else { Some(disks) },
            net: None,
            platform: Some(PlatformConfig { uuid: Some(machine_id.to_string()) }),
        };

        info!(machine_id, vcpus, memory_bytes = machine.spec.memory_bytes, "creating VM");
        client.create_vm(&config).await
    }

    /// Boot the VM unless it is already running.
    pub async fn power_on(&self, machine_id: &str) -> Result<()> {
        let _guard = self.lock_machine(machine_id).await;
        let client = self.client(machine_id).await?;

        if client.vm_info().await?.state == VmState::Running {
            return Ok(());
        }
        info!(machine_id, "powering VM on");
        client.boot().await
    }

    /// Press the virtual power button and wait (bounded) for `Shutdown`.
    /// A VM that is already off, or not created at all, is success.
    pub async fn power_off(&self, machine_id: &str) -> Result<()> {
        let _guard = self.lock_machine(machine_id).await;
        let client = self.client(machine_id).await?;

        match client.vm_info().await {
            Ok(info) if info.state == VmState::Running => {}
            Ok(_) => return Ok(()),
            Err(e) if e.is_vm_not_created() => return Ok(()),
            Err(e) => return Err(e),
        }

        info!(machine_id, "powering VM off");
        client.power_button().await?;

        let deadline = tokio::time::Instant::now() + POWER_OFF_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            match client.vm_info().await {
                Ok(info) if info.state != VmState::Running => return Ok(()),
                Ok(_) => {}
                Err(e) if e.is_vm_not_created() => return Ok(()),
                Err(e) => return Err(e),
            }
            tokio::time::sleep(POWER_OFF_POLL).await;
        }

        error::PowerOffTimeoutSnafu {
            machine_id,
            timeout_ms: POWER_OFF_TIMEOUT.as_millis() as u64,
        }
        .fail()
    }

    /// Hot-plug a prepared volume. The disk id is the volume handle, which
    /// is how the reconciler later matches live disks against volume status.
    pub async fn add_disk(&self, machine_id: &str, volume: &VolumeStatus) -> Result<()> {
        let _guard = self.lock_machine(machine_id).await;
        let client = self.client(machine_id).await?;

        let disk = disk_config_for(volume)?;
        debug!(machine_id, handle = %volume.handle, "adding disk");
        client.add_disk(&disk).await
    }

    /// Hot-plug a NIC. The device id is the NIC object id
    /// (`NIC--<machineId>--<nicName>`), so the logical NIC name can be
    /// recovered from the VM's live device list. An explicit `mac`
    /// attribute on the spec wins over the plugin-assigned MAC.
    pub async fn add_nic(&self, machine_id: &str, nic: &NetworkInterface) -> Result<()> {
        let _guard = self.lock_machine(machine_id).await;
        let client = self.client(machine_id).await?;

        let net = NetConfig {
            id: Some(nic.metadata.id.clone()),
            tap: nic.status.handle.clone(),
            mac: nic
                .spec
                .attributes
                .get("mac")
                .cloned()
                .or_else(|| nic.status.mac_address.clone()),
            ..Default::default()
        };
        debug!(machine_id, device = %nic.metadata.id, "adding NIC");
        client.add_net(&net).await
    }

    /// Remove a hot-plugged device (disk or NIC) by id.
    pub async fn remove_device(&self, machine_id: &str, device_id: &str) -> Result<()> {
        let _guard = self.lock_machine(machine_id).await;
        let client = self.client(machine_id).await?;
        debug!(machine_id, device = %device_id, "removing device");
        client.remove_device(device_id).await
    }

    /// Tear the VMM down: delete the VM, terminate the child process
    /// (SIGTERM, escalating to SIGKILL after a bounded wait), drop the
    /// client and remove the socket file. Missing entries are
    /// [`VmmError::NotFound`], which teardown callers treat as success.
    pub async fn delete(&self, machine_id: &str) -> Result<()> {
        let _guard = self.lock_machine(machine_id).await;

        let Some(client) = self.clients.lock().await.remove(machine_id) else {
            return error::NotFoundSnafu { machine_id }.fail();
        };

        match client.vm_info().await {
            Ok(info) if info.state == VmState::Running => {
                if let Err(e) = client.power_button().await {
                    warn!(machine_id, error = %e, "power button before delete failed");
                }
            }
            _ => {}
        }

        // The VMM reports its pid through ping; remember it before the VM is
        // torn away in case this daemon does not hold the child handle.
        let reported_pid = client
            .vmm_ping()
            .await
            .ok()
            .and_then(|ping| ping.pid)
            .and_then(|pid| u32::try_from(pid).ok());

        match client.delete_vm().await {
            Ok(()) => {}
            Err(e) if e.is_vm_not_created() => {}
            Err(e) => warn!(machine_id, error = %e, "vm.delete failed, terminating VMM anyway"),
        }

        let child = self.children.lock().await.remove(machine_id);
        match child {
            Some(mut child) => {
                if let Some(pid) = child.id() {
                    debug!(machine_id, pid, "terminating VMM");
                    process::terminate_process(pid);
                }
                match tokio::time::timeout(CHILD_EXIT_TIMEOUT, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        warn!(machine_id, "VMM ignored SIGTERM, killing");
                        let _ = child.start_kill();
                        // Reap without stalling the caller.
                        tokio::spawn(async move {
                            let _ = child.wait().await;
                        });
                    }
                }
            }
            // Not our child (daemon restarted since spawn): signal the pid
            // the VMM reported. Not reparented to us, so no reap needed.
            None => {
                if let Some(pid) = reported_pid {
                    debug!(machine_id, pid, "terminating recovered VMM");
                    process::terminate_process(pid);

                    let deadline = tokio::time::Instant::now() + CHILD_EXIT_TIMEOUT;
                    while process::is_process_alive(pid)
                        && tokio::time::Instant::now() < deadline
                    {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    if process::is_process_alive(pid) {
                        warn!(machine_id, pid, "VMM ignored SIGTERM, killing");
                        process::kill_process(pid);
                    }
                }
            }
        }

        process::cleanup_socket(client.socket_path())
            .await
            .map_err(|source| VmmError::SocketIo {
                path: client.socket_path().to_path_buf(),
                source,
            })?;

        info!(machine_id, "VMM deleted");
        Ok(())
    }
}

/// Boot (and max) vCPU count for a machine: `max(1, cpu_millis / 1000)`.
pub(crate) fn boot_vcpus(cpu_millis: i64) -> u8 {
    (cpu_millis / 1000).clamp(1, u8::MAX as i64) as u8
}

fn disk_config_for(volume: &VolumeStatus) -> Result<DiskConfig> {
    let mut disk = DiskConfig {
        id: Some(volume.handle.clone()),
        ..Default::default()
    };
    match &volume.access {
        Some(VolumeAccess::File { path }) => {
            disk.path = Some(path.to_string_lossy().into_owned());
        }
        Some(VolumeAccess::VhostUser { socket }) => {
            disk.vhost_user = true;
            disk.vhost_socket = Some(socket.to_string_lossy().into_owned());
        }
        None => return error::MissingVolumeAccessSnafu { name: volume.name.clone() }.fail(),
    }
    Ok(disk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::VolumeState;

    #[test]
    fn vcpus_floor_to_one() {
        assert_eq!(boot_vcpus(0), 1);
        assert_eq!(boot_vcpus(1), 1);
        assert_eq!(boot_vcpus(999), 1);
        assert_eq!(boot_vcpus(1000), 1);
        assert_eq!(boot_vcpus(1001), 1);
        assert_eq!(boot_vcpus(4000), 4);
        assert_eq!(boot_vcpus(1_000_000), 255);
    }

    #[test]
    fn disk_config_uses_handle_as_id() {
        let vhost = VolumeStatus {
            name: "data".into(),
            handle: "vol-1".into(),
            state: VolumeState::Prepared,
            access: Some(VolumeAccess::VhostUser { socket: "/run/vol-1.sock".into() }),
        };
        let disk = disk_config_for(&vhost).unwrap();
        assert_eq!(disk.id.as_deref(), Some("vol-1"));
        assert!(disk.vhost_user);
        assert_eq!(disk.vhost_socket.as_deref(), Some("/run/vol-1.sock"));

        let file = VolumeStatus {
            access: Some(VolumeAccess::File { path: "/dev/sdb".into() }),
            ..vhost
        };
        let disk = disk_config_for(&file).unwrap();
        assert!(!disk.vhost_user);
        assert_eq!(disk.path.as_deref(), Some("/dev/sdb"));
    }

    #[test]
    fn disk_config_requires_access() {
        let status = VolumeStatus::pending("data");
        assert!(matches!(
            disk_config_for(&status),
            Err(VmmError::MissingVolumeAccess { .. })
        ));
    }

    #[test]
    fn api_socket_allocation_is_stable() {
        let paths = Paths::new("/srv/provider");
        let manager = VmmManager::new(paths, "cloud-hypervisor", None, true);
        let first = manager.free_api_socket("m-1");
        assert_eq!(first, manager.free_api_socket("m-1"));
        assert_ne!(first, manager.free_api_socket("m-2"));
    }
}
