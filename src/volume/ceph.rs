//! Ceph RBD volume plugin.
//!
//! Each volume gets a `qemu-storage-daemon` exposing the RBD image as a
//! `vhost-user-blk` export on a per-volume Unix socket under
//! `machines/<id>/volumes/ceph/<handle>/`. The daemon's credentials live in
//! generated `conf` and `key` files next to the socket; its pid is recorded
//! so deletion can terminate it.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use snafu::ResultExt;
use tokio::process::Command;
use tracing::debug;
use tracing::info;

use super::error;
use super::Result;
use super::VolumeError;
use super::VolumePlugin;
use crate::host::Paths;
use crate::machine::VolumeAccess;
use crate::machine::VolumeSpec;
use crate::machine::VolumeState;
use crate::machine::VolumeStatus;
use crate::vmm::process::cleanup_socket;
use crate::vmm::process::is_socket_active;
use crate::vmm::process::is_socket_present;

pub const PLUGIN_NAME: &str = "ceph";

const SOCKET_FILE: &str = "socket";
const CONF_FILE: &str = "conf";
const KEY_FILE: &str = "key";
const PID_FILE: &str = "pid";
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct CephPlugin {
    paths: Paths,
    bin: PathBuf,
    detach: bool,
}

#[derive(Debug)]
struct ValidatedVolume {
    handle: String,
    monitors: Vec<String>,
    pool: String,
    image: String,
    user_id: String,
    user_key: String,
}

impl CephPlugin {
    pub fn new(paths: Paths, bin: impl Into<PathBuf>, detach: bool) -> Self {
        Self { paths, bin: bin.into(), detach }
    }

    fn volume_dir(&self, machine_id: &str, handle: &str) -> PathBuf {
        self.paths.machine_volume_dir(machine_id, PLUGIN_NAME, handle)
    }

    fn validate(volume: &VolumeSpec) -> Result<ValidatedVolume> {
        let attr = |attribute: &'static str| -> Result<String> {
            volume
                .connection
                .attributes
                .get(attribute)
                .cloned()
                .ok_or(VolumeError::MissingAttribute { volume: volume.name.clone(), attribute })
        };
        let secret = |attribute: &'static str| -> Result<String> {
            volume
                .connection
                .secret_data
                .get(attribute)
                .cloned()
                .ok_or(VolumeError::MissingAttribute { volume: volume.name.clone(), attribute })
        };

        Ok(ValidatedVolume {
            handle: volume.connection.handle.clone(),
            monitors: attr("monitors")?.split(',').map(str::to_string).collect(),
            pool: attr("pool")?,
            image: attr("image")?,
            user_id: attr("userID")?,
            user_key: secret("userKey")?,
        })
    }

    async fn write_credentials(&self, dir: &Path, volume: &ValidatedVolume) -> Result<PathBuf> {
        let conf_path = dir.join(CONF_FILE);
        let key_path = dir.join(KEY_FILE);

        tokio::fs::write(&conf_path, conf_contents(volume))
            .await
            .context(error::IoSnafu { path: conf_path.clone() })?;
        tokio::fs::write(&key_path, key_contents(volume))
            .await
            .context(error::IoSnafu { path: key_path.clone() })?;

        Ok(conf_path)
    }

    async fn start_daemon(
        &self,
        dir: &Path,
        socket: &Path,
        conf: &Path,
        volume: &ValidatedVolume,
    ) -> Result<()> {
        cleanup_socket(socket)
            .await
            .context(error::IoSnafu { path: socket.to_path_buf() })?;

        let mut cmd = Command::new(&self.bin);
        cmd.arg("--blockdev")
            .arg(blockdev_arg(volume, conf))
            .arg("--export")
            .arg(export_arg(volume, socket))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);

        if self.detach {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        info!(handle = %volume.handle, socket = %socket.display(), "starting qemu-storage-daemon");
        let child =
            cmd.spawn().context(error::SpawnDaemonSnafu { bin: self.bin.clone() })?;

        wait_for_socket(socket, SOCKET_WAIT_TIMEOUT).await?;

        if let Some(pid) = child.id() {
            let pid_path = dir.join(PID_FILE);
            tokio::fs::write(&pid_path, pid.to_string())
                .await
                .context(error::IoSnafu { path: pid_path })?;
        }

        // The daemon outlives this handle; deletion goes through the pid file.
        tokio::spawn(async move {
            let mut child = child;
            let _ = child.wait().await;
        });

        Ok(())
    }
}

#[async_trait]
impl VolumePlugin for CephPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn apply(&self, machine_id: &str, volume: &VolumeSpec) -> Result<VolumeStatus> {
        let validated = Self::validate(volume)?;
        let dir = self.volume_dir(machine_id, &validated.handle);
        tokio::fs::create_dir_all(&dir)
            .await
            .context(error::IoSnafu { path: dir.clone() })?;

        let socket = dir.join(SOCKET_FILE);
        let conf = self.write_credentials(&dir, &validated).await?;

        let active = is_socket_present(&socket)
            .await
            .context(error::IoSnafu { path: socket.clone() })?
            && is_socket_active(&socket).await;
        if !active {
            self.start_daemon(&dir, &socket, &conf, &validated).await?;
        } else {
            debug!(handle = %validated.handle, "qemu-storage-daemon already serving");
        }

        Ok(VolumeStatus {
            name: volume.name.clone(),
            handle: validated.handle,
            state: VolumeState::Prepared,
            access: Some(VolumeAccess::VhostUser { socket }),
        })
    }

    async fn delete(&self, machine_id: &str, handle: &str) -> Result<()> {
        let dir = self.volume_dir(machine_id, handle);
        let pid_path = dir.join(PID_FILE);

        match tokio::fs::read_to_string(&pid_path).await {
            Ok(raw) => {
                let pid: i32 = raw
                    .trim()
                    .parse()
                    .map_err(|_| VolumeError::InvalidPidFile { path: pid_path.clone() })?;
                // ESRCH means the daemon is already gone.
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
                debug!(handle, pid, "killed qemu-storage-daemon");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(VolumeError::Io { path: pid_path, source }),
        }

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(VolumeError::Io { path: dir, source }),
        }
    }
}

fn conf_contents(volume: &ValidatedVolume) -> String {
    format!(
        "[global]\nmon_host = {}\n\n[client.{}]\nkeyring = ./{}\n",
        volume.monitors.join(","),
        volume.user_id,
        KEY_FILE,
    )
}

fn key_contents(volume: &ValidatedVolume) -> String {
    format!("[client.{}]\nkey = {}\n", volume.user_id, volume.user_key)
}

fn blockdev_arg(volume: &ValidatedVolume, conf: &Path) -> String {
    format!(
        "driver=rbd,node-name={},pool={},image={},discard=unmap,cache.direct=on,user={},conf={}",
        volume.handle,
        volume.pool,
        volume.image,
        volume.user_id,
        conf.display(),
    )
}

fn export_arg(volume: &ValidatedVolume, socket: &Path) -> String {
    format!(
        "vhost-user-blk,id={},node-name={},addr.type=unix,addr.path={},writable=on",
        volume.handle,
        volume.handle,
        socket.display(),
    )
}

async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if is_socket_active(path).await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    error::SocketTimeoutSnafu {
        path: path.to_path_buf(),
        timeout_ms: timeout.as_millis() as u64,
    }
    .fail()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::VolumeConnection;

    fn validated() -> ValidatedVolume {
        ValidatedVolume {
            handle: "vol-1".into(),
            monitors: vec!["10.0.0.1:6789".into(), "10.0.0.2:6789".into()],
            pool: "rbd".into(),
            image: "disk-a".into(),
            user_id: "admin".into(),
            user_key: "AQBx".into(),
        }
    }

    #[test]
    fn conf_and_key_files() {
        let conf = conf_contents(&validated());
        assert!(conf.contains("mon_host = 10.0.0.1:6789,10.0.0.2:6789"));
        assert!(conf.contains("[client.admin]"));
        assert!(conf.contains("keyring = ./key"));

        let key = key_contents(&validated());
        assert!(key.contains("[client.admin]"));
        assert!(key.contains("key = AQBx"));
    }

    #[test]
    fn daemon_arguments() {
        let blockdev = blockdev_arg(&validated(), Path::new("/v/conf"));
        assert!(blockdev.contains("driver=rbd"));
        assert!(blockdev.contains("pool=rbd,image=disk-a"));
        assert!(blockdev.contains("conf=/v/conf"));

        let export = export_arg(&validated(), Path::new("/v/socket"));
        assert!(export.contains("vhost-user-blk,id=vol-1"));
        assert!(export.contains("addr.path=/v/socket"));
        assert!(export.contains("writable=on"));
    }

    #[test]
    fn validation_requires_attributes() {
        let volume = VolumeSpec {
            name: "data".into(),
            device: None,
            connection: VolumeConnection {
                driver: PLUGIN_NAME.into(),
                handle: "vol-1".into(),
                ..Default::default()
            },
            deleted_at: None,
        };
        let err = CephPlugin::validate(&volume).unwrap_err();
        assert!(matches!(err, VolumeError::MissingAttribute { attribute: "monitors", .. }));
    }
}
