//! Child process handling for the VMM manager.

use std::path::Path;
use std::process::Stdio;

use snafu::ResultExt;
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::process::Command;
use tracing::debug;
use tracing::info;

use super::error;
use super::Result;

/// Spawn `cloud-hypervisor --api-socket <path> -v`.
///
/// With `detach` the child gets its own session via `setsid`, so it is not
/// part of the daemon's process group and survives daemon restarts; recovery
/// then goes through socket-reachability probing, not process handles.
pub fn spawn_vmm(bin: &Path, api_socket: &Path, detach: bool) -> Result<Child> {
    let mut cmd = Command::new(bin);
    cmd.arg("--api-socket")
        .arg(api_socket)
        .arg("-v")
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(false);

    if detach {
        // Own session, own process group, no controlling terminal.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    info!(bin = %bin.display(), socket = %api_socket.display(), detach, "starting cloud-hypervisor");
    cmd.spawn().context(error::SpawnVmmSnafu { bin: bin.to_path_buf() })
}

/// Whether a filesystem entry exists at `path` and is a Unix socket.
pub async fn is_socket_present(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::FileTypeExt;

    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.file_type().is_socket()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether something is accepting connections on the socket.
pub async fn is_socket_active(path: &Path) -> bool {
    UnixStream::connect(path).await.is_ok()
}

/// Remove a stale socket file so a fresh bind can take its place.
pub async fn cleanup_socket(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether a process with `pid` currently exists.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// SIGTERM a process, ignoring already-gone processes.
pub fn terminate_process(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

/// SIGKILL a process, ignoring already-gone processes.
pub fn kill_process(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socket_probes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.sock");

        assert!(!is_socket_present(&path).await.unwrap());
        assert!(!is_socket_active(&path).await);

        let _listener = tokio::net::UnixListener::bind(&path).unwrap();
        assert!(is_socket_present(&path).await.unwrap());
        assert!(is_socket_active(&path).await);

        // A regular file is not a socket.
        let file = dir.path().join("not-a-socket");
        tokio::fs::write(&file, b"x").await.unwrap();
        assert!(!is_socket_present(&file).await.unwrap());
    }

    #[test]
    fn liveness_probe() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(999_999_999));
    }

    #[tokio::test]
    async fn terminate_then_reap() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(is_process_alive(pid));

        terminate_process(pid);
        let status = child.wait().await.unwrap();
        assert!(!status.success());
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn kill_stops_the_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();

        kill_process(pid);
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
