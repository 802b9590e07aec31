//! cloud-hypervisor REST API client over a per-VM Unix socket.
//!
//! Wire types mirror the upstream OpenAPI specification for the endpoints
//! this provider uses; compatibility with the cloud-hypervisor version
//! shipped on the node is part of the external contract.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::Method;
use hyper::Request;
use hyper::Response;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tokio::net::UnixStream;
use tracing::debug;
use tracing::trace;

use super::error;
use super::Result;
use super::VmmError;

/// Body cloud-hypervisor returns with status 500 while no VM exists yet.
/// The upstream API leaves no structured alternative to matching it.
const VM_NOT_CREATED_BODY: &str = "VM is not created";

#[derive(Clone)]
pub struct VmmClient {
    socket_path: PathBuf,
}

impl VmmClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self { socket_path: socket_path.into() }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Wait for the API socket to become connectable.
    pub async fn wait_for_socket(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll_interval = Duration::from_millis(100);

        while tokio::time::Instant::now() < deadline {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                debug!(path = %self.socket_path.display(), "API socket is ready");
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }

        error::SocketTimeoutSnafu {
            path: self.socket_path.clone(),
            timeout_ms: timeout.as_millis() as u64,
        }
        .fail()
    }

    pub async fn vmm_ping(&self) -> Result<VmmPingResponse> {
        self.get("/api/v1/vmm.ping").await
    }

    pub async fn vm_info(&self) -> Result<VmInfo> {
        self.get("/api/v1/vm.info").await
    }

    pub async fn create_vm(&self, config: &VmConfig) -> Result<()> {
        self.put_body("/api/v1/vm.create", config).await
    }

    pub async fn boot(&self) -> Result<()> {
        self.put_empty("/api/v1/vm.boot").await
    }

    /// Graceful power-off through the virtual power button.
    pub async fn power_button(&self) -> Result<()> {
        self.put_empty("/api/v1/vm.power-button").await
    }

    pub async fn delete_vm(&self) -> Result<()> {
        self.put_empty("/api/v1/vm.delete").await
    }

    pub async fn add_disk(&self, disk: &DiskConfig) -> Result<()> {
        self.put_body("/api/v1/vm.add-disk", disk).await
    }

    pub async fn add_net(&self, net: &NetConfig) -> Result<()> {
        self.put_body("/api/v1/vm.add-net", net).await
    }

    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let req = VmRemoveDevice { id: device_id.to_string() };
        self.put_body("/api/v1/vm.remove-device", &req).await
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let response = self.request(Method::GET, path, None).await?;
        self.parse_response(response).await
    }

    async fn put_body<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let body_json = serde_json::to_vec(body).context(error::SerializeRequestSnafu)?;
        let response = self.request(Method::PUT, path, Some(body_json)).await?;
        self.check_response(response).await
    }

    async fn put_empty(&self, path: &str) -> Result<()> {
        let response = self.request(Method::PUT, path, Some(vec![])).await?;
        self.check_response(response).await
    }

    /// One HTTP/1 request over a fresh Unix socket connection.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response<Incoming>> {
        trace!(method = %method, path = %path, "VMM API request");

        let stream = UnixStream::connect(&self.socket_path)
            .await
            .context(error::ConnectSocketSnafu { path: self.socket_path.clone() })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|source| VmmError::HttpRequest { source })?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("VMM API connection error: {}", e);
            }
        });

        let body_bytes = body
            .map(|b| Full::new(Bytes::from(b)))
            .unwrap_or_else(|| Full::new(Bytes::new()));

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("Host", "localhost")
            .header("Content-Type", "application/json")
            .body(body_bytes)
            .expect("valid request");

        sender
            .send_request(req)
            .await
            .map_err(|source| VmmError::HttpRequest { source })
    }

    async fn parse_response<T: for<'de> Deserialize<'de>>(
        &self,
        response: Response<Incoming>,
    ) -> Result<T> {
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|source| VmmError::ReadBody { source })?
            .to_bytes();

        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }

        if body.is_empty() {
            return serde_json::from_str("null").context(error::DeserializeResponseSnafu);
        }

        serde_json::from_slice(&body).context(error::DeserializeResponseSnafu)
    }

    async fn check_response(&self, response: Response<Incoming>) -> Result<()> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|source| VmmError::ReadBody { source })?
                .to_bytes();
            return Err(api_error(status.as_u16(), &body));
        }
        Ok(())
    }
}

fn api_error(status: u16, body: &[u8]) -> VmmError {
    let body = String::from_utf8_lossy(body).to_string();
    if status == 500 && body == VM_NOT_CREATED_BODY {
        return VmmError::VmNotCreated;
    }
    VmmError::Api { status, body }
}

// cloud-hypervisor wire types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmmPingResponse {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Created,
    Running,
    Shutdown,
    Paused,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub state: VmState,
    pub config: VmConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_actual_size: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<PayloadConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<CpusConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<ConsoleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<ConsoleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<DiskConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<Vec<NetConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initramfs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpusConfig {
    pub boot_vcpus: u8,
    pub max_vcpus: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Bytes.
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hugepages: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    #[serde(default)]
    pub vhost_user: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vhost_socket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VmRemoveDevice {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_not_created_body_is_a_sentinel() {
        assert!(matches!(api_error(500, b"VM is not created"), VmmError::VmNotCreated));
        assert!(matches!(api_error(500, b"internal error"), VmmError::Api { .. }));
        assert!(matches!(api_error(404, b"VM is not created"), VmmError::Api { status: 404, .. }));
    }

    #[test]
    fn vm_config_serialization_skips_empty_fields() {
        let config = VmConfig {
            cpus: Some(CpusConfig { boot_vcpus: 4, max_vcpus: 4 }),
            memory: Some(MemoryConfig {
                size: 4 << 30,
                shared: Some(true),
                hugepages: None,
            }),
            serial: Some(ConsoleConfig { mode: "Tty".into(), file: None }),
            console: Some(ConsoleConfig { mode: "Off".into(), file: None }),
            platform: Some(PlatformConfig { uuid: Some("m-1".into()) }),
            ..Default::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("boot_vcpus"));
        assert!(json.contains("\"uuid\":\"m-1\""));
        assert!(!json.contains("disks"));
        assert!(!json.contains("hugepages"));
    }

    #[test]
    fn vm_state_parses_unknown_values() {
        let info: VmInfo =
            serde_json::from_str(r#"{"state":"BreakPoint","config":{}}"#).unwrap();
        assert_eq!(info.state, VmState::Unknown);
        let info: VmInfo = serde_json::from_str(r#"{"state":"Running","config":{}}"#).unwrap();
        assert_eq!(info.state, VmState::Running);
    }
}
