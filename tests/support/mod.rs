//! Test support: a fake cloud-hypervisor REST API served on a real Unix
//! socket.
//!
//! Behaves like the upstream API for the endpoints the provider uses,
//! including the 500/"VM is not created" answer while no VM exists. State is
//! shared out so tests can assert on what the provider did.

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Method;
use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

use chv_provider::vmm::DiskConfig;
use chv_provider::vmm::NetConfig;
use chv_provider::vmm::VmConfig;
use chv_provider::vmm::VmState;

pub struct FakeVmmState {
    pub vm: Option<VmConfig>,
    pub vm_state: VmState,
    pub create_calls: usize,
    pub boot_calls: usize,
    pub power_button_calls: usize,
    pub delete_calls: usize,
    pub removed_devices: Vec<String>,
}

impl Default for FakeVmmState {
    fn default() -> Self {
        Self {
            vm: None,
            vm_state: VmState::Shutdown,
            create_calls: 0,
            boot_calls: 0,
            power_button_calls: 0,
            delete_calls: 0,
            removed_devices: Vec::new(),
        }
    }
}

pub struct FakeVmm {
    state: Arc<Mutex<FakeVmmState>>,
    accept_task: JoinHandle<()>,
}

impl Drop for FakeVmm {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl FakeVmm {
    /// Bind the fake API on `socket_path` and start serving.
    pub fn start(socket_path: &Path) -> std::io::Result<Self> {
        let listener = UnixListener::bind(socket_path)?;
        let state = Arc::new(Mutex::new(FakeVmmState::default()));

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service =
                        service_fn(move |req| handle_request(state.clone(), req));
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        Ok(Self { state, accept_task })
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&FakeVmmState) -> T) -> T {
        f(&self.state.lock().unwrap())
    }
}

async fn handle_request(
    state: Arc<Mutex<FakeVmmState>>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();

    let response = route(&state, &method, &path, &body);
    Ok(response)
}

fn route(
    state: &Mutex<FakeVmmState>,
    method: &Method,
    path: &str,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let mut state = state.lock().unwrap();
    match (method, path) {
        (&Method::GET, "/api/v1/vmm.ping") => {
            json_response(StatusCode::OK, r#"{"version":"fake-vmm"}"#)
        }
        (&Method::GET, "/api/v1/vm.info") => match &state.vm {
            None => text_response(StatusCode::INTERNAL_SERVER_ERROR, "VM is not created"),
            Some(config) => {
                let info = serde_json::json!({
                    "state": state.vm_state,
                    "config": config,
                });
                json_response(StatusCode::OK, &info.to_string())
            }
        },
        (&Method::PUT, "/api/v1/vm.create") => match serde_json::from_slice::<VmConfig>(body) {
            Ok(config) => {
                state.vm = Some(config);
                state.vm_state = VmState::Created;
                state.create_calls += 1;
                empty_response(StatusCode::NO_CONTENT)
            }
            Err(e) => text_response(StatusCode::BAD_REQUEST, &e.to_string()),
        },
        (&Method::PUT, "/api/v1/vm.boot") => {
            if state.vm.is_none() {
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "VM is not created");
            }
            state.vm_state = VmState::Running;
            state.boot_calls += 1;
            empty_response(StatusCode::NO_CONTENT)
        }
        (&Method::PUT, "/api/v1/vm.power-button") => {
            if state.vm.is_none() {
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "VM is not created");
            }
            state.vm_state = VmState::Shutdown;
            state.power_button_calls += 1;
            empty_response(StatusCode::NO_CONTENT)
        }
        (&Method::PUT, "/api/v1/vm.delete") => {
            state.vm = None;
            state.vm_state = VmState::Shutdown;
            state.delete_calls += 1;
            empty_response(StatusCode::NO_CONTENT)
        }
        (&Method::PUT, "/api/v1/vm.add-disk") => {
            match serde_json::from_slice::<DiskConfig>(body) {
                Ok(disk) => match &mut state.vm {
                    Some(vm) => {
                        vm.disks.get_or_insert_with(Vec::new).push(disk);
                        empty_response(StatusCode::NO_CONTENT)
                    }
                    None => {
                        text_response(StatusCode::INTERNAL_SERVER_ERROR, "VM is not created")
                    }
                },
                Err(e) => text_response(StatusCode::BAD_REQUEST, &e.to_string()),
            }
        }
        (&Method::PUT, "/api/v1/vm.add-net") => {
            match serde_json::from_slice::<NetConfig>(body) {
                Ok(net) => match &mut state.vm {
                    Some(vm) => {
                        vm.net.get_or_insert_with(Vec::new).push(net);
                        empty_response(StatusCode::NO_CONTENT)
                    }
                    None => {
                        text_response(StatusCode::INTERNAL_SERVER_ERROR, "VM is not created")
                    }
                },
                Err(e) => text_response(StatusCode::BAD_REQUEST, &e.to_string()),
            }
        }
        (&Method::PUT, "/api/v1/vm.remove-device") => {
            #[derive(Deserialize)]
            struct RemoveDevice {
                id: String,
            }
            match serde_json::from_slice::<RemoveDevice>(body) {
                Ok(remove) => {
                    if let Some(vm) = &mut state.vm {
                        if let Some(disks) = &mut vm.disks {
                            disks.retain(|d| d.id.as_deref() != Some(remove.id.as_str()));
                        }
                        if let Some(net) = &mut vm.net {
                            net.retain(|n| n.id.as_deref() != Some(remove.id.as_str()));
                        }
                    }
                    state.removed_devices.push(remove.id);
                    empty_response(StatusCode::NO_CONTENT)
                }
                Err(e) => text_response(StatusCode::BAD_REQUEST, &e.to_string()),
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "unknown endpoint"),
    }
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder().status(status).body(Full::new(Bytes::new())).unwrap()
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn json_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
