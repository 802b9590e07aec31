//! Machine Runtime gRPC surface.
//!
//! Thin translation layer: requests become store writes, responses are read
//! from the store. All convergence work happens asynchronously in the
//! reconciler; nothing here talks to the VMM.

use std::path::Path;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use crate::events::EventRecorder;
use crate::machine::Machine;
use crate::machine::MachineSpec;
use crate::machine::MachineState;
use crate::machine::Metadata;
use crate::machine::NicSpec;
use crate::machine::NicState;
use crate::machine::PowerState;
use crate::machine::VolumeConnection;
use crate::machine::VolumeSpec;
use crate::machine::VolumeState;
use crate::machine_class::MachineClassRegistry;
use crate::store::HostStore;
use crate::store::StoreError;

pub mod proto {
    tonic::include_proto!("machineruntime.v1");
}

use proto::machine_runtime_server::MachineRuntime;
pub use proto::machine_runtime_server::MachineRuntimeServer;

pub struct MachineRuntimeService {
    machines: Arc<HostStore<Machine>>,
    machine_classes: Arc<MachineClassRegistry>,
    events: EventRecorder,
}

impl MachineRuntimeService {
    pub fn new(
        machines: Arc<HostStore<Machine>>,
        machine_classes: Arc<MachineClassRegistry>,
        events: EventRecorder,
    ) -> Self {
        Self { machines, machine_classes, events }
    }

    pub fn into_service(self) -> MachineRuntimeServer<Self> {
        MachineRuntimeServer::new(self)
    }
}

#[tonic::async_trait]
impl MachineRuntime for MachineRuntimeService {
    async fn status(
        &self,
        _request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        let machine_classes = self
            .machine_classes
            .list()
            .into_iter()
            .map(|class| proto::MachineClass {
                name: class.name,
                cpu_millis: class.cpu_millis,
                memory_bytes: class.memory_bytes,
            })
            .collect();
        Ok(Response::new(proto::StatusResponse { machine_classes }))
    }

    async fn list_machines(
        &self,
        request: Request<proto::ListMachinesRequest>,
    ) -> Result<Response<proto::ListMachinesResponse>, Status> {
        let selector = request.into_inner().label_selector;
        let machines = self
            .machines
            .list()
            .await
            .into_iter()
            .filter(|machine| {
                selector.iter().all(|(k, v)| {
                    machine.metadata.labels.get(k).map(String::as_str) == Some(v.as_str())
                })
            })
            .map(machine_to_proto)
            .collect();
        Ok(Response::new(proto::ListMachinesResponse { machines }))
    }

    async fn create_machine(
        &self,
        request: Request<proto::CreateMachineRequest>,
    ) -> Result<Response<proto::CreateMachineResponse>, Status> {
        let machine = request
            .into_inner()
            .machine
            .ok_or_else(|| Status::invalid_argument("machine must be set"))?;
        let spec = machine
            .spec
            .ok_or_else(|| Status::invalid_argument("machine spec must be set"))?;

        let (cpu_millis, memory_bytes, machine_class) = if spec.machine_class.is_empty() {
            (spec.cpu_millis, spec.memory_bytes, None)
        } else {
            let class = self
                .machine_classes
                .get(&spec.machine_class)
                .ok_or_else(|| {
                    Status::invalid_argument(format!("unknown machine class {:?}", spec.machine_class))
                })?;
            (class.cpu_millis, class.memory_bytes, Some(spec.machine_class.clone()))
        };
        if cpu_millis <= 0 || memory_bytes == 0 {
            return Err(Status::invalid_argument("machine resources must be non-zero"));
        }

        let mut metadata = Metadata::new(Uuid::new_v4().to_string());
        if let Some(meta) = machine.metadata {
            metadata.labels = meta.labels.into_iter().collect();
        }

        let power = power_from_proto(spec.power)?;
        let machine = Machine {
            metadata,
            spec: MachineSpec {
                power,
                cpu_millis,
                memory_bytes,
                machine_class,
                image: none_if_empty(spec.image),
                ignition: if spec.ignition_data.is_empty() { None } else { Some(spec.ignition_data) },
                volumes: spec.volumes.into_iter().map(volume_from_proto).collect::<Result<_, _>>()?,
                network_interfaces: spec.network_interfaces.into_iter().map(nic_from_proto).collect(),
                api_socket_path: None,
            },
            status: Default::default(),
        };

        let created = self.machines.create(machine).await.map_err(store_status)?;
        info!(machine_id = %created.metadata.id, "machine created");
        Ok(Response::new(proto::CreateMachineResponse {
            machine: Some(machine_to_proto(created)),
        }))
    }

    async fn delete_machine(
        &self,
        request: Request<proto::DeleteMachineRequest>,
    ) -> Result<Response<proto::DeleteMachineResponse>, Status> {
        let machine_id = request.into_inner().machine_id;
        self.machines.delete(&machine_id).await.map_err(store_status)?;
        info!(machine_id = %machine_id, "machine deletion requested");
        Ok(Response::new(proto::DeleteMachineResponse {}))
    }

    async fn update_machine_power(
        &self,
        request: Request<proto::UpdateMachinePowerRequest>,
    ) -> Result<Response<proto::UpdateMachinePowerResponse>, Status> {
        let request = request.into_inner();
        let power = power_from_proto(request.power)?;

        // Reconcilers race us on status writes; retry stale versions.
        for _ in 0..5 {
            let mut machine =
                self.machines.get(&request.machine_id).await.map_err(store_status)?;
            machine.spec.power = power;
            match self.machines.update(machine).await {
                Ok(_) => {
                    debug!(machine_id = %request.machine_id, ?power, "power updated");
                    return Ok(Response::new(proto::UpdateMachinePowerResponse {}));
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(store_status(e)),
            }
        }
        Err(Status::aborted("conflicting writes, retry"))
    }

    async fn list_events(
        &self,
        request: Request<proto::ListEventsRequest>,
    ) -> Result<Response<proto::ListEventsResponse>, Status> {
        let machine_id = request.into_inner().machine_id;
        let events = self
            .events
            .list()
            .into_iter()
            .filter(|e| machine_id.is_empty() || e.machine_id == machine_id)
            .map(|e| proto::Event {
                machine_id: e.machine_id,
                machine_labels: e.machine_labels.into_iter().collect(),
                r#type: e.event_type.as_str().to_string(),
                reason: e.reason,
                message: e.message,
                timestamp: e.timestamp.timestamp(),
            })
            .collect();
        Ok(Response::new(proto::ListEventsResponse { events }))
    }

    async fn attach_volume(
        &self,
        _request: Request<proto::AttachVolumeRequest>,
    ) -> Result<Response<proto::AttachVolumeResponse>, Status> {
        Err(Status::unimplemented("AttachVolume is not implemented"))
    }

    async fn detach_volume(
        &self,
        _request: Request<proto::DetachVolumeRequest>,
    ) -> Result<Response<proto::DetachVolumeResponse>, Status> {
        Err(Status::unimplemented("DetachVolume is not implemented"))
    }

    async fn attach_network_interface(
        &self,
        _request: Request<proto::AttachNetworkInterfaceRequest>,
    ) -> Result<Response<proto::AttachNetworkInterfaceResponse>, Status> {
        Err(Status::unimplemented("AttachNetworkInterface is not implemented"))
    }

    async fn detach_network_interface(
        &self,
        _request: Request<proto::DetachNetworkInterfaceRequest>,
    ) -> Result<Response<proto::DetachNetworkInterfaceResponse>, Status> {
        Err(Status::unimplemented("DetachNetworkInterface is not implemented"))
    }
}

/// Bind the Unix socket (replacing a stale one) and serve until cancelled.
pub async fn serve(
    service: MachineRuntimeService,
    address: &Path,
    token: CancellationToken,
) -> anyhow::Result<()> {
    match tokio::fs::remove_file(address).await {
        Ok(()) => debug!(address = %address.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(address)?;
    let incoming = UnixListenerStream::new(listener);
    info!(address = %address.display(), "serving machine runtime");

    tonic::transport::Server::builder()
        .add_service(service.into_service())
        .serve_with_incoming_shutdown(incoming, token.cancelled())
        .await?;

    info!("machine runtime server stopped");
    Ok(())
}

fn store_status(err: StoreError) -> Status {
    match err {
        StoreError::NotFound { id } => Status::not_found(format!("object {id} not found")),
        StoreError::AlreadyExists { id } => {
            Status::already_exists(format!("object {id} already exists"))
        }
        StoreError::VersionConflict { .. } => Status::aborted(err.to_string()),
        StoreError::InvalidId { .. } => Status::invalid_argument(err.to_string()),
        other => Status::internal(other.to_string()),
    }
}

fn none_if_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn power_from_proto(power: i32) -> Result<PowerState, Status> {
    match proto::Power::try_from(power) {
        Ok(proto::Power::On) => Ok(PowerState::On),
        Ok(proto::Power::Off) => Ok(PowerState::Off),
        Err(_) => Err(Status::invalid_argument(format!("unknown power state {power}"))),
    }
}

fn volume_from_proto(volume: proto::Volume) -> Result<VolumeSpec, Status> {
    let connection = volume
        .connection
        .ok_or_else(|| Status::invalid_argument("volume connection must be set"))?;
    Ok(VolumeSpec {
        name: volume.name,
        device: none_if_empty(volume.device),
        connection: VolumeConnection {
            driver: connection.driver,
            handle: connection.handle,
            attributes: connection.attributes.into_iter().collect(),
            secret_data: connection
                .secret_data
                .into_iter()
                .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
                .collect(),
        },
        deleted_at: None,
    })
}

fn nic_from_proto(nic: proto::NetworkInterface) -> NicSpec {
    NicSpec {
        name: nic.name,
        network_id: nic.network_id,
        ips: nic.ips,
        attributes: nic.attributes.into_iter().collect(),
        deleted_at: None,
    }
}

fn machine_to_proto(machine: Machine) -> proto::Machine {
    let power = match machine.spec.power {
        PowerState::On => proto::Power::On,
        PowerState::Off => proto::Power::Off,
    };
    let state = match machine.status.state {
        MachineState::Pending => proto::MachineState::MachinePending,
        MachineState::Running => proto::MachineState::MachineRunning,
        MachineState::Terminated => proto::MachineState::MachineTerminated,
    };

    proto::Machine {
        metadata: Some(proto::MachineMetadata {
            id: machine.metadata.id,
            labels: machine.metadata.labels.into_iter().collect(),
        }),
        spec: Some(proto::MachineSpec {
            power: power as i32,
            machine_class: machine.spec.machine_class.unwrap_or_default(),
            cpu_millis: machine.spec.cpu_millis,
            memory_bytes: machine.spec.memory_bytes,
            image: machine.spec.image.unwrap_or_default(),
            ignition_data: machine.spec.ignition.unwrap_or_default(),
            volumes: machine
                .spec
                .volumes
                .into_iter()
                .map(|v| proto::Volume {
                    name: v.name,
                    device: v.device.unwrap_or_default(),
                    connection: Some(proto::VolumeConnection {
                        driver: v.connection.driver,
                        handle: v.connection.handle,
                        attributes: v.connection.attributes.into_iter().collect(),
                        secret_data: v
                            .connection
                            .secret_data
                            .into_iter()
                            .map(|(k, val)| (k, val.into_bytes()))
                            .collect(),
                    }),
                })
                .collect(),
            network_interfaces: machine
                .spec
                .network_interfaces
                .into_iter()
                .map(|n| proto::NetworkInterface {
                    name: n.name,
                    network_id: n.network_id,
                    ips: n.ips,
                    attributes: n.attributes.into_iter().collect(),
                })
                .collect(),
        }),
        status: Some(proto::MachineStatus {
            state: state as i32,
            volumes: machine
                .status
                .volume_status
                .into_iter()
                .map(|v| proto::VolumeStatus {
                    name: v.name,
                    handle: v.handle,
                    state: match v.state {
                        VolumeState::Pending => proto::VolumeState::VolumePending,
                        VolumeState::Prepared => proto::VolumeState::VolumePrepared,
                        VolumeState::Attached => proto::VolumeState::VolumeAttached,
                    } as i32,
                })
                .collect(),
            network_interfaces: machine
                .status
                .network_interface_status
                .into_iter()
                .map(|n| proto::NetworkInterfaceStatus {
                    name: n.name,
                    handle: n.handle.unwrap_or_default(),
                    state: match n.state {
                        NicState::Pending => {
                            proto::NetworkInterfaceState::NetworkInterfacePending
                        }
                        NicState::Attached => {
                            proto::NetworkInterfaceState::NetworkInterfaceAttached
                        }
                    } as i32,
                })
                .collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_conversion() {
        assert_eq!(power_from_proto(proto::Power::On as i32).unwrap(), PowerState::On);
        assert_eq!(power_from_proto(proto::Power::Off as i32).unwrap(), PowerState::Off);
        assert!(power_from_proto(42).is_err());
    }

    #[test]
    fn machine_round_trips_to_proto() {
        let mut machine = Machine {
            metadata: Metadata::new("m-1"),
            spec: MachineSpec {
                power: PowerState::On,
                cpu_millis: 4000,
                memory_bytes: 4 << 30,
                image: Some("registry.example/os:1.0".into()),
                ..Default::default()
            },
            status: Default::default(),
        };
        machine.metadata.labels.insert("tier".into(), "web".into());
        machine.status.state = MachineState::Running;

        let proto_machine = machine_to_proto(machine);
        let meta = proto_machine.metadata.unwrap();
        assert_eq!(meta.id, "m-1");
        assert_eq!(meta.labels.get("tier").map(String::as_str), Some("web"));
        let spec = proto_machine.spec.unwrap();
        assert_eq!(spec.cpu_millis, 4000);
        assert_eq!(spec.image, "registry.example/os:1.0");
        assert_eq!(
            proto_machine.status.unwrap().state,
            proto::MachineState::MachineRunning as i32
        );
    }
}
