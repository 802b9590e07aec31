//! Machine reconciler.
//!
//! One convergence function per machine id, driven by a deduplicating work
//! queue and a fixed worker pool. Store watches and image pull-done events
//! only enqueue ids; all work happens in [`MachineReconciler::reconcile`],
//! which is idempotent and crash-safe: every step either leaves a persistent
//! effect later runs can detect, or is a pure function of the spec and the
//! observed VMM state.
//!
//! Finalizer-before-side-effect: the machine finalizer is durable before the
//! first directory is created, and a NIC carries the machine finalizer
//! before its device is hot-plugged. Crash recovery is therefore always
//! "repeat the reconcile".

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use snafu::ResultExt;
use snafu::Snafu;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::events::EventRecorder;
use crate::events::EventType;
use crate::events::REASON_NIC_ATTACHED;
use crate::events::REASON_NIC_DETACHED;
use crate::events::REASON_PULLED_IMAGE;
use crate::events::REASON_RECONCILE_FAILED;
use crate::events::REASON_VOLUME_ATTACHED;
use crate::events::REASON_VOLUME_DETACHED;
use crate::host::Paths;
use crate::image::ImageCache;
use crate::image::ImageError;
use crate::machine::nic_object_id;
use crate::machine::parse_nic_object_id;
use crate::machine::Machine;
use crate::machine::MachineNicStatus;
use crate::machine::MachineState;
use crate::machine::Metadata;
use crate::machine::NetworkInterface;
use crate::machine::NetworkInterfaceSpec;
use crate::machine::NicState;
use crate::machine::PowerState;
use crate::machine::VolumeState;
use crate::machine::VolumeStatus;
use crate::machine::MACHINE_FINALIZER;
use crate::queue::WorkQueue;
use crate::raw;
use crate::raw::RawError;
use crate::store::ignore_not_found;
use crate::store::HostStore;
use crate::store::StoreError;
use crate::vmm::VmInfo;
use crate::vmm::VmState;
use crate::vmm::VmmError;
use crate::vmm::VmmManager;
use crate::volume::VolumeError;
use crate::volume::VolumePluginManager;

pub const DEFAULT_WORKERS: usize = 15;

#[derive(Debug, Snafu)]
#[snafu(module(error), visibility(pub(crate)))]
pub enum ReconcileError {
    #[snafu(display("machine store: {source}"))]
    Store { source: StoreError },

    #[snafu(display("nic store: {source}"))]
    NicStore { source: StoreError },

    #[snafu(display("vmm: {source}"))]
    Vmm { source: VmmError },

    #[snafu(display("volume {name}: {source}"))]
    Volume { name: String, source: VolumeError },

    #[snafu(display("image: {source}"))]
    Image { source: ImageError },

    #[snafu(display("rootfs: {source}"))]
    Rootfs { source: RawError },

    #[snafu(display("machine io on {}: {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },

    /// Invariant violation: the live VM does not belong to this machine.
    /// Fatal for the machine; retried only at the rate limiter's cap.
    #[snafu(display("machine {machine_id} and VM uuid {vm_uuid:?} do not match"))]
    IdentityMismatch { machine_id: String, vm_uuid: String },
}

impl ReconcileError {
    /// A stale-resource-version retry rather than a real failure.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ReconcileError::Store { source: StoreError::VersionConflict { .. } }
                | ReconcileError::NicStore { source: StoreError::VersionConflict { .. } }
        )
    }
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;

pub struct MachineReconciler {
    machines: Arc<HostStore<Machine>>,
    nics: Arc<HostStore<NetworkInterface>>,
    vmm: Arc<VmmManager>,
    volume_plugins: Arc<VolumePluginManager>,
    image_cache: ImageCache,
    recorder: EventRecorder,
    paths: Paths,
    queue: WorkQueue,
    workers: usize,
}

impl MachineReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machines: Arc<HostStore<Machine>>,
        nics: Arc<HostStore<NetworkInterface>>,
        vmm: Arc<VmmManager>,
        volume_plugins: Arc<VolumePluginManager>,
        image_cache: ImageCache,
        recorder: EventRecorder,
        paths: Paths,
        workers: usize,
    ) -> Self {
        Self {
            machines,
            nics,
            vmm,
            volume_plugins,
            image_cache,
            recorder,
            paths,
            queue: WorkQueue::new(),
            workers,
        }
    }

    pub fn enqueue(&self, machine_id: &str) {
        self.queue.add(machine_id);
    }

    /// Run event fan-in and the worker pool until the token is cancelled.
    /// Shutdown drains in-flight items, then returns.
    pub async fn start(self: Arc<Self>, token: CancellationToken) {
        // Image pull-done events re-drive every machine waiting on the ref.
        {
            let machines = self.machines.clone();
            let queue = self.queue.clone();
            let recorder = self.recorder.clone();
            self.image_cache.add_listener(move |event| {
                let machines = machines.clone();
                let queue = queue.clone();
                let recorder = recorder.clone();
                let image_ref = event.image_ref.clone();
                tokio::spawn(async move {
                    for machine in machines.list().await {
                        if machine.spec.image.as_deref() == Some(image_ref.as_str()) {
                            recorder.record(
                                &machine.metadata,
                                EventType::Normal,
                                REASON_PULLED_IMAGE,
                                format!("Pulled image {image_ref}"),
                            );
                            debug!(machine_id = %machine.metadata.id, image = %image_ref, "image pulled, requeue");
                            queue.add(&machine.metadata.id);
                        }
                    }
                });
            });
        }

        let mut tasks = JoinSet::new();

        // Cold start: every persisted machine gets a pass.
        let mut machine_watch = self.machines.watch();
        let mut nic_watch = self.nics.watch();
        for machine in self.machines.list().await {
            self.queue.add(&machine.metadata.id);
        }

        {
            let queue = self.queue.clone();
            let machines = self.machines.clone();
            let token = token.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        event = machine_watch.recv() => match event {
                            Ok(event) => {
                                debug!(machine_id = %event.object().metadata.id, "machine event");
                                queue.add(&event.object().metadata.id);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                                // Missed events: fall back to a full resync.
                                for machine in machines.list().await {
                                    queue.add(&machine.metadata.id);
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        },
                    }
                }
            });
        }

        {
            let queue = self.queue.clone();
            let token = token.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        event = nic_watch.recv() => match event {
                            Ok(event) => {
                                if let Some((machine_id, _)) =
                                    parse_nic_object_id(&event.object().metadata.id)
                                {
                                    queue.add(machine_id);
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!(missed = n, "nic watch lagged");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        },
                    }
                }
            });
        }

        {
            let queue = self.queue.clone();
            let token = token.clone();
            tasks.spawn(async move {
                token.cancelled().await;
                queue.shut_down();
            });
        }

        for _ in 0..self.workers {
            let this = self.clone();
            tasks.spawn(async move {
                while let Some(id) = this.queue.get().await {
                    if let Err(e) = this.reconcile(&id).await {
                        error!(machine_id = %id, error = %e, "failed to reconcile machine");
                        // Write conflicts are routine retries, not warnings.
                        if !e.is_conflict() {
                            if let Ok(machine) = this.machines.get(&id).await {
                                this.recorder.record(
                                    &machine.metadata,
                                    EventType::Warning,
                                    REASON_RECONCILE_FAILED,
                                    e.to_string(),
                                );
                            }
                        }
                        this.queue.done(&id);
                        this.queue.add_rate_limited(&id);
                        continue;
                    }
                    this.queue.forget(&id);
                    this.queue.done(&id);
                }
            });
        }

        while tasks.join_next().await.is_some() {}
        info!("machine reconciler stopped");
    }

    /// One convergence pass for a machine id.
    pub async fn reconcile(&self, machine_id: &str) -> Result<()> {
        let machine = match self.machines.get(machine_id).await {
            Ok(machine) => machine,
            // Stale enqueue after deletion.
            Err(e) if e.is_not_found() => return Ok(()),
            Err(source) => return Err(ReconcileError::Store { source }),
        };

        if machine.metadata.deleted_at.is_some() {
            self.delete_machine(machine).await?;
            return Ok(());
        }

        // The finalizer write is split from everything else so it is durable
        // before any external side effect; the store watch re-enqueues.
        if !machine.metadata.has_finalizer(MACHINE_FINALIZER) {
            let mut machine = machine;
            machine.metadata.add_finalizer(MACHINE_FINALIZER);
            self.machines.update(machine).await.context(error::StoreSnafu)?;
            return Ok(());
        }

        self.paths
            .make_machine_dirs(machine_id)
            .await
            .context(error::IoSnafu { path: self.paths.machine_dir(machine_id) })?;

        self.write_ignition(&machine).await?;

        if self.reconcile_image(&machine).await? {
            // Image still pulling; the pull-done event re-enqueues.
            return Ok(());
        }

        let mut machine = machine;
        let api_socket = match &machine.spec.api_socket_path {
            Some(path) => path.clone(),
            None => {
                let socket = self.vmm.free_api_socket(machine_id);
                machine.spec.api_socket_path = Some(socket);
                self.machines.update(machine).await.context(error::StoreSnafu)?;
                return Ok(());
            }
        };

        self.vmm
            .ensure_vmm(machine_id, &api_socket)
            .await
            .context(error::VmmSnafu)?;
        self.vmm.ping(machine_id).await.context(error::VmmSnafu)?;

        let nics = self.materialize_nics(&machine).await?;

        let mut machine = self.reconcile_volumes(machine).await?;

        let vm = match self.vmm.vm_info(machine_id).await {
            Ok(vm) => vm,
            Err(e) if e.is_vm_not_created() => {
                debug!(machine_id, "VM not created");
                if !nics_ready(&nics) {
                    debug!(machine_id, "waiting for network interfaces to attach");
                    return Ok(());
                }

                self.vmm.create_vm(&machine).await.context(error::VmmSnafu)?;

                for nic in nics.values() {
                    if nic.metadata.deleted_at.is_some() {
                        continue;
                    }
                    self.pin_nic(nic).await?;
                }

                info!(machine_id, "VM created, requeue");
                self.queue.add(machine_id);
                return Ok(());
            }
            Err(source) => return Err(ReconcileError::Vmm { source }),
        };

        let vm_uuid = vm
            .config
            .platform
            .as_ref()
            .and_then(|p| p.uuid.clone())
            .unwrap_or_default();
        if vm_uuid != machine.metadata.id {
            return error::IdentityMismatchSnafu { machine_id, vm_uuid }.fail();
        }

        match machine.spec.power {
            PowerState::On => {
                if vm.state != VmState::Running {
                    self.vmm.power_on(machine_id).await.context(error::VmmSnafu)?;
                }
            }
            PowerState::Off => {
                if vm.state == VmState::Running {
                    self.vmm.power_off(machine_id).await.context(error::VmmSnafu)?;
                }
            }
        }

        self.reconcile_hot_nics(&machine, &nics, &vm).await?;
        machine = self.attach_detach_disks(machine, &vm).await?;

        let previous_status = machine.status.clone();
        machine.status.state = match machine.spec.power {
            PowerState::On => MachineState::Running,
            PowerState::Off => MachineState::Terminated,
        };
        machine.status.network_interface_status = machine
            .spec
            .network_interfaces
            .iter()
            .map(|spec_nic| {
                let mut status = MachineNicStatus {
                    name: spec_nic.name.clone(),
                    state: NicState::Pending,
                    handle: None,
                };
                if let Some(nic) = nics.get(&spec_nic.name) {
                    if nic.status.state == NicState::Attached {
                        status.state = NicState::Attached;
                        status.handle = nic.status.handle.clone();
                    }
                }
                status
            })
            .collect();

        // A pass that changed nothing writes nothing: reconcile twice with no
        // external change and the second pass leaves the store untouched.
        if machine.status != previous_status {
            self.machines.update(machine).await.context(error::StoreSnafu)?;
        }
        debug!(machine_id, "machine reconciled");
        Ok(())
    }

    /// Write the ignition payload once the directories exist.
    async fn write_ignition(&self, machine: &Machine) -> Result<()> {
        let Some(ignition) = &machine.spec.ignition else {
            return Ok(());
        };
        let path = self.paths.machine_ignition_file(&machine.metadata.id);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(()),
            Ok(false) => tokio::fs::write(&path, ignition)
                .await
                .context(error::IoSnafu { path }),
            Err(source) => Err(ReconcileError::Io { path, source }),
        }
    }

    /// Returns `true` when the reconcile should end because the image is
    /// still being pulled.
    async fn reconcile_image(&self, machine: &Machine) -> Result<bool> {
        let Some(image_ref) = &machine.spec.image else {
            return Ok(false);
        };

        let image = match self.image_cache.get(image_ref).await {
            Ok(image) => image,
            Err(e) if e.is_pulling() => {
                debug!(machine_id = %machine.metadata.id, image = %image_ref, "image not in cache");
                return Ok(true);
            }
            Err(source) => return Err(ReconcileError::Image { source }),
        };

        let rootfs = self.paths.machine_rootfs_file(&machine.metadata.id);
        let exists = tokio::fs::try_exists(&rootfs)
            .await
            .map_err(|source| ReconcileError::Io { path: rootfs.clone(), source })?;
        if !exists {
            raw::create_from_source(&rootfs, &image.rootfs)
                .await
                .context(error::RootfsSnafu)?;
            info!(machine_id = %machine.metadata.id, "root disk materialised");
        }

        Ok(false)
    }

    /// Ensure the NIC store mirrors the machine spec: create missing
    /// objects, delete the ones whose spec entry is marked for deletion.
    /// The NIC plugin's own reconciler drives them to `Attached`.
    async fn materialize_nics(
        &self,
        machine: &Machine,
    ) -> Result<HashMap<String, NetworkInterface>> {
        let machine_id = &machine.metadata.id;
        let mut nics = HashMap::new();

        for spec_nic in &machine.spec.network_interfaces {
            let nic_id = nic_object_id(machine_id, &spec_nic.name);

            let nic = match self.nics.get(&nic_id).await {
                Ok(nic) => nic,
                Err(e) if e.is_not_found() => {
                    if spec_nic.deleted_at.is_some() {
                        continue;
                    }
                    debug!(nic_id = %nic_id, "creating network interface object");
                    self.nics
                        .create(NetworkInterface {
                            metadata: Metadata::new(&nic_id),
                            spec: NetworkInterfaceSpec {
                                name: spec_nic.name.clone(),
                                network_id: spec_nic.network_id.clone(),
                                ips: spec_nic.ips.clone(),
                                attributes: spec_nic.attributes.clone(),
                            },
                            status: Default::default(),
                        })
                        .await
                        .context(error::NicStoreSnafu)?
                }
                Err(source) => return Err(ReconcileError::NicStore { source }),
            };

            if spec_nic.deleted_at.is_some() {
                self.nics.delete(&nic_id).await.context(error::NicStoreSnafu)?;
                // Keep the (now deletion-stamped) object visible to the
                // hot-unplug pass below.
                nics.insert(
                    spec_nic.name.clone(),
                    self.nics.get(&nic_id).await.unwrap_or(nic),
                );
                continue;
            }

            nics.insert(spec_nic.name.clone(), nic);
        }

        Ok(nics)
    }

    async fn reconcile_volumes(&self, mut machine: Machine) -> Result<Machine> {
        let machine_id = machine.metadata.id.clone();
        let mut updated_spec = Vec::new();
        let mut updated_status = Vec::new();

        for volume in machine.spec.volumes.clone() {
            let plugin = self
                .volume_plugins
                .find_by_spec(&volume)
                .context(error::VolumeSnafu { name: volume.name.clone() })?;

            let status = volume_status(&machine.status.volume_status, &volume.name);

            if volume.deleted_at.is_some() && status.state != VolumeState::Attached {
                debug!(machine_id = %machine_id, volume = %volume.name, "releasing volume");
                plugin
                    .delete(&machine_id, &volume.connection.handle)
                    .await
                    .context(error::VolumeSnafu { name: volume.name.clone() })?;
                // Dropped from both spec and status.
                continue;
            }

            let mut applied = plugin
                .apply(&machine_id, &volume)
                .await
                .context(error::VolumeSnafu { name: volume.name.clone() })?;
            // Never rewind the volume state machine.
            if status.state == VolumeState::Attached {
                applied.state = VolumeState::Attached;
            }

            updated_spec.push(volume);
            updated_status.push(applied);
        }

        if machine.spec.volumes == updated_spec
            && machine.status.volume_status == updated_status
        {
            return Ok(machine);
        }
        machine.spec.volumes = updated_spec;
        machine.status.volume_status = updated_status;
        self.machines.update(machine).await.context(error::StoreSnafu)
    }

    /// Hot-plug pass over the VM's live net devices.
    async fn reconcile_hot_nics(
        &self,
        machine: &Machine,
        nics: &HashMap<String, NetworkInterface>,
        vm: &VmInfo,
    ) -> Result<()> {
        let machine_id = &machine.metadata.id;
        let mut present = HashSet::new();

        for device in vm.config.net.as_deref().unwrap_or_default() {
            let Some(device_id) = device.id.as_deref() else {
                continue;
            };
            let Some((owner, nic_name)) = parse_nic_object_id(device_id) else {
                continue;
            };
            if owner != machine_id {
                continue;
            }

            match nics.get(nic_name) {
                Some(nic) if nic.metadata.deleted_at.is_none() => {
                    present.insert(nic_name.to_string());
                }
                other => {
                    info!(machine_id, device = %device_id, "unplugging NIC");
                    self.vmm
                        .remove_device(machine_id, device_id)
                        .await
                        .context(error::VmmSnafu)?;
                    if let Some(nic) = other {
                        self.unpin_nic(nic).await?;
                    }
                    self.recorder.record(
                        &machine.metadata,
                        EventType::Normal,
                        REASON_NIC_DETACHED,
                        format!("Detached network interface {nic_name}"),
                    );
                }
            }
        }

        for (nic_name, nic) in nics {
            if nic.metadata.deleted_at.is_some() || present.contains(nic_name) {
                continue;
            }
            if nic.status.state != NicState::Attached {
                debug!(machine_id, nic = %nic_name, "NIC not prepared yet, skip hot-plug");
                continue;
            }

            // Finalizer first: a crash between the two writes leaves a
            // pinned NIC, never an orphaned device.
            self.pin_nic(nic).await?;

            info!(machine_id, nic = %nic_name, "hot-plugging NIC");
            self.vmm.add_nic(machine_id, nic).await.context(error::VmmSnafu)?;
            self.recorder.record(
                &machine.metadata,
                EventType::Normal,
                REASON_NIC_ATTACHED,
                format!("Attached network interface {nic_name}"),
            );
        }

        Ok(())
    }

    /// Hot-plug pass over the VM's live disks, keyed by volume handle.
    async fn attach_detach_disks(&self, mut machine: Machine, vm: &VmInfo) -> Result<Machine> {
        let machine_id = machine.metadata.id.clone();
        let live_disks: HashSet<&str> = vm
            .config
            .disks
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|d| d.id.as_deref())
            .collect();

        let mut updated_status = Vec::new();
        for volume in &machine.spec.volumes {
            let mut status = volume_status(&machine.status.volume_status, &volume.name);

            if volume.deleted_at.is_none() {
                if !live_disks.contains(status.handle.as_str()) {
                    if status.state != VolumeState::Prepared {
                        debug!(machine_id = %machine_id, volume = %volume.name, "skip disk attach: not prepared");
                        continue;
                    }
                    self.vmm
                        .add_disk(&machine_id, &status)
                        .await
                        .context(error::VmmSnafu)?;
                    self.recorder.record(
                        &machine.metadata,
                        EventType::Normal,
                        REASON_VOLUME_ATTACHED,
                        format!("Attached volume {}", volume.name),
                    );
                }
                status.state = VolumeState::Attached;
                updated_status.push(status);
            } else if live_disks.contains(status.handle.as_str()) {
                self.vmm
                    .remove_device(&machine_id, &status.handle)
                    .await
                    .context(error::VmmSnafu)?;
                self.recorder.record(
                    &machine.metadata,
                    EventType::Normal,
                    REASON_VOLUME_DETACHED,
                    format!("Detached volume {}", volume.name),
                );
                updated_status.push(status);
            } else {
                // Device already gone; the next volume pass releases it.
                status.state = VolumeState::Prepared;
                updated_status.push(status);
            }
        }

        if machine.status.volume_status == updated_status {
            return Ok(machine);
        }
        machine.status.volume_status = updated_status;
        self.machines.update(machine).await.context(error::StoreSnafu)
    }

    /// Ordered teardown; see the module docs for the finalizer protocol.
    async fn delete_machine(&self, machine: Machine) -> Result<()> {
        let machine_id = machine.metadata.id.clone();

        if self.machine_is_running(&machine_id).await? {
            info!(machine_id = %machine_id, "powering off for deletion");
            match self.vmm.power_off(&machine_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(source) => return Err(ReconcileError::Vmm { source }),
            }
        }

        match self.vmm.delete(&machine_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(source) => return Err(ReconcileError::Vmm { source }),
        }

        let mut all_nics_deleted = true;
        for spec_nic in &machine.spec.network_interfaces {
            let nic_id = nic_object_id(&machine_id, &spec_nic.name);
            match self.nics.get(&nic_id).await {
                Ok(nic) => {
                    all_nics_deleted = false;
                    self.unpin_nic(&nic).await?;
                    ignore_not_found(self.nics.delete(&nic_id).await)
                        .context(error::NicStoreSnafu)?;
                }
                Err(e) if e.is_not_found() => {}
                Err(source) => return Err(ReconcileError::NicStore { source }),
            }
        }
        if !all_nics_deleted {
            debug!(machine_id = %machine_id, "waiting for network interfaces to be released");
            return Ok(());
        }

        for volume in &machine.spec.volumes {
            let plugin = self
                .volume_plugins
                .find_by_spec(volume)
                .context(error::VolumeSnafu { name: volume.name.clone() })?;
            plugin
                .delete(&machine_id, &volume.connection.handle)
                .await
                .context(error::VolumeSnafu { name: volume.name.clone() })?;
        }

        let machine_dir = self.paths.machine_dir(&machine_id);
        match tokio::fs::remove_dir_all(&machine_dir).await {
            Ok(()) => debug!(machine_id = %machine_id, "removed machine directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ReconcileError::Io { path: machine_dir, source }),
        }

        let mut machine = machine;
        machine.metadata.remove_finalizer(MACHINE_FINALIZER);
        ignore_not_found(self.machines.update(machine).await).context(error::StoreSnafu)?;

        info!(machine_id = %machine_id, "machine deleted");
        Ok(())
    }

    async fn machine_is_running(&self, machine_id: &str) -> Result<bool> {
        match self.vmm.vm_info(machine_id).await {
            Ok(vm) => Ok(vm.state == VmState::Running),
            Err(VmmError::NotFound { .. }) | Err(VmmError::VmNotCreated) => Ok(false),
            Err(source) => Err(ReconcileError::Vmm { source }),
        }
    }

    /// Add the machine finalizer to a NIC object, persisting before return.
    async fn pin_nic(&self, nic: &NetworkInterface) -> Result<()> {
        if nic.metadata.has_finalizer(MACHINE_FINALIZER) {
            return Ok(());
        }
        let mut fresh = match self.nics.get(&nic.metadata.id).await {
            Ok(fresh) => fresh,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(source) => return Err(ReconcileError::NicStore { source }),
        };
        if fresh.metadata.add_finalizer(MACHINE_FINALIZER) {
            self.nics.update(fresh).await.context(error::NicStoreSnafu)?;
        }
        Ok(())
    }

    async fn unpin_nic(&self, nic: &NetworkInterface) -> Result<()> {
        let mut fresh = match self.nics.get(&nic.metadata.id).await {
            Ok(fresh) => fresh,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(source) => return Err(ReconcileError::NicStore { source }),
        };
        if fresh.metadata.remove_finalizer(MACHINE_FINALIZER) {
            self.nics.update(fresh).await.context(error::NicStoreSnafu)?;
        }
        Ok(())
    }
}

fn nics_ready(nics: &HashMap<String, NetworkInterface>) -> bool {
    nics.values().all(|nic| {
        nic.metadata.deleted_at.is_some() || nic.status.state == NicState::Attached
    })
}

fn volume_status(statuses: &[VolumeStatus], name: &str) -> VolumeStatus {
    statuses
        .iter()
        .find(|s| s.name == name)
        .cloned()
        .unwrap_or_else(|| VolumeStatus::pending(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::NetworkInterfaceStatus;

    fn nic(state: NicState, deleted: bool) -> NetworkInterface {
        let mut metadata = Metadata::new(nic_object_id("m-1", "eth0"));
        if deleted {
            metadata.deleted_at = Some(chrono::Utc::now());
        }
        NetworkInterface {
            metadata,
            spec: Default::default(),
            status: NetworkInterfaceStatus { state, handle: None, mac_address: None },
        }
    }

    #[test]
    fn nics_ready_ignores_deleted() {
        let mut nics = HashMap::new();
        nics.insert("eth0".to_string(), nic(NicState::Pending, true));
        assert!(nics_ready(&nics));

        nics.insert("eth1".to_string(), nic(NicState::Pending, false));
        assert!(!nics_ready(&nics));

        nics.insert("eth1".to_string(), nic(NicState::Attached, false));
        assert!(nics_ready(&nics));
    }

    #[test]
    fn volume_status_defaults_to_pending() {
        let known = vec![VolumeStatus {
            name: "data".into(),
            handle: "vol-1".into(),
            state: VolumeState::Prepared,
            access: None,
        }];
        assert_eq!(volume_status(&known, "data").state, VolumeState::Prepared);
        assert_eq!(volume_status(&known, "other").state, VolumeState::Pending);
    }
}
