//! Network interface plugin and the NIC object reconciler.
//!
//! NICs are first-class store entities (`NIC--<machineId>--<nicName>`) so
//! their lifecycle can run in its own controller: the machine reconciler
//! creates/deletes the objects and hot-plugs devices, while this controller
//! drives each object from `Pending` to `Attached` through the plugin and
//! owns the `"networkinterface"` finalizer.
//!
//! Ordering on deletion: the machine reconciler removes the VM device and
//! strips its `"machine"` finalizer first; only then does this controller
//! release the plugin resources and strip its own finalizer, which lets the
//! store GC the object.

use std::sync::Arc;

use async_trait::async_trait;
use snafu::Snafu;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::machine::parse_nic_object_id;
use crate::machine::NetworkInterface;
use crate::machine::NetworkInterfaceStatus;
use crate::machine::NicState;
use crate::machine::NIC_FINALIZER;
use crate::queue::WorkQueue;
use crate::store::HostStore;
use crate::store::StoreError;

pub mod isolated;

#[derive(Debug, Snafu)]
#[snafu(module(error), visibility(pub(crate)))]
pub enum NicError {
    #[snafu(display("nic io on {}: {source}", path.display()))]
    Io { path: std::path::PathBuf, source: std::io::Error },

    #[snafu(display("nic object id {id:?} is not decodable"))]
    MalformedId { id: String },

    #[snafu(display("nic store: {source}"))]
    Store { source: StoreError },
}

pub type Result<T, E = NicError> = std::result::Result<T, E>;

/// What a plugin hands back for a prepared device: the handle (e.g. a tap
/// name) and, when the plugin assigns one, the MAC the VMM should use.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedNic {
    pub handle: String,
    pub mac_address: Option<String>,
}

/// A network interface driver: prepares host-side resources for a NIC and
/// releases them again.
#[async_trait]
pub trait NicPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepare the device. Idempotent.
    async fn prepare(&self, machine_id: &str, nic: &NetworkInterface) -> Result<PreparedNic>;

    /// Release whatever `prepare` set up. Idempotent.
    async fn release(&self, machine_id: &str, nic: &NetworkInterface) -> Result<()>;
}

pub struct NicReconciler {
    nics: Arc<HostStore<NetworkInterface>>,
    plugin: Arc<dyn NicPlugin>,
    queue: WorkQueue,
    workers: usize,
}

impl NicReconciler {
    pub fn new(
        nics: Arc<HostStore<NetworkInterface>>,
        plugin: Arc<dyn NicPlugin>,
        workers: usize,
    ) -> Self {
        Self { nics, plugin, queue: WorkQueue::new(), workers }
    }

    /// Run fan-in and workers until the token is cancelled.
    pub async fn start(self: Arc<Self>, token: CancellationToken) {
        let mut tasks = JoinSet::new();

        let mut watch = self.nics.watch();
        for nic in self.nics.list().await {
            self.queue.add(&nic.metadata.id);
        }

        {
            let queue = self.queue.clone();
            let nics = self.nics.clone();
            let token = token.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        event = watch.recv() => match event {
                            Ok(event) => queue.add(&event.object().metadata.id),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                                for nic in nics.list().await {
                                    queue.add(&nic.metadata.id);
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
                token.cancelled().await;
                queue.shut_down();
            });
        }

        for _ in 0..self.workers {
            let this = self.clone();
            tasks.spawn(async move {
                while let Some(id) = this.queue.get().await {
                    match this.reconcile(&id).await {
                        Ok(()) => {
                            this.queue.forget(&id);
                            this.queue.done(&id);
                        }
                        Err(e) => {
                            error!(nic_id = %id, error = %e, "failed to reconcile network interface");
                            this.queue.done(&id);
                            this.queue.add_rate_limited(&id);
                        }
                    }
                }
            });
        }

        while tasks.join_next().await.is_some() {}
        info!("NIC reconciler stopped");
    }

    /// One convergence pass for a NIC object.
    pub async fn reconcile(&self, id: &str) -> Result<()> {
        let nic = match self.nics.get(id).await {
            Ok(nic) => nic,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(source) => return Err(NicError::Store { source }),
        };

        let Some((machine_id, _)) = parse_nic_object_id(id) else {
            return error::MalformedIdSnafu { id }.fail();
        };
        let machine_id = machine_id.to_string();

        if nic.metadata.deleted_at.is_some() {
            return self.teardown(&machine_id, nic).await;
        }

        if !nic.metadata.has_finalizer(NIC_FINALIZER) {
            let mut nic = nic;
            nic.metadata.add_finalizer(NIC_FINALIZER);
            // Durable before the plugin does anything on the host.
            match self.nics.update(nic).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(source) => return Err(NicError::Store { source }),
            }
        }

        if nic.status.state != NicState::Attached {
            let prepared = self.plugin.prepare(&machine_id, &nic).await?;
            debug!(nic_id = %id, handle = %prepared.handle, "network interface prepared");

            let mut nic = nic;
            nic.status = NetworkInterfaceStatus {
                state: NicState::Attached,
                handle: Some(prepared.handle),
                mac_address: prepared.mac_address,
            };
            match self.nics.update(nic).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => return Ok(()),
                Err(source) => return Err(NicError::Store { source }),
            }
        }

        Ok(())
    }

    async fn teardown(&self, machine_id: &str, nic: NetworkInterface) -> Result<()> {
        use crate::machine::MACHINE_FINALIZER;

        if nic.metadata.has_finalizer(MACHINE_FINALIZER) {
            // The machine reconciler still has to unplug the VM device.
            debug!(nic_id = %nic.metadata.id, "waiting for machine finalizer before release");
            return Ok(());
        }

        if nic.metadata.has_finalizer(NIC_FINALIZER) {
            self.plugin.release(machine_id, &nic).await?;

            let mut nic = nic;
            nic.metadata.remove_finalizer(NIC_FINALIZER);
            match self.nics.update(nic).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(source) => return Err(NicError::Store { source }),
            }
            info!(machine_id, "network interface released");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::nic_object_id;
    use crate::machine::Metadata;
    use crate::machine::NetworkInterfaceSpec;

    struct RecordingPlugin;

    #[async_trait]
    impl NicPlugin for RecordingPlugin {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn prepare(&self, _machine_id: &str, nic: &NetworkInterface) -> Result<PreparedNic> {
            Ok(PreparedNic {
                handle: format!("tap-{}", nic.spec.name),
                mac_address: Some("02:00:00:00:00:01".into()),
            })
        }

        async fn release(&self, _machine_id: &str, _nic: &NetworkInterface) -> Result<()> {
            Ok(())
        }
    }

    fn new_nic(machine_id: &str, name: &str) -> NetworkInterface {
        NetworkInterface {
            metadata: Metadata::new(nic_object_id(machine_id, name)),
            spec: NetworkInterfaceSpec {
                name: name.into(),
                network_id: "net-1".into(),
                ..Default::default()
            },
            status: Default::default(),
        }
    }

    async fn reconciler(dir: &std::path::Path) -> NicReconciler {
        let nics = Arc::new(HostStore::open(dir).await.unwrap());
        NicReconciler::new(nics, Arc::new(RecordingPlugin), 1)
    }

    #[tokio::test]
    async fn attaches_with_finalizer_first() {
        let dir = tempfile::tempdir().unwrap();
        let r = reconciler(dir.path()).await;
        let id = nic_object_id("m-1", "eth0");
        r.nics.create(new_nic("m-1", "eth0")).await.unwrap();

        // First pass only persists the finalizer.
        r.reconcile(&id).await.unwrap();
        let nic = r.nics.get(&id).await.unwrap();
        assert!(nic.metadata.has_finalizer(NIC_FINALIZER));
        assert_eq!(nic.status.state, NicState::Pending);

        // Second pass prepares and attaches.
        r.reconcile(&id).await.unwrap();
        let nic = r.nics.get(&id).await.unwrap();
        assert_eq!(nic.status.state, NicState::Attached);
        assert_eq!(nic.status.handle.as_deref(), Some("tap-eth0"));
        assert_eq!(nic.status.mac_address.as_deref(), Some("02:00:00:00:00:01"));
    }

    #[tokio::test]
    async fn release_waits_for_machine_finalizer() {
        use crate::machine::MACHINE_FINALIZER;

        let dir = tempfile::tempdir().unwrap();
        let r = reconciler(dir.path()).await;
        let id = nic_object_id("m-1", "eth0");
        r.nics.create(new_nic("m-1", "eth0")).await.unwrap();
        r.reconcile(&id).await.unwrap();
        r.reconcile(&id).await.unwrap();

        // Machine reconciler pins the NIC while the device is plugged.
        let mut nic = r.nics.get(&id).await.unwrap();
        nic.metadata.add_finalizer(MACHINE_FINALIZER);
        r.nics.update(nic).await.unwrap();

        r.nics.delete(&id).await.unwrap();
        r.reconcile(&id).await.unwrap();
        assert!(r.nics.get(&id).await.is_ok(), "machine finalizer must block release");

        // Device unplugged: machine finalizer stripped.
        let mut nic = r.nics.get(&id).await.unwrap();
        nic.metadata.remove_finalizer(MACHINE_FINALIZER);
        r.nics.update(nic).await.unwrap();

        r.reconcile(&id).await.unwrap();
        assert!(r.nics.get(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn stale_ids_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let r = reconciler(dir.path()).await;
        r.reconcile("NIC--m-1--gone").await.unwrap();
    }
}
