//! chv-provider daemon entry point.
//!
//! Wires the stores, image cache, plugins, VMM manager, reconcilers and the
//! Machine Runtime gRPC server together, then runs until SIGINT/SIGTERM.
//! With `--detach-vms` (the default) child cloud-hypervisor processes are
//! not killed on shutdown; a restarted daemon recovers them through socket
//! probing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chv_provider::config::ProviderConfig;
use chv_provider::events::EventRecorder;
use chv_provider::host::Paths;
use chv_provider::image::CommandPuller;
use chv_provider::image::ImageCache;
use chv_provider::machine_class::MachineClassRegistry;
use chv_provider::nic::isolated::IsolatedNicPlugin;
use chv_provider::nic::NicReconciler;
use chv_provider::reconciler::MachineReconciler;
use chv_provider::server;
use chv_provider::server::MachineRuntimeService;
use chv_provider::store::HostStore;
use chv_provider::vmm::VmmManager;
use chv_provider::volume::ceph::CephPlugin;
use chv_provider::volume::localdisk::LocalDiskPlugin;
use chv_provider::volume::VolumePluginManager;

const EVENT_TTL: Duration = Duration::from_secs(5 * 60);
const EVENTS_PER_MACHINE: usize = 100;
const NIC_WORKERS: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "chv-provider")]
struct Args {
    /// Unix socket address the Machine Runtime server listens on.
    #[arg(long, default_value = "/var/run/machine-runtime.sock")]
    address: PathBuf,

    /// Directory where the provider manages its content.
    #[arg(long)]
    provider_root_dir: Option<PathBuf>,

    /// Path to the cloud-hypervisor binary.
    #[arg(long, default_value = "cloud-hypervisor")]
    cloud_hypervisor_bin: PathBuf,

    /// Firmware payload for created VMs.
    #[arg(long)]
    firmware_path: Option<PathBuf>,

    /// Path to the qemu-storage-daemon binary used for ceph volumes.
    #[arg(long, default_value = "qemu-storage-daemon")]
    qemu_storage_daemon_bin: PathBuf,

    /// External image fetch command, invoked as `<bin> <ref> <dest-dir>`.
    #[arg(long)]
    image_puller_bin: Option<PathBuf>,

    /// JSON file with the supported machine classes.
    #[arg(long)]
    machine_classes_file: Option<PathBuf>,

    /// Detach VM processes from the daemon so they survive restarts.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    detach_vms: bool,

    /// Reconciler worker count.
    #[arg(long, default_value_t = chv_provider::reconciler::DEFAULT_WORKERS)]
    workers: usize,
}

impl Args {
    fn into_config(self) -> ProviderConfig {
        let defaults = ProviderConfig::default();
        ProviderConfig {
            address: self.address,
            root_dir: self.provider_root_dir.unwrap_or(defaults.root_dir),
            cloud_hypervisor_bin: self.cloud_hypervisor_bin,
            firmware_path: self.firmware_path,
            qemu_storage_daemon_bin: self.qemu_storage_daemon_bin,
            image_puller_bin: self.image_puller_bin,
            machine_classes_file: self.machine_classes_file,
            detach_vms: self.detach_vms,
            workers: self.workers,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Args::parse().into_config();
    if let Err(reason) = config.validate() {
        anyhow::bail!("invalid configuration: {reason}");
    }

    info!(root = %config.root_dir.display(), "starting chv-provider");
    run(config).await
}

async fn run(config: ProviderConfig) -> Result<()> {
    let paths = Paths::new(&config.root_dir);
    paths.ensure_base().await.context("failed to initialize provider root")?;

    let machine_classes = Arc::new(match &config.machine_classes_file {
        Some(file) => MachineClassRegistry::from_file(file)
            .context("failed to load machine classes")?,
        None => MachineClassRegistry::default(),
    });

    let machines = Arc::new(
        HostStore::open(paths.machine_store_dir())
            .await
            .context("failed to open machine store")?,
    );
    let nics = Arc::new(
        HostStore::open(paths.nic_store_dir())
            .await
            .context("failed to open network interface store")?,
    );

    let image_cache = ImageCache::new(
        paths.images_dir(),
        Arc::new(CommandPuller::new(config.image_puller_bin.clone())),
    );

    let mut volume_plugins = VolumePluginManager::new();
    volume_plugins.register(Arc::new(CephPlugin::new(
        paths.clone(),
        &config.qemu_storage_daemon_bin,
        config.detach_vms,
    )));
    volume_plugins.register(Arc::new(LocalDiskPlugin));
    let volume_plugins = Arc::new(volume_plugins);

    let vmm = Arc::new(VmmManager::new(
        paths.clone(),
        &config.cloud_hypervisor_bin,
        config.firmware_path.clone(),
        config.detach_vms,
    ));

    let recorder = EventRecorder::new(EVENT_TTL, EVENTS_PER_MACHINE);

    let machine_reconciler = Arc::new(MachineReconciler::new(
        machines.clone(),
        nics.clone(),
        vmm,
        volume_plugins,
        image_cache,
        recorder.clone(),
        paths.clone(),
        config.workers,
    ));
    let nic_reconciler = Arc::new(NicReconciler::new(
        nics,
        Arc::new(IsolatedNicPlugin::new(paths)),
        NIC_WORKERS,
    ));

    let token = CancellationToken::new();
    let mut tasks = JoinSet::new();

    {
        let token = token.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => {
                    info!("shutdown signal received");
                    token.cancel();
                }
                // A failed component cancels the token; don't outlive it.
                _ = token.cancelled() => {}
            }
            Ok(())
        });
    }

    {
        let token = token.clone();
        tasks.spawn(async move {
            machine_reconciler.start(token).await;
            Ok(())
        });
    }

    {
        let token = token.clone();
        tasks.spawn(async move {
            nic_reconciler.start(token).await;
            Ok(())
        });
    }

    {
        let recorder = recorder.clone();
        let token = token.clone();
        tasks.spawn(async move {
            recorder.run_gc(token).await;
            Ok(())
        });
    }

    {
        let service = MachineRuntimeService::new(machines, machine_classes, recorder);
        let address = config.address.clone();
        let token = token.clone();
        tasks.spawn(async move { server::serve(service, &address, token).await });
    }

    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "component failed");
                failure.get_or_insert(e);
                token.cancel();
            }
            Err(e) => {
                error!(error = %e, "component panicked");
                token.cancel();
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => {
            info!("shutdown complete");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
