//! Node-local machine provider for cloud-hypervisor micro-VMs.
//!
//! The daemon turns declarative machine objects stored on disk into running
//! cloud-hypervisor VMs and continuously reconciles observed state with
//! desired state. External orchestrators talk to it through the Machine
//! Runtime gRPC contract on a Unix socket; everything else happens in
//! per-machine reconcile loops.
//!
//! # Architecture
//!
//! ```text
//!   gRPC (Machine Runtime, UDS)          image cache pull-done events
//!            │ store writes                         │
//!            ▼                                      ▼
//!   ┌────────────────┐  watch   ┌──────────────────────────────────┐
//!   │ machine store  │────────▶ │ work queue (dedup, rate-limited) │
//!   │ nic store      │          └───────────────┬──────────────────┘
//!   └────────────────┘                          │ worker pool
//!                                               ▼
//!                              ┌────────────────────────────────┐
//!                              │ machine reconciler             │
//!                              │  image → socket → VMM → NICs   │
//!                              │  → volumes → create → power    │
//!                              │  → hot-plug → status           │
//!                              └────┬──────────────┬────────────┘
//!                                   │              │
//!                                   ▼              ▼
//!                        VMM manager          volume / NIC plugins
//!                 (cloud-hypervisor child,   (qemu-storage-daemon,
//!                  REST over api.sock)        tap handles)
//! ```

pub mod config;
pub mod events;
pub mod host;
pub mod image;
pub mod machine;
pub mod machine_class;
pub mod nic;
pub mod queue;
pub mod raw;
pub mod reconciler;
pub mod server;
pub mod store;
pub mod vmm;
pub mod volume;
