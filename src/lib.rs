//! Incus Cluster Operator
//!
//! A Kubernetes operator that provisions workload cluster infrastructure
//! (control plane and worker instances plus a cluster load balancer) on a
//! remote Incus/LXD server, converging IncusCluster and IncusMachine custom
//! resources toward the observed hypervisor state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Reconcilers                            │
//! │  ┌──────────────────────┐    ┌──────────────────────────┐   │
//! │  │  ClusterController   │    │    MachineController     │   │
//! │  │  profile, LB,        │    │  instance, bootstrap,    │   │
//! │  │  endpoint, deletion  │    │  LB registration, node   │   │
//! │  └──────────┬───────────┘    └────────────┬─────────────┘   │
//! ├─────────────┼─────────────────────────────┼─────────────────┤
//! │             │      Load balancer engine   │                 │
//! │  ┌──────────┴──────────────────────────┐  │                 │
//! │  │   lxc   │   oci   │  ovn  │ external│  │                 │
//! │  └──────────┬──────────────────────────┘  │                 │
//! ├─────────────┼─────────────────────────────┼─────────────────┤
//! │             │        Incus client         │                 │
//! │  instances · profiles · networks · files · exec · operations│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: the two reconciliation state machines
//! - [`loadbalancer`]: pluggable load balancer backends
//! - [`incus`]: idempotent hypervisor resource client
//! - [`cloudinit`]: bootstrap completion monitor
//! - [`cloudprovider`]: workload cluster node patching
//! - [`crd`]: custom resource definitions
//! - [`error`]: error types and terminal/retriable classification

pub mod cloudinit;
pub mod cloudprovider;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod incus;
pub mod loadbalancer;

// Re-export commonly used types
pub use cloudprovider::{NodePatcher, WorkloadNodePatcher};
pub use config::OperatorConfig;
pub use controller::{cluster::ClusterController, machine::MachineController, Context};
pub use crd::{
    IncusCluster, IncusClusterSpec, IncusClusterStatus, IncusMachine, IncusMachineSpec,
    IncusMachineStatus,
};
pub use error::{Error, ErrorAction, Result};
pub use incus::{Client as IncusClient, ConnectionOptions};
pub use loadbalancer::{LoadBalancerKind, LoadBalancerManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
