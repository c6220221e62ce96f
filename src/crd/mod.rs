//! Custom Resource Definitions for the Incus cluster operator
//!
//! This module contains all CRD types:
//! - IncusCluster: cluster infrastructure (load balancer, shared profile, endpoint)
//! - IncusMachine: one hypervisor instance backing a cluster node

pub mod cluster;
pub mod conditions;
pub mod machine;

pub use cluster::*;
pub use conditions::*;
pub use machine::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;
