//! IncusMachine CRD
//!
//! One IncusMachine maps to exactly one hypervisor instance (container or
//! virtual machine). The instance name always equals the resource name.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::conditions::Condition;

/// Finalizer placed on IncusMachine objects before any instance is created.
pub const MACHINE_FINALIZER: &str = "incusmachine.infrastructure.incus.dev";

// =============================================================================
// IncusMachine CRD
// =============================================================================

/// IncusMachine provisions a single hypervisor instance backing one
/// Kubernetes node of the workload cluster.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.incus.dev",
    version = "v1alpha1",
    kind = "IncusMachine",
    plural = "incusmachines",
    shortname = "im",
    status = "IncusMachineStatus",
    printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.clusterName"}"#,
    printcolumn = r#"{"name": "Role", "type": "string", "jsonPath": ".spec.role"}"#,
    printcolumn = r#"{"name": "ProviderID", "type": "string", "jsonPath": ".spec.providerID"}"#,
    printcolumn = r#"{"name": "Ready", "type": "boolean", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IncusMachineSpec {
    /// Name of the IncusCluster this machine belongs to
    pub cluster_name: String,

    /// Role of the machine within the cluster
    #[serde(default)]
    pub role: MachineRole,

    /// ProviderID in `incus:///<instance>` format, set after provisioning
    #[serde(default, rename = "providerID")]
    pub provider_id: Option<String>,

    /// Type of instance to create
    #[serde(default)]
    pub instance_type: InstanceKind,

    /// Instance size (e.g. t3.micro, or c2-m4)
    #[serde(default)]
    pub flavor: String,

    /// Profiles to attach to the instance
    #[serde(default)]
    pub profiles: Vec<String>,

    /// Image to provision the machine from. If empty, a kubeadm image for
    /// the requested Kubernetes version is resolved from the default catalog.
    #[serde(default)]
    pub image: ImageSource,

    /// Kubernetes version used to derive a catalog image when no image
    /// source is set (e.g. "v1.31.0")
    #[serde(default)]
    pub kubernetes_version: Option<String>,

    /// Bootstrap configuration for the machine
    #[serde(default)]
    pub bootstrap: MachineBootstrap,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Machine role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum MachineRole {
    ControlPlane,
    #[default]
    Worker,
}

impl std::fmt::Display for MachineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineRole::ControlPlane => write!(f, "control-plane"),
            MachineRole::Worker => write!(f, "worker"),
        }
    }
}

/// Kind of hypervisor instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceKind {
    #[default]
    Container,
    VirtualMachine,
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceKind::Container => write!(f, "container"),
            InstanceKind::VirtualMachine => write!(f, "virtual-machine"),
        }
    }
}

/// Source of the instance image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    /// Image name or alias
    #[serde(default)]
    pub name: String,

    /// Image fingerprint
    #[serde(default)]
    pub fingerprint: String,

    /// Remote image server, e.g. "https://images.linuxcontainers.org"
    #[serde(default)]
    pub server: String,

    /// Protocol for fetching the image, e.g. "simplestreams"
    #[serde(default)]
    pub protocol: String,
}

impl ImageSource {
    pub fn is_zero(&self) -> bool {
        *self == ImageSource::default()
    }
}

/// Bootstrap configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineBootstrap {
    /// Name of the secret holding the cloud-init bootstrap data under the
    /// "value" key. Populated by the bootstrap provider.
    #[serde(default)]
    pub data_secret_name: Option<String>,
}

/// Address of a machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    pub r#type: MachineAddressType,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum MachineAddressType {
    Hostname,
    InternalIP,
    ExternalIP,
}

// =============================================================================
// Status
// =============================================================================

/// IncusMachine status
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IncusMachineStatus {
    /// Machine infrastructure is ready
    #[serde(default)]
    pub ready: bool,

    /// Set once per control plane machine after the load balancer has been
    /// reconfigured to include it; prevents duplicate reconfigure calls
    /// across reconciles.
    #[serde(default)]
    pub load_balancer_configured: bool,

    /// Addresses of the instance
    #[serde(default)]
    pub addresses: Vec<MachineAddress>,

    /// Current service state of the machine
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// =============================================================================
// Implementations
// =============================================================================

impl IncusMachine {
    /// The hypervisor instance name, always equal to the resource name.
    pub fn instance_name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// The providerID the backing Kubernetes node is expected to carry.
    pub fn expected_provider_id(&self) -> String {
        format!("incus:///{}", self.instance_name())
    }

    pub fn is_control_plane(&self) -> bool {
        self.spec.role == MachineRole::ControlPlane
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        assert_eq!(
            serde_json::to_string(&MachineRole::ControlPlane).unwrap(),
            "\"control-plane\""
        );
        assert_eq!(serde_json::to_string(&MachineRole::Worker).unwrap(), "\"worker\"");
        assert_eq!(MachineRole::ControlPlane.to_string(), "control-plane");
    }

    #[test]
    fn test_instance_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&InstanceKind::VirtualMachine).unwrap(),
            "\"virtual-machine\""
        );
        assert_eq!(InstanceKind::default(), InstanceKind::Container);
    }

    #[test]
    fn test_provider_id_wire_name() {
        let spec: IncusMachineSpec = serde_json::from_value(serde_json::json!({
            "clusterName": "c1",
            "providerID": "incus:///c1-worker-abc"
        }))
        .unwrap();
        assert_eq!(spec.provider_id.as_deref(), Some("incus:///c1-worker-abc"));
    }

    #[test]
    fn test_image_source_is_zero() {
        assert!(ImageSource::default().is_zero());
        assert!(!ImageSource {
            name: "kubeadm/v1.31.0".into(),
            ..Default::default()
        }
        .is_zero());
    }
}
