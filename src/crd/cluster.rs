//! IncusCluster CRD
//!
//! Cluster-level infrastructure: credentials for reaching the hypervisor,
//! the load balancer fronting the control plane, and the shared kubeadm
//! profile for container machines.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crd::conditions::Condition;
use crate::crd::machine::ImageSource;

/// Finalizer placed on IncusCluster objects before any remote resource is
/// created.
pub const CLUSTER_FINALIZER: &str = "incuscluster.infrastructure.incus.dev";

// =============================================================================
// IncusCluster CRD
// =============================================================================

/// IncusCluster provisions the cluster-wide infrastructure for a workload
/// cluster running on an Incus or LXD server.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "infrastructure.incus.dev",
    version = "v1alpha1",
    kind = "IncusCluster",
    plural = "incusclusters",
    shortname = "icc",
    status = "IncusClusterStatus",
    printcolumn = r#"{"name": "Endpoint", "type": "string", "jsonPath": ".spec.controlPlaneEndpoint.host"}"#,
    printcolumn = r#"{"name": "Ready", "type": "boolean", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IncusClusterSpec {
    /// Endpoint to communicate with the workload cluster control plane.
    /// Backfilled from the provisioned load balancer when unset.
    #[serde(default)]
    pub control_plane_endpoint: ControlPlaneEndpoint,

    /// Secret with credentials to access the Incus/LXD server
    pub secret_ref: SecretRef,

    /// Load balancer configuration; exactly one variant must be set
    pub load_balancer: ClusterLoadBalancer,

    /// Skip creation of the shared kubeadm profile. The cluster
    /// administrator is then responsible for creating a suitable profile
    /// and listing it on every IncusMachine. Useful for restricted projects
    /// that forbid privileged containers.
    #[serde(default)]
    pub skip_default_kubeadm_profile: bool,

    /// Skip patching workload cluster Nodes with their providerID. Requires
    /// an external cloud controller manager to take over instead.
    #[serde(default)]
    pub skip_cloud_provider_node_patch: bool,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Control plane endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneEndpoint {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

/// Reference to the credentials secret, which must live in the same
/// namespace as the IncusCluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
}

/// Load balancer configuration. The four variants are mutually exclusive;
/// exactly one must be populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterLoadBalancer {
    /// Plain instance with haproxy installed from the distribution archive.
    /// Single point of failure; development and evaluation clusters only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lxc: Option<LoadBalancerInstance>,

    /// OCI container running a minimal haproxy image.
    /// Requires server extension: "instance_oci".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<LoadBalancerInstance>,

    /// Network load balancer on an existing OVN network. The listen address
    /// must be set in `.spec.controlPlaneEndpoint.host`.
    /// Requires server extensions: "network_load_balancer",
    /// "network_load_balancer_health_check".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovn: Option<OvnLoadBalancer>,

    /// Bring-your-own load balancer (e.g. kube-vip). The address must be
    /// set in `.spec.controlPlaneEndpoint.host`; nothing is provisioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalLoadBalancer>,
}

/// Instance-backed load balancer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerInstance {
    /// Adjustments for the instance hosting the load balancer
    #[serde(default)]
    pub instance_spec: LoadBalancerInstanceSpec,
}

/// Configuration for the instance hosting the load balancer
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerInstanceSpec {
    /// Instance size (e.g. t3.micro, or c2-m4)
    #[serde(default)]
    pub flavor: String,

    /// Profiles to attach to the instance
    #[serde(default)]
    pub profiles: Vec<String>,

    /// Image for the load balancer instance. A per-variant default is used
    /// when unset.
    #[serde(default)]
    pub image: ImageSource,
}

/// OVN network load balancer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OvnLoadBalancer {
    /// Name of the OVN network to create the load balancer on
    #[serde(default)]
    pub network_name: String,
}

/// External load balancer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExternalLoadBalancer {}

// =============================================================================
// Status
// =============================================================================

/// IncusCluster status
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IncusClusterStatus {
    /// Cluster infrastructure is ready
    #[serde(default)]
    pub ready: bool,

    /// Current service state of the cluster infrastructure
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Terminal failure reason, requires operator intervention
    #[serde(default)]
    pub failure_reason: Option<String>,

    /// Terminal failure message
    #[serde(default)]
    pub failure_message: Option<String>,
}

// =============================================================================
// Implementations
// =============================================================================

impl IncusCluster {
    fn namespace_or_default(&self) -> String {
        self.metadata.namespace.clone().unwrap_or_default()
    }

    fn name_or_default(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// Instance name for the cluster load balancer. Instance names are
    /// limited to 63 characters, so the namespace is folded into a short
    /// hash instead of being spelled out.
    pub fn load_balancer_instance_name(&self) -> String {
        let hash = Sha256::digest(self.namespace_or_default().as_bytes());
        let mut hex = String::with_capacity(6);
        for byte in hash.iter().take(3) {
            hex.push_str(&format!("{byte:02x}"));
        }
        format!("{}-{}-lb", self.name_or_default(), &hex[..5])
    }

    /// Name of the shared kubeadm profile for container machines.
    pub fn profile_name(&self) -> String {
        format!("kubeadm-{}-{}", self.namespace_or_default(), self.name_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str, namespace: &str) -> IncusCluster {
        let mut cluster = IncusCluster::new(
            name,
            IncusClusterSpec {
                secret_ref: SecretRef { name: "incus-secret".into() },
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some(namespace.into());
        cluster
    }

    #[test]
    fn test_load_balancer_instance_name_is_stable() {
        let c = cluster("c1", "default");
        let name = c.load_balancer_instance_name();
        assert_eq!(name, c.load_balancer_instance_name());
        assert!(name.starts_with("c1-"));
        assert!(name.ends_with("-lb"));
        // "c1" + "-" + 5 hex chars + "-lb"
        assert_eq!(name.len(), "c1".len() + 1 + 5 + 3);
    }

    #[test]
    fn test_load_balancer_instance_name_differs_by_namespace() {
        assert_ne!(
            cluster("c1", "default").load_balancer_instance_name(),
            cluster("c1", "other").load_balancer_instance_name()
        );
    }

    #[test]
    fn test_profile_name() {
        assert_eq!(cluster("c1", "default").profile_name(), "kubeadm-default-c1");
    }

    #[test]
    fn test_load_balancer_variants_deserialize() {
        let lb: ClusterLoadBalancer = serde_json::from_value(serde_json::json!({
            "ovn": {"networkName": "ovn0"}
        }))
        .unwrap();
        assert!(lb.lxc.is_none());
        assert!(lb.oci.is_none());
        assert_eq!(lb.ovn.unwrap().network_name, "ovn0");
        assert!(lb.external.is_none());
    }
}
