//! Wire types for the Incus/LXD REST API

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Server
// =============================================================================

/// Subset of `GET /1.0` the operator cares about
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub api_extensions: Vec<String>,
    #[serde(default)]
    pub environment: ServerEnvironment,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerEnvironment {
    #[serde(default)]
    pub server: String,
}

/// The hypervisor flavor behind the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFlavor {
    Incus,
    Lxd,
    Unknown,
}

impl ServerInfo {
    pub fn flavor(&self) -> ServerFlavor {
        match self.environment.server.as_str() {
            "incus" => ServerFlavor::Incus,
            "lxd" => ServerFlavor::Lxd,
            _ => ServerFlavor::Unknown,
        }
    }
}

// =============================================================================
// Instances
// =============================================================================

/// Instance lifecycle state as reported by the hypervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Frozen,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

/// `GET /1.0/instances/{name}/state`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceState {
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub network: BTreeMap<String, InstanceNetwork>,
}

/// One network interface of an instance
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceNetwork {
    /// Interface type, e.g. "broadcast" or "loopback"
    #[serde(default, rename = "type")]
    pub interface_type: String,
    /// Matching interface name on the host (empty for CNI-managed interfaces)
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub addresses: Vec<InstanceNetworkAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceNetworkAddress {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub scope: String,
}

/// Instance entry from `GET /1.0/instances?recursion=2`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceFull {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub state: Option<InstanceState>,
}

/// `POST /1.0/instances`
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstancesPost {
    pub name: String,
    #[serde(rename = "type")]
    pub instance_kind: String,
    pub source: InstanceSource,
    /// Instance size shorthand (e.g. t3.micro, or c2-m4)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instance_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

impl From<&crate::crd::ImageSource> for InstanceSource {
    fn from(image: &crate::crd::ImageSource) -> Self {
        Self {
            source_type: "image".to_string(),
            alias: image.name.clone(),
            fingerprint: image.fingerprint.clone(),
            server: image.server.clone(),
            protocol: image.protocol.clone(),
        }
    }
}

/// `PUT /1.0/instances/{name}/state`
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatePut {
    pub action: String,
    #[serde(default)]
    pub force: bool,
}

// =============================================================================
// Profiles
// =============================================================================

/// Profile contents, shared between create and update
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ProfilePut {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
}

/// `POST /1.0/profiles`
#[derive(Debug, Clone, Serialize)]
pub struct ProfilesPost {
    pub name: String,
    #[serde(flatten)]
    pub profile: ProfilePut,
}

// =============================================================================
// Operations
// =============================================================================

/// Asynchronous operation envelope
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub metadata: Value,
}

impl Operation {
    /// Incus reports failed operations with status code 400 and the error
    /// mirrored in `err`.
    pub fn failed(&self) -> bool {
        self.status_code == 400 || !self.err.is_empty()
    }
}

// =============================================================================
// Networks and network load balancers
// =============================================================================

/// Subset of `GET /1.0/networks/{name}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub network_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkLoadBalancerBackend {
    pub name: String,
    pub target_address: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub target_port: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkLoadBalancerPort {
    pub listen_port: String,
    pub protocol: String,
    #[serde(default)]
    pub target_backend: Vec<String>,
}

/// Mutable network load balancer state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkLoadBalancerPut {
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub backends: Vec<NetworkLoadBalancerBackend>,
    #[serde(default)]
    pub ports: Vec<NetworkLoadBalancerPort>,
}

/// `POST /1.0/networks/{name}/load-balancers`
#[derive(Debug, Clone, Serialize)]
pub struct NetworkLoadBalancersPost {
    pub listen_address: String,
    #[serde(flatten)]
    pub put: NetworkLoadBalancerPut,
}

/// `GET /1.0/networks/{name}/load-balancers/{address}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkLoadBalancer {
    #[serde(default)]
    pub listen_address: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub backends: Vec<NetworkLoadBalancerBackend>,
    #[serde(default)]
    pub ports: Vec<NetworkLoadBalancerPort>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_status_unknown_for_new_values() {
        let state: InstanceState =
            serde_json::from_value(serde_json::json!({"status": "Starting", "pid": 0})).unwrap();
        assert_eq!(state.status, InstanceStatus::Unknown);

        let state: InstanceState =
            serde_json::from_value(serde_json::json!({"status": "Frozen", "pid": 42})).unwrap();
        assert_eq!(state.status, InstanceStatus::Frozen);
    }

    #[test]
    fn test_instances_post_skips_empty_fields() {
        let post = InstancesPost {
            name: "c1-control-plane-abc".to_string(),
            instance_kind: "container".to_string(),
            source: InstanceSource {
                source_type: "image".to_string(),
                alias: "kubeadm/v1.31.0".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        let value = serde_json::to_value(&post).unwrap();
        assert!(value.get("instance_type").is_none());
        assert!(value.get("profiles").is_none());
        assert_eq!(value["source"]["alias"], "kubeadm/v1.31.0");
        assert!(value["source"].get("server").is_none());
    }

    #[test]
    fn test_operation_failed() {
        assert!(Operation {
            status_code: 400,
            ..Default::default()
        }
        .failed());
        assert!(Operation {
            err: "boom".to_string(),
            ..Default::default()
        }
        .failed());
        assert!(!Operation {
            status_code: 200,
            ..Default::default()
        }
        .failed());
    }

    #[test]
    fn test_server_flavor() {
        let info = ServerInfo {
            environment: ServerEnvironment {
                server: "incus".to_string(),
            },
            ..Default::default()
        };
        assert_eq!(info.flavor(), ServerFlavor::Incus);

        let info = ServerInfo::default();
        assert_eq!(info.flavor(), ServerFlavor::Unknown);
    }
}
