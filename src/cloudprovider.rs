//! Workload cluster node patching
//!
//! There is no external cloud-provider integration between Kubernetes and
//! Incus, so the operator fills that role for the nodes it provisions: set
//! the providerID, merge the machine addresses, and clear the uninitialized
//! taint. The machine controller talks to this through a trait so it can be
//! exercised without a workload cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeAddress, Taint};
use kube::api::{Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use crate::crd::{IncusCluster, IncusMachine, MachineAddress, MachineAddressType};
use crate::error::{Error, Result};

const UNINITIALIZED_TAINT_KEY: &str = "node.cloudprovider.kubernetes.io/uninitialized";
const UNINITIALIZED_TAINT_EFFECT: &str = "NoSchedule";

/// Patch the workload cluster Node backing a machine.
#[async_trait]
pub trait NodePatcher: Send + Sync {
    async fn patch_node(
        &self,
        cluster: &IncusCluster,
        machine: &IncusMachine,
        addresses: &[MachineAddress],
    ) -> Result<()>;
}

/// NodePatcher reaching the workload cluster through its kubeconfig secret
/// (`{cluster}-kubeconfig`, key "value").
pub struct WorkloadNodePatcher {
    pub client: kube::Client,
}

impl WorkloadNodePatcher {
    async fn workload_client(&self, cluster: &IncusCluster) -> Result<kube::Client> {
        let namespace = cluster.namespace().unwrap_or_default();
        let secret_name = format!("{}-kubeconfig", cluster.name_any());
        let secrets: Api<k8s_openapi::api::core::v1::Secret> =
            Api::namespaced(self.client.clone(), &namespace);
        let secret = secrets.get(&secret_name).await?;

        let kubeconfig = secret
            .data
            .as_ref()
            .and_then(|data| data.get("value"))
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .ok_or_else(|| Error::SecretKeyMissing {
                name: secret_name.clone(),
                key: "value".to_string(),
            })?;

        let kubeconfig = Kubeconfig::from_yaml(&kubeconfig)
            .map_err(|e| Error::Internal(format!("invalid kubeconfig in {secret_name}: {e}")))?;
        let config =
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::Internal(format!("cannot load kubeconfig from {secret_name}: {e}"))
                })?;
        Ok(kube::Client::try_from(config)?)
    }
}

fn is_uninitialized_taint(taint: &Taint) -> bool {
    taint.key == UNINITIALIZED_TAINT_KEY && taint.effect == UNINITIALIZED_TAINT_EFFECT
}

/// Merge machine InternalIP addresses into the node addresses, skipping
/// entries the kubelet already reported.
fn merged_node_addresses(node: &Node, addresses: &[MachineAddress]) -> Vec<NodeAddress> {
    let mut merged = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.clone())
        .unwrap_or_default();

    for address in addresses {
        if address.r#type != MachineAddressType::InternalIP {
            continue;
        }
        let node_address = NodeAddress {
            type_: "InternalIP".to_string(),
            address: address.address.clone(),
        };
        if !merged
            .iter()
            .any(|a| a.type_ == node_address.type_ && a.address == node_address.address)
        {
            merged.push(node_address);
        }
    }
    merged
}

#[async_trait]
impl NodePatcher for WorkloadNodePatcher {
    async fn patch_node(
        &self,
        cluster: &IncusCluster,
        machine: &IncusMachine,
        addresses: &[MachineAddress],
    ) -> Result<()> {
        let node_name = machine.instance_name();
        let provider_id = machine.expected_provider_id();

        let workload = self.workload_client(cluster).await?;
        let nodes: Api<Node> = Api::all(workload);

        // The node is expected to register under the instance name. A custom
        // hostname would break this, same as it would for the upstream
        // docker provider.
        let node = nodes.get(&node_name).await?;

        info!("Setting providerID {provider_id} on node {node_name}");
        nodes
            .patch(
                &node_name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({"spec": {"providerID": provider_id}})),
            )
            .await?;

        let taints = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default();
        let remaining: Vec<Taint> = taints
            .iter()
            .filter(|taint| !is_uninitialized_taint(taint))
            .cloned()
            .collect();
        if remaining.len() == taints.len() {
            debug!("Node {node_name} carries no cloud provider taint");
            return Ok(());
        }

        info!("Adding machine addresses and removing cloud provider taint on node {node_name}");
        nodes
            .patch_status(
                &node_name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({
                    "status": {"addresses": merged_node_addresses(&node, addresses)}
                })),
            )
            .await?;
        nodes
            .patch(
                &node_name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({"spec": {"taints": remaining}})),
            )
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeStatus;

    #[test]
    fn test_is_uninitialized_taint() {
        assert!(is_uninitialized_taint(&Taint {
            key: UNINITIALIZED_TAINT_KEY.to_string(),
            effect: UNINITIALIZED_TAINT_EFFECT.to_string(),
            ..Default::default()
        }));
        assert!(!is_uninitialized_taint(&Taint {
            key: "node.kubernetes.io/not-ready".to_string(),
            effect: UNINITIALIZED_TAINT_EFFECT.to_string(),
            ..Default::default()
        }));
    }

    #[test]
    fn test_merged_node_addresses() {
        let node = Node {
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: "10.0.0.5".to_string(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged = merged_node_addresses(
            &node,
            &[
                MachineAddress {
                    r#type: MachineAddressType::Hostname,
                    address: "c1-worker-abc".to_string(),
                },
                MachineAddress {
                    r#type: MachineAddressType::InternalIP,
                    address: "10.0.0.5".to_string(),
                },
                MachineAddress {
                    r#type: MachineAddressType::InternalIP,
                    address: "10.0.0.6".to_string(),
                },
                MachineAddress {
                    r#type: MachineAddressType::ExternalIP,
                    address: "10.0.0.6".to_string(),
                },
            ],
        );

        // existing entry kept once, hostname and external addresses ignored
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].address, "10.0.0.6");
        assert_eq!(merged[1].type_, "InternalIP");
    }
}
