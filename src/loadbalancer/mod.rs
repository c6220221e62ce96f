//! Cluster load balancer engine
//!
//! Four interchangeable backends implement one contract:
//! - [`lxc`]: plain instance with haproxy installed from the archive
//! - [`oci`]: OCI container running a minimal haproxy image
//! - [`ovn`]: network load balancer on an existing OVN network
//! - [`external`]: bring-your-own address, nothing provisioned
//!
//! Selection is a pure function of which one of the cluster's four
//! load-balancer sub-configs is populated.

pub mod external;
pub mod haproxy;
pub mod lxc;
pub mod oci;
pub mod ovn;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::OperatorConfig;
use crate::crd::{ClusterLoadBalancer, ImageSource, IncusCluster, LoadBalancerInstanceSpec};
use crate::error::{Error, Result};
use crate::incus::instance::active_machine_addresses;
use crate::incus::types::{InstanceSource, InstancesPost};
use crate::incus::{
    Client, InstanceRole, CONFIG_CLUSTER_NAMESPACE_KEY, CONFIG_CLUSTER_NAME_KEY,
    CONFIG_INSTANCE_ROLE_KEY,
};

pub use haproxy::{BackendServer, ConfigData};

/// Port the control plane listens on, and the load balancer frontend with it.
pub const CONTROL_PLANE_PORT: &str = "6443";

// =============================================================================
// Manager contract
// =============================================================================

/// Interact with the cluster load balancer.
#[async_trait]
pub trait LoadBalancerManager: Send + Sync {
    /// Provision the load balancer and return its addresses.
    ///
    /// Implementations report non-retriable failures (e.g. a missing server
    /// extension) through terminal errors; callers check `Error::is_terminal`
    /// and stop retrying.
    async fn create(&self) -> Result<Vec<String>>;

    /// Clean up any load balancer resources.
    async fn delete(&self) -> Result<()>;

    /// Update the load balancer backends from the currently running control
    /// plane instances.
    async fn reconfigure(&self) -> Result<()>;
}

// =============================================================================
// Variant selection
// =============================================================================

/// The closed set of load balancer backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancerKind {
    Lxc,
    Oci,
    Ovn,
    External,
}

/// Map the cluster load balancer configuration to its backend kind. Exactly
/// one of the four variants must be populated.
pub fn kind_for(spec: &ClusterLoadBalancer) -> Result<LoadBalancerKind> {
    let mut kinds = Vec::with_capacity(1);
    if spec.lxc.is_some() {
        kinds.push(LoadBalancerKind::Lxc);
    }
    if spec.oci.is_some() {
        kinds.push(LoadBalancerKind::Oci);
    }
    if spec.ovn.is_some() {
        kinds.push(LoadBalancerKind::Ovn);
    }
    if spec.external.is_some() {
        kinds.push(LoadBalancerKind::External);
    }

    match kinds.as_slice() {
        [kind] => Ok(*kind),
        [] => Err(Error::LoadBalancerInvalid(
            "no load balancer variant is configured".to_string(),
        )),
        _ => Err(Error::LoadBalancerInvalid(format!(
            "exactly one load balancer variant must be configured, found {}",
            kinds.len()
        ))),
    }
}

/// Build the load balancer manager for a cluster.
pub fn manager_for_cluster(
    client: Arc<Client>,
    config: &OperatorConfig,
    cluster: &IncusCluster,
) -> Result<Box<dyn LoadBalancerManager>> {
    let cluster_name = cluster.metadata.name.clone().unwrap_or_default();
    let cluster_namespace = cluster.metadata.namespace.clone().unwrap_or_default();
    let lb = &cluster.spec.load_balancer;

    match kind_for(lb)? {
        LoadBalancerKind::Lxc => Ok(Box::new(lxc::LxcLoadBalancer {
            client,
            cluster_name,
            cluster_namespace,
            name: cluster.load_balancer_instance_name(),
            spec: lb.lxc.as_ref().map(|l| l.instance_spec.clone()).unwrap_or_default(),
            default_image: config.lxc_haproxy_image.clone(),
        })),
        LoadBalancerKind::Oci => Ok(Box::new(oci::OciLoadBalancer {
            client,
            cluster_name,
            cluster_namespace,
            name: cluster.load_balancer_instance_name(),
            spec: lb.oci.as_ref().map(|l| l.instance_spec.clone()).unwrap_or_default(),
            default_image: config.oci_haproxy_image.clone(),
        })),
        LoadBalancerKind::Ovn => Ok(Box::new(ovn::OvnLoadBalancer {
            client,
            cluster_name,
            cluster_namespace,
            network_name: lb.ovn.as_ref().map(|o| o.network_name.clone()).unwrap_or_default(),
            listen_address: cluster.spec.control_plane_endpoint.host.clone(),
        })),
        LoadBalancerKind::External => Ok(Box::new(external::ExternalLoadBalancer {
            address: cluster.spec.control_plane_endpoint.host.clone(),
        })),
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// The discovery/ownership tags stamped on every load balancer resource.
pub(crate) fn load_balancer_tags(
    cluster_name: &str,
    cluster_namespace: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CONFIG_CLUSTER_NAME_KEY.to_string(), cluster_name.to_string()),
        (
            CONFIG_CLUSTER_NAMESPACE_KEY.to_string(),
            cluster_namespace.to_string(),
        ),
        (
            CONFIG_INSTANCE_ROLE_KEY.to_string(),
            InstanceRole::LoadBalancer.to_string(),
        ),
    ])
}

/// Build the backend view from the control plane instances currently carrying
/// this cluster's tags. Never cached; the instance listing is re-scanned on
/// every reconfigure.
pub(crate) async fn discover_backends(
    client: &Client,
    cluster_name: &str,
    cluster_namespace: &str,
) -> Result<ConfigData> {
    let instances = client
        .instances_with_config(&[
            (CONFIG_CLUSTER_NAME_KEY.to_string(), cluster_name.to_string()),
            (
                CONFIG_CLUSTER_NAMESPACE_KEY.to_string(),
                cluster_namespace.to_string(),
            ),
            (
                CONFIG_INSTANCE_ROLE_KEY.to_string(),
                InstanceRole::ControlPlane.to_string(),
            ),
        ])
        .await?;

    let mut config = ConfigData {
        frontend_port: CONTROL_PLANE_PORT.to_string(),
        backend_port: CONTROL_PLANE_PORT.to_string(),
        servers: BTreeMap::new(),
    };
    for instance in instances {
        let Some(state) = instance.state.as_ref() else {
            continue;
        };
        let addresses = active_machine_addresses(state);
        if let Some(address) = addresses.first() {
            config.servers.insert(
                instance.name.clone(),
                BackendServer {
                    address: address.clone(),
                    weight: 100,
                },
            );
        }
    }

    Ok(config)
}

/// Ensure the instance hosting a load balancer exists, is running and has an
/// address. Shared by the lxc and oci variants.
pub(crate) async fn provision_instance(
    client: &Client,
    name: &str,
    cluster_name: &str,
    cluster_namespace: &str,
    spec: &LoadBalancerInstanceSpec,
    default_image: &ImageSource,
) -> Result<Vec<String>> {
    let image = if spec.image.is_zero() {
        default_image
    } else {
        &spec.image
    };

    client
        .create_instance_if_not_exists(&InstancesPost {
            name: name.to_string(),
            // OCI images also run as containers
            instance_kind: "container".to_string(),
            source: InstanceSource::from(image),
            instance_type: spec.flavor.clone(),
            profiles: spec.profiles.clone(),
            config: load_balancer_tags(cluster_name, cluster_namespace),
        })
        .await?;

    client.ensure_instance_running(name).await?;
    client.wait_for_instance_address(name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LoadBalancerInstance, OvnLoadBalancer as OvnConfig};

    fn lb_with(
        lxc: bool,
        oci: bool,
        ovn: bool,
        external: bool,
    ) -> ClusterLoadBalancer {
        ClusterLoadBalancer {
            lxc: lxc.then(LoadBalancerInstance::default),
            oci: oci.then(LoadBalancerInstance::default),
            ovn: ovn.then(|| OvnConfig {
                network_name: "ovn0".to_string(),
            }),
            external: external.then(crate::crd::ExternalLoadBalancer::default),
        }
    }

    #[test]
    fn test_kind_mapping_is_total_and_deterministic() {
        assert_eq!(kind_for(&lb_with(true, false, false, false)).unwrap(), LoadBalancerKind::Lxc);
        assert_eq!(kind_for(&lb_with(false, true, false, false)).unwrap(), LoadBalancerKind::Oci);
        assert_eq!(kind_for(&lb_with(false, false, true, false)).unwrap(), LoadBalancerKind::Ovn);
        assert_eq!(
            kind_for(&lb_with(false, false, false, true)).unwrap(),
            LoadBalancerKind::External
        );
    }

    #[test]
    fn test_kind_mapping_rejects_none_and_multiple() {
        let err = kind_for(&lb_with(false, false, false, false)).unwrap_err();
        assert!(err.is_terminal());

        let err = kind_for(&lb_with(true, true, false, false)).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_load_balancer_tags() {
        let tags = load_balancer_tags("c1", "default");
        assert_eq!(tags.get(CONFIG_CLUSTER_NAME_KEY).unwrap(), "c1");
        assert_eq!(tags.get(CONFIG_CLUSTER_NAMESPACE_KEY).unwrap(), "default");
        assert_eq!(tags.get(CONFIG_INSTANCE_ROLE_KEY).unwrap(), "loadbalancer");
    }
}
