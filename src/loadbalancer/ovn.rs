//! Network load balancer on an OVN network

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{discover_backends, load_balancer_tags, LoadBalancerManager, CONTROL_PLANE_PORT};
use crate::error::{Error, Result};
use crate::incus::types::{
    NetworkLoadBalancerBackend, NetworkLoadBalancerPort, NetworkLoadBalancerPut,
    NetworkLoadBalancersPost,
};
use crate::incus::{
    with_timeout, Client, CONFIG_CLUSTER_NAMESPACE_KEY, CONFIG_CLUSTER_NAME_KEY,
    LOAD_BALANCER_CREATE_TIMEOUT, LOAD_BALANCER_DELETE_TIMEOUT, LOAD_BALANCER_RECONFIGURE_TIMEOUT,
};

/// Load balancer implemented as a hypervisor network load balancer. Requires
/// an OVN network and the network_load_balancer server extensions. The listen
/// address comes from the cluster's control plane endpoint.
pub struct OvnLoadBalancer {
    pub client: Arc<Client>,
    pub cluster_name: String,
    pub cluster_namespace: String,
    pub network_name: String,
    pub listen_address: String,
}

impl OvnLoadBalancer {
    fn owned_by_cluster(&self, config: &std::collections::BTreeMap<String, String>) -> bool {
        config.get(CONFIG_CLUSTER_NAME_KEY) == Some(&self.cluster_name)
            && config.get(CONFIG_CLUSTER_NAMESPACE_KEY) == Some(&self.cluster_namespace)
    }
}

#[async_trait]
impl LoadBalancerManager for OvnLoadBalancer {
    async fn create(&self) -> Result<Vec<String>> {
        with_timeout(LOAD_BALANCER_CREATE_TIMEOUT, "load balancer creation", async {
            if self.network_name.is_empty() {
                return Err(Error::LoadBalancerInvalid(
                    "network load balancer cannot be provisioned without a network name"
                        .to_string(),
                ));
            }

            self.client.supports_network_load_balancer().await?;

            // A missing or misconfigured network is not going to appear by
            // itself; the cluster administrator owns it.
            if let Err(e) = self.client.get_network(&self.network_name).await {
                return Err(Error::LoadBalancerInvalid(format!(
                    "failed to check network {:?}: {e}",
                    self.network_name
                )));
            }

            match self
                .client
                .get_network_load_balancer(&self.network_name, &self.listen_address)
                .await
            {
                Ok(lb) => {
                    if !self.owned_by_cluster(&lb.config) {
                        return Err(Error::LoadBalancerConflict(format!(
                            "a load balancer with address {} already exists without the required \
                             {}={} and {}={} keys",
                            self.listen_address,
                            CONFIG_CLUSTER_NAME_KEY,
                            self.cluster_name,
                            CONFIG_CLUSTER_NAMESPACE_KEY,
                            self.cluster_namespace,
                        )));
                    }
                    debug!("Network load balancer {} already exists", self.listen_address);
                    return Ok(vec![self.listen_address.clone()]);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }

            info!(
                "Creating network load balancer {} on network {}",
                self.listen_address, self.network_name
            );
            self.client
                .create_network_load_balancer(
                    &self.network_name,
                    &NetworkLoadBalancersPost {
                        listen_address: self.listen_address.clone(),
                        put: NetworkLoadBalancerPut {
                            config: load_balancer_tags(&self.cluster_name, &self.cluster_namespace),
                            ..Default::default()
                        },
                    },
                )
                .await?;

            Ok(vec![self.listen_address.clone()])
        })
        .await
    }

    async fn delete(&self) -> Result<()> {
        with_timeout(LOAD_BALANCER_DELETE_TIMEOUT, "load balancer deletion", async {
            self.client
                .delete_network_load_balancer(&self.network_name, &self.listen_address)
                .await
        })
        .await
    }

    async fn reconfigure(&self) -> Result<()> {
        with_timeout(
            LOAD_BALANCER_RECONFIGURE_TIMEOUT,
            "load balancer reconfiguration",
            async {
                let config =
                    discover_backends(&self.client, &self.cluster_name, &self.cluster_namespace)
                        .await?;

                info!(
                    "Updating network load balancer {} ({} backends)",
                    self.listen_address,
                    config.servers.len()
                );

                let mut tags = load_balancer_tags(&self.cluster_name, &self.cluster_namespace);
                tags.insert("healthcheck".to_string(), "true".to_string());
                tags.insert("healthcheck.interval".to_string(), "5".to_string());
                tags.insert("healthcheck.timeout".to_string(), "5".to_string());
                tags.insert("healthcheck.failure_count".to_string(), "3".to_string());
                tags.insert("healthcheck.success_count".to_string(), "2".to_string());

                let mut balancer = NetworkLoadBalancerPut {
                    config: tags,
                    backends: Vec::with_capacity(config.servers.len()),
                    ports: vec![NetworkLoadBalancerPort {
                        listen_port: config.frontend_port.clone(),
                        protocol: "tcp".to_string(),
                        target_backend: Vec::with_capacity(config.servers.len()),
                    }],
                };
                for (name, server) in &config.servers {
                    balancer.backends.push(NetworkLoadBalancerBackend {
                        name: name.clone(),
                        target_address: server.address.clone(),
                        target_port: config.backend_port.clone(),
                    });
                    balancer.ports[0].target_backend.push(name.clone());
                }

                self.client
                    .update_network_load_balancer(
                        &self.network_name,
                        &self.listen_address,
                        &balancer,
                    )
                    .await
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_plane_port_constant() {
        assert_eq!(CONTROL_PLANE_PORT, "6443");
    }
}
