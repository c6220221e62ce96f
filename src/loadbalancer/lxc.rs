//! Instance-backed load balancer with haproxy from the distribution archive

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{discover_backends, haproxy, provision_instance, LoadBalancerManager};
use crate::crd::{ImageSource, LoadBalancerInstanceSpec};
use crate::error::Result;
use crate::incus::{
    with_timeout, Client, LOAD_BALANCER_CREATE_TIMEOUT, LOAD_BALANCER_DELETE_TIMEOUT,
    LOAD_BALANCER_RECONFIGURE_TIMEOUT,
};

const HAPROXY_CONFIG_PATH: &str = "/etc/haproxy/haproxy.cfg";

/// Load balancer hosted in a plain instance with haproxy installed from apt.
/// The instance is a single point of failure; development clusters only.
pub struct LxcLoadBalancer {
    pub client: Arc<Client>,
    pub cluster_name: String,
    pub cluster_namespace: String,
    pub name: String,
    pub spec: LoadBalancerInstanceSpec,
    pub default_image: ImageSource,
}

#[async_trait]
impl LoadBalancerManager for LxcLoadBalancer {
    async fn create(&self) -> Result<Vec<String>> {
        with_timeout(LOAD_BALANCER_CREATE_TIMEOUT, "load balancer creation", async {
            provision_instance(
                &self.client,
                &self.name,
                &self.cluster_name,
                &self.cluster_namespace,
                &self.spec,
                &self.default_image,
            )
            .await
        })
        .await
    }

    async fn delete(&self) -> Result<()> {
        with_timeout(LOAD_BALANCER_DELETE_TIMEOUT, "load balancer deletion", async {
            self.client.force_remove_instance_if_exists(&self.name).await
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

                debug!(
                    "Writing haproxy config to {} ({} backends)",
                    HAPROXY_CONFIG_PATH,
                    config.servers.len()
                );
                self.client
                    .push_file(
                        &self.name,
                        HAPROXY_CONFIG_PATH,
                        haproxy::render(&config).into_bytes(),
                        "0440",
                    )
                    .await?;

                debug!("Reloading haproxy service");
                self.client
                    .run_command(&self.name, &["systemctl", "reload", "haproxy.service"])
                    .await
            },
        )
        .await
    }
}
