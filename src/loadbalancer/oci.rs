//! OCI-image-backed load balancer

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

const HAPROXY_CONFIG_PATH: &str = "/usr/local/etc/haproxy/haproxy.cfg";

/// Load balancer hosted in an OCI container running a minimal haproxy image.
/// Requires the "instance_oci" server extension.
pub struct OciLoadBalancer {
    pub client: Arc<Client>,
    pub cluster_name: String,
    pub cluster_namespace: String,
    pub name: String,
    pub spec: LoadBalancerInstanceSpec,
    pub default_image: ImageSource,
}

impl OciLoadBalancer {
    /// Reload haproxy inside the container.
    ///
    /// The minimal image has no service manager, and the container runtime
    /// silences signals sent to the init process from its own namespace. So:
    /// scan /proc for numeric pids and signal each of them directly.
    async fn reload_haproxy(&self) -> Result<()> {
        let entries = self.client.list_instance_files(&self.name, "/proc").await?;

        let mut command = vec!["kill".to_string(), "--signal".to_string(), "SIGUSR2".to_string()];
        command.extend(
            entries
                .into_iter()
                .filter(|entry| entry.parse::<u64>().is_ok()),
        );

        debug!("Signaling haproxy processes: {command:?}");
        let command: Vec<&str> = command.iter().map(String::as_str).collect();
        self.client.run_command(&self.name, &command).await
    }
}

#[async_trait]
impl LoadBalancerManager for OciLoadBalancer {
    async fn create(&self) -> Result<Vec<String>> {
        with_timeout(LOAD_BALANCER_CREATE_TIMEOUT, "load balancer creation", async {
            self.client.supports_instance_oci().await?;

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

                self.client.ensure_instance_running(&self.name).await?;

                self.reload_haproxy().await
            },
        )
        .await
    }
}
