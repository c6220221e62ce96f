//! Network and network load balancer operations

use reqwest::Method;
use tracing::debug;

use super::types::{Network, NetworkLoadBalancer, NetworkLoadBalancerPut, NetworkLoadBalancersPost};
use super::Client;
use crate::error::Result;

impl Client {
    pub async fn get_network(&self, name: &str) -> Result<Network> {
        self.api_get(&format!("/1.0/networks/{name}"), &[], "GetNetwork")
            .await
    }

    pub async fn get_network_load_balancer(
        &self,
        network: &str,
        listen_address: &str,
    ) -> Result<NetworkLoadBalancer> {
        self.api_get(
            &format!("/1.0/networks/{network}/load-balancers/{listen_address}"),
            &[],
            "GetNetworkLoadBalancer",
        )
        .await
    }

    pub async fn create_network_load_balancer(
        &self,
        network: &str,
        balancer: &NetworkLoadBalancersPost,
    ) -> Result<()> {
        debug!(
            "Creating network load balancer {} on network {network}",
            balancer.listen_address
        );
        self.call(
            Method::POST,
            &format!("/1.0/networks/{network}/load-balancers"),
            &[],
            Some(serde_json::to_value(balancer)?),
            "CreateNetworkLoadBalancer",
        )
        .await?;
        Ok(())
    }

    pub async fn update_network_load_balancer(
        &self,
        network: &str,
        listen_address: &str,
        balancer: &NetworkLoadBalancerPut,
    ) -> Result<()> {
        debug!("Updating network load balancer {listen_address} on network {network}");
        self.call(
            Method::PUT,
            &format!("/1.0/networks/{network}/load-balancers/{listen_address}"),
            &[],
            Some(serde_json::to_value(balancer)?),
            "UpdateNetworkLoadBalancer",
        )
        .await?;
        Ok(())
    }

    /// Delete a network load balancer; absence is success.
    pub async fn delete_network_load_balancer(
        &self,
        network: &str,
        listen_address: &str,
    ) -> Result<()> {
        debug!("Deleting network load balancer {listen_address} on network {network}");
        match self
            .call(
                Method::DELETE,
                &format!("/1.0/networks/{network}/load-balancers/{listen_address}"),
                &[],
                None,
                "DeleteNetworkLoadBalancer",
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
