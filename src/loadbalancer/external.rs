//! Bring-your-own load balancer

use async_trait::async_trait;
use tracing::debug;

use super::LoadBalancerManager;
use crate::error::{Error, Result};

/// No-op manager for clusters using an out-of-band load balancing mechanism
/// (e.g. kube-vip). The address must be supplied on the control plane
/// endpoint; nothing is provisioned, deleted or reconfigured here.
pub struct ExternalLoadBalancer {
    pub address: String,
}

#[async_trait]
impl LoadBalancerManager for ExternalLoadBalancer {
    async fn create(&self) -> Result<Vec<String>> {
        if self.address.is_empty() {
            return Err(Error::LoadBalancerInvalid(
                "using external load balancer but no address is configured".to_string(),
            ));
        }

        debug!("Using external load balancer at {}", self.address);
        Ok(vec![self.address.clone()])
    }

    async fn delete(&self) -> Result<()> {
        debug!("Using external load balancer, nothing to delete");
        Ok(())
    }

    async fn reconfigure(&self) -> Result<()> {
        debug!("Using external load balancer, nothing to reconfigure");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_address() {
        let lb = ExternalLoadBalancer {
            address: String::new(),
        };
        let err = lb.create().await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_create_returns_configured_address() {
        let lb = ExternalLoadBalancer {
            address: "10.100.0.1".to_string(),
        };
        assert_eq!(lb.create().await.unwrap(), vec!["10.100.0.1".to_string()]);
        lb.delete().await.unwrap();
        lb.reconfigure().await.unwrap();
    }
}
