//! Server capability probing

use super::types::ServerInfo;
use super::Client;
use crate::error::{Error, Result};

/// The subset of `wanted` that the server does not support.
pub(crate) fn missing_extensions(supported: &[String], wanted: &[&str]) -> Vec<String> {
    wanted
        .iter()
        .filter(|extension| !supported.iter().any(|s| s == *extension))
        .map(|extension| extension.to_string())
        .collect()
}

impl Client {
    /// Fetch server metadata.
    pub async fn get_server(&self) -> Result<ServerInfo> {
        self.api_get("/1.0", &[], "GetServer").await
    }

    /// Return the subset of the given extensions that the server does NOT
    /// support. Server metadata is re-fetched on every call; a cached
    /// "has extension" answer cannot be trusted across reconnects.
    pub async fn server_supports_extensions(&self, wanted: &[&str]) -> Result<Vec<String>> {
        let server = self.get_server().await?;
        Ok(missing_extensions(&server.api_extensions, wanted))
    }

    /// Check that the server can create OCI containers.
    pub async fn supports_instance_oci(&self) -> Result<()> {
        let unsupported = self.server_supports_extensions(&["instance_oci"]).await?;
        if !unsupported.is_empty() {
            return Err(Error::MissingExtensions(unsupported));
        }
        Ok(())
    }

    /// Check that the server can create network load balancers with health
    /// checks.
    pub async fn supports_network_load_balancer(&self) -> Result<()> {
        let unsupported = self
            .server_supports_extensions(&[
                "network_load_balancer",
                "network_load_balancer_health_check",
            ])
            .await?;
        if !unsupported.is_empty() {
            return Err(Error::MissingExtensions(unsupported));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supported(extensions: &[&str]) -> Vec<String> {
        extensions.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_missing_extensions() {
        assert!(missing_extensions(&[], &[]).is_empty());
        assert!(missing_extensions(&supported(&["instance_a", "instance_b"]), &[]).is_empty());

        assert!(missing_extensions(
            &supported(&["instance_oci", "instance_a"]),
            &["instance_oci"]
        )
        .is_empty());

        assert_eq!(
            missing_extensions(
                &supported(&["network_load_balancer", "instance_a"]),
                &["network_load_balancer", "network_load_balancer_health_check"]
            ),
            vec!["network_load_balancer_health_check".to_string()]
        );

        assert_eq!(
            missing_extensions(
                &supported(&["instance_oci"]),
                &["network_load_balancer", "network_load_balancer_health_check"]
            ),
            vec![
                "network_load_balancer".to_string(),
                "network_load_balancer_health_check".to_string()
            ]
        );
    }
}
