//! Incus/LXD hypervisor client
//!
//! An idempotent resource client over the Incus REST API. Every mutating
//! call is safe to repeat on each reconcile: creates are skipped when the
//! instance already exists, deletes treat "not found" as success, and every
//! state transition is followed by an operation wait.

pub mod exec;
pub mod extensions;
pub mod http;
pub mod instance;
pub mod network;
pub mod profile;
pub mod simplestreams;
pub mod types;

use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use reqwest::{Certificate, Identity};
use tracing::debug;

use crate::crd::MachineRole;
use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Timeout for creating and starting the load balancer instance.
pub const LOAD_BALANCER_CREATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for stopping and deleting the load balancer instance.
pub const LOAD_BALANCER_DELETE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for updating load balancer configuration and reloading.
pub const LOAD_BALANCER_RECONFIGURE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for creating and starting an instance.
pub const INSTANCE_CREATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for stopping and deleting an instance.
pub const INSTANCE_DELETE_TIMEOUT: Duration = Duration::from_secs(30);

/// Config key that tracks the cluster name on an instance.
pub const CONFIG_CLUSTER_NAME_KEY: &str = "user.cluster-name";

/// Config key that tracks the cluster namespace on an instance.
pub const CONFIG_CLUSTER_NAMESPACE_KEY: &str = "user.cluster-namespace";

/// Config key that tracks the instance role.
pub const CONFIG_INSTANCE_ROLE_KEY: &str = "user.cluster-role";

/// Config key that seeds cloud-init configuration into the instance.
pub const CONFIG_CLOUD_INIT_KEY: &str = "cloud-init.user-data";

// =============================================================================
// Instance role
// =============================================================================

/// Role tag attached to every instance this operator creates. The three tag
/// keys above are the sole discovery index for related instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRole {
    ControlPlane,
    Worker,
    LoadBalancer,
}

impl std::fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceRole::ControlPlane => write!(f, "control-plane"),
            InstanceRole::Worker => write!(f, "worker"),
            InstanceRole::LoadBalancer => write!(f, "loadbalancer"),
        }
    }
}

impl From<MachineRole> for InstanceRole {
    fn from(role: MachineRole) -> Self {
        match role {
            MachineRole::ControlPlane => InstanceRole::ControlPlane,
            MachineRole::Worker => InstanceRole::Worker,
        }
    }
}

// =============================================================================
// Connection options
// =============================================================================

/// Options for connecting to the Incus/LXD server, as read from the
/// credentials secret.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    /// Server URL, e.g. "https://10.0.0.49:8443"
    pub server_url: String,
    /// Project to scope all requests to
    pub project: String,
    /// Client certificate (PEM)
    pub client_crt: String,
    /// Client key (PEM)
    pub client_key: String,
    /// Server certificate to trust (PEM)
    pub server_crt: String,
    /// Skip server certificate verification
    pub insecure_skip_verify: bool,
}

impl ConnectionOptions {
    /// Derive connection options from a credentials secret.
    ///
    /// The secret can be created like this:
    ///
    /// ```bash
    /// incus remote generate-certificate
    /// sudo incus config trust add-certificate ~/.config/incus/client.crt
    ///
    /// kubectl create secret generic incus-secret \
    ///     --from-literal=server="https://10.0.0.49:8443" \
    ///     --from-literal=server-crt="$(sudo cat /var/lib/incus/cluster.crt)" \
    ///     --from-literal=client-crt="$(cat ~/.config/incus/client.crt)" \
    ///     --from-literal=client-key="$(cat ~/.config/incus/client.key)" \
    ///     --from-literal=project="default"
    /// ```
    pub fn from_secret(secret: &Secret) -> Self {
        let value = |key: &str| -> String {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .unwrap_or_default()
        };

        Self {
            server_url: value("server"),
            project: value("project"),
            client_crt: value("client-crt"),
            client_key: value("client-key"),
            server_crt: value("server-crt"),
            insecure_skip_verify: value("insecure-skip-verify").trim().parse().unwrap_or(false),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Client for the Incus/LXD REST API
#[derive(Debug, Clone)]
pub struct Client {
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) project: String,
}

impl Client {
    /// Build a client from connection options. The client authenticates with
    /// the trusted client certificate from the credentials secret.
    pub fn new(options: &ConnectionOptions) -> Result<Self> {
        if options.server_url.is_empty() {
            return Err(Error::Configuration(
                "credentials secret has no server URL".into(),
            ));
        }

        let identity_pem = format!("{}\n{}", options.client_crt, options.client_key);
        let identity = Identity::from_pem(identity_pem.as_bytes())?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .connect_timeout(Duration::from_secs(10));

        if options.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        } else if !options.server_crt.is_empty() {
            builder = builder.add_root_certificate(Certificate::from_pem(
                options.server_crt.as_bytes(),
            )?);
        }

        debug!(
            "Initialized Incus client for {} (project: {})",
            options.server_url,
            if options.project.is_empty() { "default" } else { &options.project }
        );

        Ok(Self {
            http: builder.build()?,
            base_url: options.server_url.trim_end_matches('/').to_string(),
            project: options.project.clone(),
        })
    }
}

/// Run a hypervisor interaction under one of the fixed per-call deadlines.
/// Expiry is a retriable timeout, never a hung worker.
pub async fn with_timeout<T>(
    duration: Duration,
    what: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::WaitTimeout(what.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_instance_role_display() {
        assert_eq!(InstanceRole::ControlPlane.to_string(), "control-plane");
        assert_eq!(InstanceRole::Worker.to_string(), "worker");
        assert_eq!(InstanceRole::LoadBalancer.to_string(), "loadbalancer");
    }

    #[test]
    fn test_connection_options_from_secret() {
        let mut data = BTreeMap::new();
        data.insert(
            "server".to_string(),
            k8s_openapi::ByteString(b"https://10.0.0.49:8443".to_vec()),
        );
        data.insert(
            "project".to_string(),
            k8s_openapi::ByteString(b"default".to_vec()),
        );
        data.insert(
            "insecure-skip-verify".to_string(),
            k8s_openapi::ByteString(b"true".to_vec()),
        );
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };

        let options = ConnectionOptions::from_secret(&secret);
        assert_eq!(options.server_url, "https://10.0.0.49:8443");
        assert_eq!(options.project, "default");
        assert!(options.insecure_skip_verify);
        assert!(options.client_crt.is_empty());
    }

    #[test]
    fn test_connection_options_bad_bool_defaults_false() {
        let mut data = BTreeMap::new();
        data.insert(
            "insecure-skip-verify".to_string(),
            k8s_openapi::ByteString(b"not-a-bool".to_vec()),
        );
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };

        assert!(!ConnectionOptions::from_secret(&secret).insecure_skip_verify);
    }
}
