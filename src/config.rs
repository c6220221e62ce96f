//! Operator configuration
//!
//! All process-wide defaults live in one immutable [`OperatorConfig`] value
//! constructed at startup and passed by reference into the reconcilers.

use crate::crd::ImageSource;
use crate::error::{Error, Result};
use crate::incus::types::ProfilePut;

/// Default simplestreams catalog serving kubeadm node images.
pub const DEFAULT_SIMPLESTREAMS_SERVER: &str = "https://d14dnvi2l3tc5t.cloudfront.net";

/// Profile applied to kubeadm container machines. Containers need to be
/// privileged with the cgroup/proc mounts and kernel modules kubeadm and the
/// container runtime expect.
const KUBEADM_PROFILE_YAML: &str = r#"
description: Privileged profile for kubeadm cluster nodes
config:
  linux.kernel_modules: ip_tables,ip6_tables,nf_nat,overlay,br_netfilter
  raw.lxc: |
    lxc.apparmor.profile=unconfined
    lxc.mount.auto=proc:rw sys:rw cgroup:rw
    lxc.cgroup.devices.allow=a
    lxc.cap.drop=
  security.nesting: "true"
  security.privileged: "true"
devices:
  kmsg:
    path: /dev/kmsg
    source: /dev/kmsg
    type: unix-char
"#;

/// Immutable process-wide configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// The shared kubeadm profile document
    pub kubeadm_profile: ProfilePut,
    /// Catalog server for version-derived kubeadm images
    pub simplestreams_server: String,
    /// Default image for the "lxc" load balancer variant
    pub lxc_haproxy_image: ImageSource,
    /// Default image for the "oci" load balancer variant
    pub oci_haproxy_image: ImageSource,
}

impl OperatorConfig {
    pub fn new() -> Result<Self> {
        let kubeadm_profile: ProfilePut = serde_yaml::from_str(KUBEADM_PROFILE_YAML)
            .map_err(|e| Error::Configuration(format!("invalid kubeadm profile document: {e}")))?;

        Ok(Self {
            kubeadm_profile,
            simplestreams_server: DEFAULT_SIMPLESTREAMS_SERVER.to_string(),
            lxc_haproxy_image: ImageSource {
                name: "haproxy".to_string(),
                server: DEFAULT_SIMPLESTREAMS_SERVER.to_string(),
                protocol: "simplestreams".to_string(),
                ..Default::default()
            },
            oci_haproxy_image: ImageSource {
                name: "kindest/haproxy:v20230606-42a2262b".to_string(),
                server: "https://docker.io".to_string(),
                protocol: "oci".to_string(),
                ..Default::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kubeadm_profile_parses() {
        let config = OperatorConfig::new().unwrap();
        assert_eq!(
            config.kubeadm_profile.config.get("security.privileged"),
            Some(&"true".to_string())
        );
        assert!(config.kubeadm_profile.devices.contains_key("kmsg"));
    }

    #[test]
    fn test_default_images() {
        let config = OperatorConfig::new().unwrap();
        assert_eq!(config.lxc_haproxy_image.protocol, "simplestreams");
        assert_eq!(config.oci_haproxy_image.protocol, "oci");
    }
}
