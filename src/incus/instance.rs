//! Instance lifecycle operations
//!
//! All operations are idempotent: the reconcilers may repeat any of them on
//! every pass without creating duplicate remote state.

use std::time::Duration;

use reqwest::Method;
use tracing::{debug, warn};

use super::types::{InstanceFull, InstanceState, InstanceStatePut, InstanceStatus, InstancesPost};
use super::Client;
use crate::error::Result;

/// What to do about an instance given its observed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDecision {
    /// Instance is absent, create it
    Create,
    /// Instance exists but is wedged in a terminal state, replace it
    Recreate,
    /// Instance exists and is usable, leave it alone
    Skip,
}

pub fn create_decision(state: Option<&InstanceState>) -> CreateDecision {
    match state {
        None => CreateDecision::Create,
        Some(state) if state.status == InstanceStatus::Error => CreateDecision::Recreate,
        Some(_) => CreateDecision::Skip,
    }
}

/// Addresses identifying the machine itself. Loopback interfaces, interfaces
/// without a host-side name (CNI-managed), non-global scopes and single-host
/// /32 or /128 addresses (VIP reservations) are all excluded. The result is
/// sorted so repeated calls are comparable.
pub fn active_machine_addresses(state: &InstanceState) -> Vec<String> {
    let mut addresses = Vec::new();
    for network in state.network.values() {
        if network.interface_type == "loopback" {
            continue;
        }
        if network.host_name.is_empty() {
            continue;
        }
        for addr in &network.addresses {
            if addr.scope != "global" {
                continue;
            }
            if addr.netmask == "32" || addr.netmask == "128" {
                continue;
            }
            addresses.push(addr.address.clone());
        }
    }
    addresses.sort();
    addresses.dedup();
    addresses
}

fn matches_config(instance: &InstanceFull, filter: &[(String, String)]) -> bool {
    filter
        .iter()
        .all(|(key, value)| instance.config.get(key) == Some(value))
}

impl Client {
    pub async fn get_instance_state(&self, name: &str) -> Result<InstanceState> {
        self.api_get(
            &format!("/1.0/instances/{name}/state"),
            &[],
            "GetInstanceState",
        )
        .await
    }

    async fn create_instance(&self, instance: &InstancesPost) -> Result<()> {
        self.call_and_wait(
            Method::POST,
            "/1.0/instances",
            &[],
            Some(serde_json::to_value(instance)?),
            "CreateInstance",
        )
        .await?;
        Ok(())
    }

    /// Create the instance unless it already exists. An instance stuck in an
    /// error state is replaced. Safe to call on every reconcile; at most one
    /// logical create happens per convergence.
    pub async fn create_instance_if_not_exists(&self, instance: &InstancesPost) -> Result<()> {
        let state = match self.get_instance_state(&instance.name).await {
            Ok(state) => Some(state),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        match create_decision(state.as_ref()) {
            CreateDecision::Skip => {
                debug!("Instance {} exists", instance.name);
                Ok(())
            }
            CreateDecision::Recreate => {
                warn!("Replacing failed instance {}", instance.name);
                self.force_remove_instance_if_exists(&instance.name).await?;
                self.create_instance(instance).await
            }
            CreateDecision::Create => {
                debug!("Creating instance {}", instance.name);
                self.create_instance(instance).await
            }
        }
    }

    /// Start the instance if it is not already running. Frozen instances are
    /// unfrozen instead of started.
    pub async fn ensure_instance_running(&self, name: &str) -> Result<()> {
        let state = self.get_instance_state(name).await?;

        let action = match state.status {
            InstanceStatus::Running => {
                debug!("Instance {name} is already running");
                return Ok(());
            }
            InstanceStatus::Frozen => "unfreeze",
            _ => "start",
        };

        debug!("Starting instance {name} (action: {action})");
        self.call_and_wait(
            Method::PUT,
            &format!("/1.0/instances/{name}/state"),
            &[],
            Some(serde_json::to_value(InstanceStatePut {
                action: action.to_string(),
                force: false,
            })?),
            "UpdateInstanceState",
        )
        .await?;
        Ok(())
    }

    /// Poll until the instance reports a qualifying address. The caller
    /// bounds this with one of the fixed per-call deadlines.
    pub async fn wait_for_instance_address(&self, name: &str) -> Result<Vec<String>> {
        loop {
            debug!("Waiting for instance {name} address");
            let state = self.get_instance_state(name).await?;
            let addresses = active_machine_addresses(&state);
            if !addresses.is_empty() {
                return Ok(addresses);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Stop (forced) and delete the instance. Absence is success.
    pub async fn force_remove_instance_if_exists(&self, name: &str) -> Result<()> {
        let state = match self.get_instance_state(name).await {
            Ok(state) => state,
            Err(e) if e.is_not_found() => {
                debug!("Instance {name} does not exist");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if state.pid != 0 {
            debug!("Stopping instance {name} (pid: {})", state.pid);
            self.call_and_wait(
                Method::PUT,
                &format!("/1.0/instances/{name}/state"),
                &[],
                Some(serde_json::to_value(InstanceStatePut {
                    action: "stop".to_string(),
                    force: true,
                })?),
                "UpdateInstanceState",
            )
            .await?;
        }

        debug!("Deleting instance {name}");
        match self
            .call_and_wait(
                Method::DELETE,
                &format!("/1.0/instances/{name}"),
                &[],
                None,
                "DeleteInstance",
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// List instances whose config carries every given key/value pair. The
    /// hypervisor offers no server-side filter for config keys, so the full
    /// listing is filtered here.
    pub async fn instances_with_config(
        &self,
        filter: &[(String, String)],
    ) -> Result<Vec<InstanceFull>> {
        debug!("Retrieving instances with filter {filter:?}");
        let instances: Vec<InstanceFull> = self
            .api_get("/1.0/instances", &[("recursion", "2")], "GetInstancesFull")
            .await?;

        Ok(instances
            .into_iter()
            .filter(|instance| matches_config(instance, filter))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incus::types::{InstanceNetwork, InstanceNetworkAddress};
    use std::collections::BTreeMap;

    fn network(
        interface_type: &str,
        host_name: &str,
        addresses: Vec<(&str, &str, &str)>,
    ) -> InstanceNetwork {
        InstanceNetwork {
            interface_type: interface_type.to_string(),
            host_name: host_name.to_string(),
            addresses: addresses
                .into_iter()
                .map(|(address, netmask, scope)| InstanceNetworkAddress {
                    family: if address.contains(':') { "inet6" } else { "inet" }.to_string(),
                    address: address.to_string(),
                    netmask: netmask.to_string(),
                    scope: scope.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_create_decision() {
        assert_eq!(create_decision(None), CreateDecision::Create);

        let state = InstanceState {
            status: InstanceStatus::Error,
            ..Default::default()
        };
        assert_eq!(create_decision(Some(&state)), CreateDecision::Recreate);

        for status in [
            InstanceStatus::Running,
            InstanceStatus::Stopped,
            InstanceStatus::Frozen,
            InstanceStatus::Unknown,
        ] {
            let state = InstanceState {
                status,
                ..Default::default()
            };
            assert_eq!(create_decision(Some(&state)), CreateDecision::Skip);
        }
    }

    #[test]
    fn test_address_filtering() {
        let mut interfaces = BTreeMap::new();
        interfaces.insert(
            "lo".to_string(),
            network("loopback", "lo", vec![("127.0.0.1", "8", "local")]),
        );
        // CNI-managed interface without a host-side name
        interfaces.insert(
            "cni0".to_string(),
            network("broadcast", "", vec![("10.244.0.1", "24", "global")]),
        );
        interfaces.insert(
            "eth0".to_string(),
            network(
                "broadcast",
                "vethbbcd39c7",
                vec![
                    // VIP reservation, not instance identity
                    ("10.100.42.1", "32", "global"),
                    ("10.0.0.5", "24", "global"),
                    ("fe80::1", "64", "link"),
                ],
            ),
        );

        let state = InstanceState {
            status: InstanceStatus::Running,
            pid: 1,
            network: interfaces,
        };

        assert_eq!(active_machine_addresses(&state), vec!["10.0.0.5".to_string()]);
    }

    #[test]
    fn test_address_filtering_is_sorted_and_deduplicated() {
        let mut interfaces = BTreeMap::new();
        interfaces.insert(
            "eth1".to_string(),
            network("broadcast", "vethb", vec![("10.0.0.9", "24", "global")]),
        );
        interfaces.insert(
            "eth0".to_string(),
            network(
                "broadcast",
                "vetha",
                vec![("10.0.0.5", "24", "global"), ("10.0.0.5", "24", "global")],
            ),
        );

        let state = InstanceState {
            network: interfaces,
            ..Default::default()
        };

        assert_eq!(
            active_machine_addresses(&state),
            vec!["10.0.0.5".to_string(), "10.0.0.9".to_string()]
        );
    }

    #[test]
    fn test_matches_config() {
        let mut config = BTreeMap::new();
        config.insert("user.cluster-name".to_string(), "c1".to_string());
        config.insert("user.cluster-role".to_string(), "control-plane".to_string());
        let instance = InstanceFull {
            name: "c1-cp-0".to_string(),
            config,
            state: None,
        };

        assert!(matches_config(
            &instance,
            &[("user.cluster-name".to_string(), "c1".to_string())]
        ));
        assert!(!matches_config(
            &instance,
            &[("user.cluster-name".to_string(), "c2".to_string())]
        ));
        assert!(!matches_config(
            &instance,
            &[("user.cluster-namespace".to_string(), "default".to_string())]
        ));
    }
}
