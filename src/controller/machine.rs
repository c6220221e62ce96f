//! IncusMachine controller
//!
//! Provisioning walks: cluster infrastructure ready -> bootstrap data
//! present -> instance created -> load balancer registration (control plane
//! machines, exactly once) -> cloud-init completion -> node patch ->
//! providerID recorded. Each wait is a bounded requeue with an Info
//! condition; terminal failures stop the queue with an Error condition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, warn};

use super::{
    ensure_finalizer, incus_client_for_cluster, patch_status, remove_finalizer, requeue_for,
    Context,
};
use crate::cloudinit;
use crate::config::OperatorConfig;
use crate::crd::{
    conditions, ConditionSeverity, ImageSource, IncusCluster, IncusMachine, IncusMachineStatus,
    InstanceKind, MachineAddress, MachineAddressType, MACHINE_FINALIZER,
};
use crate::error::{Error, Result};
use crate::incus::types::{InstanceSource, InstancesPost, ServerFlavor};
use crate::incus::{
    self, simplestreams, with_timeout, InstanceRole, CONFIG_CLOUD_INIT_KEY,
    CONFIG_CLUSTER_NAMESPACE_KEY, CONFIG_CLUSTER_NAME_KEY, CONFIG_INSTANCE_ROLE_KEY,
    INSTANCE_CREATE_TIMEOUT, INSTANCE_DELETE_TIMEOUT,
};
use crate::loadbalancer;

/// Conditions owned by this controller, summarized into Ready.
const INFRA_CONDITIONS: &[&str] = &[
    conditions::INSTANCE_PROVISIONED_CONDITION,
    conditions::BOOTSTRAP_SUCCEEDED_CONDITION,
];

/// Interval for re-checking cloud-init progress.
const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Interval for waiting on the control plane to initialize; busy-looping
/// faster is pointless before an API endpoint even exists.
const CONTROL_PLANE_WAIT_INTERVAL: Duration = Duration::from_secs(15);

/// Interval for dependency wait states (cluster infra, bootstrap data).
const DEPENDENCY_WAIT_INTERVAL: Duration = Duration::from_secs(15);

/// Interval for periodic re-verification of provisioned machines.
const REVERIFY_INTERVAL: Duration = Duration::from_secs(300);

pub struct MachineController;

impl MachineController {
    pub async fn run(client: Client, ctx: Arc<Context>) {
        let api: Api<IncusMachine> = Api::all(client);

        Controller::new(api, watcher::Config::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(|result| async move {
                match result {
                    Ok((obj, _)) => debug!("Reconciled IncusMachine {}", obj.name),
                    Err(e) => warn!("IncusMachine reconcile error: {e}"),
                }
            })
            .await;
    }
}

async fn reconcile(machine: Arc<IncusMachine>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = machine.namespace().unwrap_or_default();
    let api: Api<IncusMachine> = Api::namespaced(ctx.client.clone(), &namespace);

    // Fetch the owning cluster
    let clusters: Api<IncusCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let cluster = match clusters.get_opt(&machine.spec.cluster_name).await? {
        Some(cluster) => cluster,
        None => {
            info!(
                "IncusCluster {} for machine {} is not available yet",
                machine.spec.cluster_name,
                machine.name_any()
            );
            return Ok(Action::requeue(DEPENDENCY_WAIT_INTERVAL));
        }
    };

    // Credentials are resolved before the finalizer is added, so machines of
    // a cluster without a valid secret do not get stuck on deletion.
    let incus_client = incus_client_for_cluster(&ctx.client, &cluster).await?;

    if machine.metadata.deletion_timestamp.is_none() {
        if ensure_finalizer(&api, machine.as_ref(), MACHINE_FINALIZER).await? {
            return Ok(Action::await_change());
        }
        reconcile_normal(&ctx, &api, &cluster, &machine, &incus_client).await
    } else {
        if !machine.finalizers().iter().any(|f| f == MACHINE_FINALIZER) {
            return Ok(Action::await_change());
        }
        reconcile_delete(&ctx, &api, &cluster, &machine, &incus_client).await?;
        remove_finalizer(&api, machine.as_ref(), MACHINE_FINALIZER).await?;
        Ok(Action::await_change())
    }
}

fn error_policy(machine: Arc<IncusMachine>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        "Failed to reconcile IncusMachine {}: {error}",
        machine.name_any()
    );
    requeue_for(error)
}

// =============================================================================
// Normal path
// =============================================================================

async fn reconcile_normal(
    ctx: &Context,
    api: &Api<IncusMachine>,
    cluster: &IncusCluster,
    machine: &IncusMachine,
    incus_client: &incus::Client,
) -> Result<Action> {
    let name = machine.name_any();
    let mut status = machine.status.clone().unwrap_or_default();

    let result =
        reconcile_normal_inner(ctx, api, cluster, machine, incus_client, &mut status).await;

    conditions::summarize(&mut status.conditions, INFRA_CONDITIONS);
    patch_status(api, &name, &status).await?;
    result
}

async fn reconcile_normal_inner(
    ctx: &Context,
    api: &Api<IncusMachine>,
    cluster: &IncusCluster,
    machine: &IncusMachine,
    incus_client: &incus::Client,
    status: &mut IncusMachineStatus,
) -> Result<Action> {
    let name = machine.name_any();
    let instance_name = machine.instance_name();
    let cluster_ready = cluster.status.as_ref().map(|s| s.ready).unwrap_or(false);
    let cluster_conditions = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();

    // Wait for the cluster infrastructure
    if !cluster_ready {
        info!("Waiting for cluster {} infrastructure", machine.spec.cluster_name);
        conditions::mark_false(
            &mut status.conditions,
            conditions::INSTANCE_PROVISIONED_CONDITION,
            conditions::WAITING_FOR_CLUSTER_INFRASTRUCTURE_REASON,
            ConditionSeverity::Info,
            "",
        );
        return Ok(Action::requeue(DEPENDENCY_WAIT_INTERVAL));
    }

    // Machines that are already provisioned only get re-verified. An
    // instance deleted out-of-band is NOT recreated.
    if machine.spec.provider_id.is_some() {
        return match incus_client.get_instance_state(&instance_name).await {
            Ok(state) => {
                status.ready = true;
                conditions::mark_true(
                    &mut status.conditions,
                    conditions::INSTANCE_PROVISIONED_CONDITION,
                );
                set_machine_addresses(
                    status,
                    &instance_name,
                    incus::instance::active_machine_addresses(&state),
                );
                Ok(Action::requeue(REVERIFY_INTERVAL))
            }
            Err(e) if e.is_not_found() => {
                status.ready = false;
                conditions::mark_false(
                    &mut status.conditions,
                    conditions::INSTANCE_PROVISIONED_CONDITION,
                    conditions::INSTANCE_DELETED_REASON,
                    ConditionSeverity::Error,
                    &format!("Instance {instance_name} does not exist anymore"),
                );
                Ok(Action::await_change())
            }
            Err(e) => Err(e),
        };
    }

    // Make sure bootstrap data is available and populated
    let Some(data_secret_name) = machine.spec.bootstrap.data_secret_name.clone() else {
        if !machine.is_control_plane()
            && !conditions::is_true(
                cluster_conditions,
                conditions::CONTROL_PLANE_INITIALIZED_CONDITION,
            )
        {
            info!("Waiting for the control plane to be initialized");
            conditions::mark_false(
                &mut status.conditions,
                conditions::INSTANCE_PROVISIONED_CONDITION,
                conditions::WAITING_FOR_CONTROL_PLANE_AVAILABLE_REASON,
                ConditionSeverity::Info,
                "",
            );
            return Ok(Action::requeue(DEPENDENCY_WAIT_INTERVAL));
        }

        info!("Waiting for bootstrap data to be set on machine {name}");
        conditions::mark_false(
            &mut status.conditions,
            conditions::INSTANCE_PROVISIONED_CONDITION,
            conditions::WAITING_FOR_BOOTSTRAP_DATA_REASON,
            ConditionSeverity::Info,
            "",
        );
        return Ok(Action::requeue(DEPENDENCY_WAIT_INTERVAL));
    };

    let cloud_init = bootstrap_data(ctx, machine, &data_secret_name).await?;

    // Make the provisioning attempt visible before the (slow) create call
    conditions::mark_false(
        &mut status.conditions,
        conditions::INSTANCE_PROVISIONED_CONDITION,
        conditions::CREATING_INSTANCE_REASON,
        ConditionSeverity::Info,
        "",
    );
    patch_status(api, &name, status).await?;

    info!("Creating instance {instance_name}");
    let addresses =
        match create_machine_instance(ctx, cluster, machine, incus_client, cloud_init).await {
            Ok(addresses) => addresses,
            Err(e) if e.is_terminal() => {
                error!("Cannot create instance {instance_name}: {e}");
                conditions::mark_false(
                    &mut status.conditions,
                    conditions::INSTANCE_PROVISIONED_CONDITION,
                    conditions::INSTANCE_PROVISIONING_ABORTED_REASON,
                    ConditionSeverity::Error,
                    &format!("Failed to create instance: {e}"),
                );
                return Ok(Action::await_change());
            }
            Err(e) => {
                conditions::mark_false(
                    &mut status.conditions,
                    conditions::INSTANCE_PROVISIONED_CONDITION,
                    conditions::INSTANCE_PROVISIONING_FAILED_REASON,
                    ConditionSeverity::Warning,
                    &format!("Failed to create instance: {e}"),
                );
                return Err(e);
            }
        };
    set_machine_addresses(status, &instance_name, addresses);
    conditions::mark_true(
        &mut status.conditions,
        conditions::INSTANCE_PROVISIONED_CONDITION,
    );

    // Register control plane machines with the load balancer exactly once;
    // the persisted flag spans reconciles.
    if machine.is_control_plane() && !status.load_balancer_configured {
        loadbalancer::manager_for_cluster(Arc::new(incus_client.clone()), &ctx.config, cluster)?
            .reconfigure()
            .await?;
        status.load_balancer_configured = true;
    }

    // Bootstrap completion is gated on cloud-init inside the instance
    let (bootstrap_status, bootstrap_err) =
        cloudinit::check_status(incus_client, &instance_name).await;
    match bootstrap_status {
        cloudinit::Status::Unknown => {
            let message = bootstrap_err.map(|e| e.to_string()).unwrap_or_default();
            warn!("Could not retrieve cloud-init status for {instance_name}: {message}");
            conditions::mark_unknown(
                &mut status.conditions,
                conditions::BOOTSTRAP_SUCCEEDED_CONDITION,
                conditions::BOOTSTRAP_STATUS_UNKNOWN_REASON,
                &message,
            );
            return Ok(Action::requeue(BOOTSTRAP_POLL_INTERVAL));
        }
        cloudinit::Status::Running => {
            info!("Waiting for bootstrap script to complete on {instance_name}");
            conditions::mark_false(
                &mut status.conditions,
                conditions::BOOTSTRAP_SUCCEEDED_CONDITION,
                conditions::BOOTSTRAPPING_REASON,
                ConditionSeverity::Info,
                "",
            );
            return Ok(Action::requeue(BOOTSTRAP_POLL_INTERVAL));
        }
        cloudinit::Status::Error => {
            error!("Bootstrap failed on {instance_name}, marking machine as failed");
            conditions::mark_false(
                &mut status.conditions,
                conditions::BOOTSTRAP_SUCCEEDED_CONDITION,
                conditions::BOOTSTRAP_FAILED_REASON,
                ConditionSeverity::Error,
                "bootstrap failed since cloud-init finished with error status",
            );
            return Ok(Action::await_change());
        }
        cloudinit::Status::Done => {
            info!("Bootstrap finished successfully on {instance_name}");
            conditions::mark_true(
                &mut status.conditions,
                conditions::BOOTSTRAP_SUCCEEDED_CONDITION,
            );
        }
    }

    if !cluster.spec.skip_cloud_provider_node_patch {
        // Before the control plane is initialized there is no API server to
        // carry the node patch; check back instead of busy-looping.
        if !conditions::is_true(
            cluster_conditions,
            conditions::CONTROL_PLANE_INITIALIZED_CONDITION,
        ) {
            info!("Waiting for initialized control plane");
            return Ok(Action::requeue(CONTROL_PLANE_WAIT_INTERVAL));
        }

        ctx.node_patcher
            .patch_node(cluster, machine, &status.addresses)
            .await?;
    } else {
        debug!("Skipping cloud provider node patch for {name}");
    }

    status.ready = true;
    api.patch(
        &name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({
            "spec": {"providerID": machine.expected_provider_id()}
        })),
    )
    .await?;

    Ok(Action::requeue(REVERIFY_INTERVAL))
}

// =============================================================================
// Deletion path
// =============================================================================

async fn reconcile_delete(
    ctx: &Context,
    api: &Api<IncusMachine>,
    cluster: &IncusCluster,
    machine: &IncusMachine,
    incus_client: &incus::Client,
) -> Result<()> {
    let name = machine.name_any();
    let instance_name = machine.instance_name();
    let mut status = machine.status.clone().unwrap_or_default();

    // Mark deletion in progress and patch right away so users see it
    conditions::mark_false(
        &mut status.conditions,
        conditions::INSTANCE_PROVISIONED_CONDITION,
        conditions::DELETING_REASON,
        ConditionSeverity::Info,
        "",
    );
    conditions::summarize(&mut status.conditions, INFRA_CONDITIONS);
    patch_status(api, &name, &status).await?;

    info!("Deleting instance {instance_name}");
    with_timeout(INSTANCE_DELETE_TIMEOUT, "instance deletion", async {
        incus_client
            .force_remove_instance_if_exists(&instance_name)
            .await
    })
    .await?;

    // Drop the deleted control plane machine from the load balancer backends,
    // unless the whole cluster is on its way out anyway.
    if machine.is_control_plane() && cluster.metadata.deletion_timestamp.is_none() {
        loadbalancer::manager_for_cluster(Arc::new(incus_client.clone()), &ctx.config, cluster)?
            .reconfigure()
            .await?;
    }

    Ok(())
}

// =============================================================================
// Instance creation
// =============================================================================

async fn bootstrap_data(
    ctx: &Context,
    machine: &IncusMachine,
    data_secret_name: &str,
) -> Result<String> {
    let namespace = machine.namespace().unwrap_or_default();
    let secrets: Api<k8s_openapi::api::core::v1::Secret> =
        Api::namespaced(ctx.client.clone(), &namespace);
    let secret = secrets.get(data_secret_name).await?;

    secret
        .data
        .as_ref()
        .and_then(|data| data.get("value"))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .ok_or_else(|| Error::SecretKeyMissing {
            name: data_secret_name.to_string(),
            key: "value".to_string(),
        })
}

/// Resolve the `ubuntu:VERSION` shorthand. Incus and LXD serve Ubuntu images
/// from diverged catalogs, so the shorthand maps differently per flavor.
fn resolve_ubuntu_shorthand(name: &str, flavor: ServerFlavor) -> Result<ImageSource> {
    let version = name.trim_start_matches("ubuntu:");
    match flavor {
        ServerFlavor::Incus => Ok(ImageSource {
            name: format!("ubuntu/{version}/cloud"),
            server: "https://images.linuxcontainers.org".to_string(),
            protocol: "simplestreams".to_string(),
            ..Default::default()
        }),
        ServerFlavor::Lxd => Ok(ImageSource {
            name: version.to_string(),
            server: "https://cloud-images.ubuntu.com/releases/".to_string(),
            protocol: "simplestreams".to_string(),
            ..Default::default()
        }),
        ServerFlavor::Unknown => Err(Error::ImageNotFound(format!(
            "image name is {name:?}, but images with the 'ubuntu:' prefix are only supported on \
             Incus and LXD servers"
        ))),
    }
}

/// Image precedence: explicit source, else the `ubuntu:` shorthand, else a
/// version-derived catalog image that must exist before being accepted.
async fn resolve_machine_image(
    config: &OperatorConfig,
    machine: &IncusMachine,
    incus_client: &incus::Client,
) -> Result<ImageSource> {
    let image = &machine.spec.image;

    if image.name.starts_with("ubuntu:") {
        let flavor = incus_client.get_server().await?.flavor();
        return resolve_ubuntu_shorthand(&image.name, flavor);
    }

    if !image.is_zero() {
        return Ok(image.clone());
    }

    let Some(version) = machine.spec.kubernetes_version.clone() else {
        return Err(Error::ImageNotFound(format!(
            "no image source specified and machine {} does not have a Kubernetes version",
            machine.name_any()
        )));
    };

    let alias = format!("kubeadm/{version}");
    let http = reqwest::Client::builder().build()?;
    if !simplestreams::has_image_alias(
        &http,
        &config.simplestreams_server,
        &alias,
        machine.spec.instance_type,
    )
    .await?
    {
        return Err(Error::ImageNotFound(format!(
            "no image source specified and catalog {} does not provide images for Kubernetes \
             version {version}. Consider a different Kubernetes version, or build a base image \
             and set the image source on the machine",
            config.simplestreams_server
        )));
    }

    Ok(ImageSource {
        name: alias,
        server: config.simplestreams_server.clone(),
        protocol: "simplestreams".to_string(),
        ..Default::default()
    })
}

/// Profiles to attach: the machine's own list, plus the shared kubeadm
/// profile for containers unless disabled.
fn machine_profiles(
    profiles: &[String],
    kind: InstanceKind,
    skip_default_profile: bool,
    shared_profile: &str,
) -> Vec<String> {
    let mut profiles = profiles.to_vec();
    if kind == InstanceKind::Container
        && !skip_default_profile
        && !profiles.iter().any(|p| p == shared_profile)
    {
        profiles.push(shared_profile.to_string());
    }
    profiles
}

async fn create_machine_instance(
    ctx: &Context,
    cluster: &IncusCluster,
    machine: &IncusMachine,
    incus_client: &incus::Client,
    cloud_init: String,
) -> Result<Vec<String>> {
    let instance_name = machine.instance_name();
    let role = InstanceRole::from(machine.spec.role);

    let image = resolve_machine_image(&ctx.config, machine, incus_client).await?;
    let profiles = machine_profiles(
        &machine.spec.profiles,
        machine.spec.instance_type,
        cluster.spec.skip_default_kubeadm_profile,
        &cluster.profile_name(),
    );
    debug!("Creating instance {instance_name} (role: {role}, image: {})", image.name);

    let instance = InstancesPost {
        name: instance_name.clone(),
        instance_kind: machine.spec.instance_type.to_string(),
        source: InstanceSource::from(&image),
        instance_type: machine.spec.flavor.clone(),
        profiles,
        config: BTreeMap::from([
            (
                CONFIG_CLUSTER_NAME_KEY.to_string(),
                cluster.name_any(),
            ),
            (
                CONFIG_CLUSTER_NAMESPACE_KEY.to_string(),
                cluster.namespace().unwrap_or_default(),
            ),
            (CONFIG_INSTANCE_ROLE_KEY.to_string(), role.to_string()),
            (CONFIG_CLOUD_INIT_KEY.to_string(), cloud_init),
        ]),
    };

    with_timeout(INSTANCE_CREATE_TIMEOUT, "instance creation", async {
        incus_client.create_instance_if_not_exists(&instance).await?;
        incus_client.ensure_instance_running(&instance_name).await?;
        incus_client.wait_for_instance_address(&instance_name).await
    })
    .await
}

/// Record the hostname plus one internal and one external entry per address.
fn set_machine_addresses(status: &mut IncusMachineStatus, instance_name: &str, addrs: Vec<String>) {
    let mut addresses = Vec::with_capacity(1 + 2 * addrs.len());
    addresses.push(MachineAddress {
        r#type: MachineAddressType::Hostname,
        address: instance_name.to_string(),
    });
    for addr in addrs {
        addresses.push(MachineAddress {
            r#type: MachineAddressType::InternalIP,
            address: addr.clone(),
        });
        addresses.push(MachineAddress {
            r#type: MachineAddressType::ExternalIP,
            address: addr,
        });
    }
    status.addresses = addresses;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ubuntu_shorthand_per_flavor() {
        let image = resolve_ubuntu_shorthand("ubuntu:24.04", ServerFlavor::Incus).unwrap();
        assert_eq!(image.name, "ubuntu/24.04/cloud");
        assert_eq!(image.server, "https://images.linuxcontainers.org");

        let image = resolve_ubuntu_shorthand("ubuntu:24.04", ServerFlavor::Lxd).unwrap();
        assert_eq!(image.name, "24.04");
        assert_eq!(image.server, "https://cloud-images.ubuntu.com/releases/");

        let err = resolve_ubuntu_shorthand("ubuntu:24.04", ServerFlavor::Unknown).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_machine_profiles_appends_shared_profile_for_containers() {
        let profiles = machine_profiles(
            &["custom".to_string()],
            InstanceKind::Container,
            false,
            "kubeadm-default-c1",
        );
        assert_eq!(profiles, vec!["custom".to_string(), "kubeadm-default-c1".to_string()]);
    }

    #[test]
    fn test_machine_profiles_no_duplicate_shared_profile() {
        let profiles = machine_profiles(
            &["kubeadm-default-c1".to_string()],
            InstanceKind::Container,
            false,
            "kubeadm-default-c1",
        );
        assert_eq!(profiles, vec!["kubeadm-default-c1".to_string()]);
    }

    #[test]
    fn test_machine_profiles_skipped_for_vms_and_disabled_clusters() {
        let profiles = machine_profiles(
            &[],
            InstanceKind::VirtualMachine,
            false,
            "kubeadm-default-c1",
        );
        assert!(profiles.is_empty());

        let profiles = machine_profiles(&[], InstanceKind::Container, true, "kubeadm-default-c1");
        assert!(profiles.is_empty());
    }

    #[test]
    fn test_set_machine_addresses() {
        let mut status = IncusMachineStatus::default();
        set_machine_addresses(
            &mut status,
            "c1-worker-abc",
            vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()],
        );

        assert_eq!(status.addresses.len(), 5);
        assert_eq!(status.addresses[0].r#type, MachineAddressType::Hostname);
        assert_eq!(status.addresses[0].address, "c1-worker-abc");
        assert_eq!(status.addresses[1].r#type, MachineAddressType::InternalIP);
        assert_eq!(status.addresses[2].r#type, MachineAddressType::ExternalIP);
        assert_eq!(status.addresses[1].address, "10.0.0.5");
    }
}
