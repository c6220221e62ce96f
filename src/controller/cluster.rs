//! IncusCluster controller
//!
//! Normal path: shared kubeadm profile, then the load balancer, then the
//! control plane endpoint backfill. Deletion waits for all machines of the
//! cluster to disappear before removing the shared profile, since their
//! instances may still reference it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, warn};

use super::{
    ensure_finalizer, incus_client_for_cluster, patch_status, remove_finalizer, requeue_for,
    Context,
};
use crate::crd::{
    conditions, ConditionSeverity, IncusCluster, IncusClusterStatus, IncusMachine,
    CLUSTER_FINALIZER,
};
use crate::error::{Error, Result};
use crate::incus;
use crate::loadbalancer;

/// Conditions owned by this controller, summarized into Ready.
const INFRA_CONDITIONS: &[&str] = &[
    conditions::KUBEADM_PROFILE_AVAILABLE_CONDITION,
    conditions::LOAD_BALANCER_AVAILABLE_CONDITION,
];

/// Interval to re-check for remaining machines during deletion.
const MACHINE_DELETION_INTERVAL: Duration = Duration::from_secs(5);

pub struct ClusterController;

impl ClusterController {
    pub async fn run(client: Client, ctx: Arc<Context>) {
        let api: Api<IncusCluster> = Api::all(client);

        Controller::new(api, watcher::Config::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(|result| async move {
                match result {
                    Ok((obj, _)) => debug!("Reconciled IncusCluster {}", obj.name),
                    Err(e) => warn!("IncusCluster reconcile error: {e}"),
                }
            })
            .await;
    }
}

async fn reconcile(cluster: Arc<IncusCluster>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<IncusCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    // Credentials are resolved before the finalizer is added, so a cluster
    // pointing at a missing secret never gets stuck on deletion.
    let incus_client = incus_client_for_cluster(&ctx.client, &cluster).await?;

    if cluster.metadata.deletion_timestamp.is_none() {
        if ensure_finalizer(&api, cluster.as_ref(), CLUSTER_FINALIZER).await? {
            return Ok(Action::await_change());
        }
        reconcile_normal(&ctx, &api, &cluster, &incus_client).await
    } else {
        if !cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER) {
            return Ok(Action::await_change());
        }
        match reconcile_delete(&ctx, &api, &cluster, &incus_client).await? {
            Some(action) => Ok(action),
            None => {
                remove_finalizer(&api, cluster.as_ref(), CLUSTER_FINALIZER).await?;
                Ok(Action::await_change())
            }
        }
    }
}

fn error_policy(cluster: Arc<IncusCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        "Failed to reconcile IncusCluster {}: {error}",
        cluster.name_any()
    );
    requeue_for(error)
}

// =============================================================================
// Normal path
// =============================================================================

async fn reconcile_normal(
    ctx: &Context,
    api: &Api<IncusCluster>,
    cluster: &IncusCluster,
    incus_client: &incus::Client,
) -> Result<Action> {
    let name = cluster.name_any();
    let mut status = cluster.status.clone().unwrap_or_default();

    let result = reconcile_normal_inner(ctx, api, cluster, incus_client, &mut status).await;

    conditions::summarize(&mut status.conditions, INFRA_CONDITIONS);
    patch_status(api, &name, &status).await?;
    result
}

async fn reconcile_normal_inner(
    ctx: &Context,
    api: &Api<IncusCluster>,
    cluster: &IncusCluster,
    incus_client: &incus::Client,
    status: &mut IncusClusterStatus,
) -> Result<Action> {
    let name = cluster.name_any();

    // Shared kubeadm profile for container machines
    let profile_name = cluster.profile_name();
    if cluster.spec.skip_default_kubeadm_profile {
        conditions::mark_false(
            &mut status.conditions,
            conditions::KUBEADM_PROFILE_AVAILABLE_CONDITION,
            conditions::KUBEADM_PROFILE_DISABLED_REASON,
            ConditionSeverity::Info,
            &format!("Will not create default kubeadm profile {profile_name}"),
        );
    } else {
        info!("Creating default kubeadm profile {profile_name}");
        match incus_client
            .init_profile(&profile_name, &ctx.config.kubeadm_profile)
            .await
        {
            Ok(()) => {
                conditions::mark_true(
                    &mut status.conditions,
                    conditions::KUBEADM_PROFILE_AVAILABLE_CONDITION,
                );
            }
            Err(e) if e.is_terminal() => {
                error!("Cannot create default kubeadm profile {profile_name}: {e}");
                conditions::mark_false(
                    &mut status.conditions,
                    conditions::KUBEADM_PROFILE_AVAILABLE_CONDITION,
                    conditions::KUBEADM_PROFILE_CREATION_ABORTED_REASON,
                    ConditionSeverity::Error,
                    &format!(
                        "The default kubeadm profile could not be created, most likely because \
                         of a permissions issue. Either enable privileged containers on the \
                         project, or set .spec.skipDefaultKubeadmProfile=true. The error was: {e}"
                    ),
                );
                status.failure_reason =
                    Some(conditions::KUBEADM_PROFILE_CREATION_ABORTED_REASON.to_string());
                status.failure_message = Some(e.to_string());
                return Ok(Action::await_change());
            }
            Err(e) => {
                conditions::mark_false(
                    &mut status.conditions,
                    conditions::KUBEADM_PROFILE_AVAILABLE_CONDITION,
                    conditions::KUBEADM_PROFILE_CREATION_FAILED_REASON,
                    ConditionSeverity::Warning,
                    &e.to_string(),
                );
                return Err(e);
            }
        }
    }

    // Load balancer
    info!("Creating load balancer for cluster {name}");
    let create_result = match loadbalancer::manager_for_cluster(
        Arc::new(incus_client.clone()),
        &ctx.config,
        cluster,
    ) {
        Ok(manager) => manager.create().await,
        Err(e) => Err(e),
    };

    let addresses = match create_result {
        Ok(addresses) => addresses,
        Err(e) if e.is_terminal() => {
            error!("Cannot provision load balancer for cluster {name}: {e}");
            conditions::mark_false(
                &mut status.conditions,
                conditions::LOAD_BALANCER_AVAILABLE_CONDITION,
                conditions::LOAD_BALANCER_PROVISIONING_ABORTED_REASON,
                ConditionSeverity::Error,
                &format!("The cluster load balancer could not be provisioned. The error was: {e}"),
            );
            status.failure_reason =
                Some(conditions::LOAD_BALANCER_PROVISIONING_ABORTED_REASON.to_string());
            status.failure_message = Some(e.to_string());
            return Ok(Action::await_change());
        }
        Err(e) => {
            warn!("Failed to provision load balancer for cluster {name}: {e}");
            conditions::mark_false(
                &mut status.conditions,
                conditions::LOAD_BALANCER_AVAILABLE_CONDITION,
                conditions::LOAD_BALANCER_PROVISIONING_FAILED_REASON,
                ConditionSeverity::Warning,
                &e.to_string(),
            );
            return Err(e);
        }
    };

    // Surface the control plane endpoint, only where unset
    let endpoint = &cluster.spec.control_plane_endpoint;
    if endpoint.host.is_empty() || endpoint.port == 0 {
        let host = if endpoint.host.is_empty() {
            addresses.first().cloned().ok_or_else(|| {
                Error::Internal("load balancer reported no addresses".to_string())
            })?
        } else {
            endpoint.host.clone()
        };
        let port = if endpoint.port == 0 { 6443 } else { endpoint.port };

        api.patch(
            &name,
            &kube::api::PatchParams::default(),
            &kube::api::Patch::Merge(serde_json::json!({
                "spec": {"controlPlaneEndpoint": {"host": host, "port": port}}
            })),
        )
        .await?;
    }

    status.ready = true;
    conditions::mark_true(
        &mut status.conditions,
        conditions::LOAD_BALANCER_AVAILABLE_CONDITION,
    );

    Ok(Action::await_change())
}

// =============================================================================
// Deletion path
// =============================================================================

/// What deletion should do next, given the machines still present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteStep {
    /// Machines may still reference the shared profile; check back later
    WaitForMachines,
    /// All machines are gone, the shared profile can go too
    DeleteProfile,
}

fn delete_step(remaining_machines: usize) -> DeleteStep {
    if remaining_machines > 0 {
        DeleteStep::WaitForMachines
    } else {
        DeleteStep::DeleteProfile
    }
}

/// Returns `Some(action)` to requeue without removing the finalizer, or
/// `None` once all owned remote resources are gone.
async fn reconcile_delete(
    ctx: &Context,
    api: &Api<IncusCluster>,
    cluster: &IncusCluster,
    incus_client: &incus::Client,
) -> Result<Option<Action>> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let mut status = cluster.status.clone().unwrap_or_default();

    // Mark deletion in progress and patch right away so users see it, even
    // though the hypervisor side usually completes within this reconcile.
    conditions::mark_false(
        &mut status.conditions,
        conditions::LOAD_BALANCER_AVAILABLE_CONDITION,
        conditions::DELETING_REASON,
        ConditionSeverity::Info,
        "",
    );
    conditions::mark_false(
        &mut status.conditions,
        conditions::KUBEADM_PROFILE_AVAILABLE_CONDITION,
        conditions::DELETING_REASON,
        ConditionSeverity::Info,
        "",
    );
    conditions::summarize(&mut status.conditions, INFRA_CONDITIONS);
    patch_status(api, &name, &status).await?;

    info!("Deleting load balancer for cluster {name}");
    loadbalancer::manager_for_cluster(Arc::new(incus_client.clone()), &ctx.config, cluster)?
        .delete()
        .await?;

    let machines: Api<IncusMachine> = Api::namespaced(ctx.client.clone(), &namespace);
    let remaining = machines
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|machine| machine.spec.cluster_name == name)
        .count();

    match delete_step(remaining) {
        DeleteStep::WaitForMachines => {
            info!("Waiting for {remaining} machines of cluster {name} to be deleted");
            Ok(Some(Action::requeue(MACHINE_DELETION_INTERVAL)))
        }
        DeleteStep::DeleteProfile => {
            info!("Deleting default kubeadm profile for cluster {name}");
            incus_client.delete_profile(&cluster.profile_name()).await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_step_waits_while_machines_remain() {
        assert_eq!(delete_step(2), DeleteStep::WaitForMachines);
        assert_eq!(delete_step(1), DeleteStep::WaitForMachines);
        assert_eq!(delete_step(0), DeleteStep::DeleteProfile);
    }
}
