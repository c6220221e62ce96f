//! Reconciliation controllers
//!
//! Two controllers converge IncusCluster and IncusMachine objects toward the
//! observed hypervisor state. The controller runtime bounds concurrency and
//! guarantees no two reconciles of the same object run in parallel; every
//! long wait is expressed as a bounded requeue, never a sleep.

pub mod cluster;
pub mod machine;

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cloudprovider::NodePatcher;
use crate::config::OperatorConfig;
use crate::crd::IncusCluster;
use crate::error::{Error, ErrorAction, Result};
use crate::incus;

/// Requeue interval for transient failures. The work queue has no built-in
/// exponential backoff, so retriable errors come back on a fixed interval.
const RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state for both reconcilers
pub struct Context {
    /// Management cluster client
    pub client: kube::Client,
    /// Immutable process-wide configuration
    pub config: Arc<OperatorConfig>,
    /// Workload cluster node patch collaborator
    pub node_patcher: Arc<dyn NodePatcher>,
}

/// Map a reconcile error to the work queue action for it.
pub(crate) fn requeue_for(error: &Error) -> Action {
    match error.action() {
        ErrorAction::RequeueWithBackoff => Action::requeue(RETRY_INTERVAL),
        ErrorAction::RequeueAfter(duration) => Action::requeue(duration),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

/// Build an Incus client from the cluster's credentials secret. Called
/// before any finalizer is added, so clusters without a valid secret do not
/// get stuck on deletion.
pub(crate) async fn incus_client_for_cluster(
    client: &kube::Client,
    cluster: &IncusCluster,
) -> Result<incus::Client> {
    let namespace = cluster.namespace().unwrap_or_default();
    let secrets: Api<k8s_openapi::api::core::v1::Secret> =
        Api::namespaced(client.clone(), &namespace);
    let secret = secrets.get(&cluster.spec.secret_ref.name).await?;
    incus::Client::new(&incus::ConnectionOptions::from_secret(&secret))
}

/// Add the finalizer if missing. Returns true when a patch was issued; the
/// resulting watch event drives the next reconcile.
pub(crate) async fn ensure_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    if obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(false);
    }

    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    api.patch_metadata(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({"metadata": {"finalizers": finalizers}})),
    )
    .await?;
    Ok(true)
}

/// Remove the finalizer once all owned remote resources are gone.
pub(crate) async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    api.patch_metadata(
        &obj.name_any(),
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({"metadata": {"finalizers": finalizers}})),
    )
    .await?;
    Ok(())
}

/// Replace the object status wholesale.
pub(crate) async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    S: Serialize,
{
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({"status": status})),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_for_error_classes() {
        // terminal errors stop the work queue
        let action = requeue_for(&Error::MissingExtensions(vec!["instance_oci".into()]));
        assert_eq!(action, Action::await_change());

        // transient errors come back on the retry interval
        let action = requeue_for(&Error::IncusApi {
            operation: "GetInstanceState".into(),
            message: "connection reset".into(),
        });
        assert_eq!(action, Action::requeue(RETRY_INTERVAL));

        // timed-out waits use their own interval
        let action = requeue_for(&Error::WaitTimeout("instance address".into()));
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
    }
}
