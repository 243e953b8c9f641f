//! Cluster-wide controller loop for NodeResourceConfiguration objects.

use std::sync::Arc;
use std::time::Duration;

use dpmock_api::{NodeResource, NodeResourceConfiguration, is_node_resource_reference};
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::reconcile::{reconcile_configuration, status_changed};
use crate::resolver::ResolverChain;

/// Shared state of reconcile calls.
pub struct Context {
    configurations: Api<NodeResourceConfiguration>,
    chain: ResolverChain<Api<NodeResource>>,
    requeue: Duration,
}

impl Context {
    pub fn new(client: Client, requeue: Duration) -> Self {
        Self {
            configurations: Api::all(client.clone()),
            chain: ResolverChain::new(Api::all(client)),
            requeue,
        }
    }
}

/// Whether `configuration` has an entry referencing NodeResource `name`.
pub fn references_node_resource(configuration: &NodeResourceConfiguration, name: &str) -> bool {
    configuration.spec.resources.iter().any(|entry| {
        let reference = entry.info.resource_ref.as_ref();
        is_node_resource_reference(reference) && reference.is_some_and(|r| r.name == name)
    })
}

async fn reconcile(
    configuration: Arc<NodeResourceConfiguration>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    if configuration.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let name = configuration.name_any();
    let descriptions = reconcile_configuration(&ctx.chain, &configuration).await?;

    if !status_changed(&configuration, &descriptions) {
        debug!(configuration = %name, "Status up to date");
        return Ok(Action::await_change());
    }

    let patch = json!({ "status": { "resourceDescriptions": descriptions } });
    ctx.configurations
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|source| ReconcileError::StatusUpdate {
            name: name.clone(),
            source,
        })?;

    info!(configuration = %name, resources = descriptions.len(), "Updated resource descriptions");
    Ok(Action::await_change())
}

fn error_policy(
    configuration: Arc<NodeResourceConfiguration>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    warn!(configuration = %configuration.name_any(), error = %error, "Reconcile failed");
    Action::requeue(ctx.requeue)
}

/// Run the controller until SIGINT or SIGTERM.
pub async fn run(client: Client, requeue: Duration) {
    let configurations = Api::<NodeResourceConfiguration>::all(client.clone());
    let node_resources = Api::<NodeResource>::all(client.clone());

    let controller = Controller::new(configurations, watcher::Config::default());
    let store = controller.store();

    info!("Starting dpmock controller");

    controller
        .watches(node_resources, watcher::Config::default(), move |node_resource| {
            let name = node_resource.name_any();
            store
                .state()
                .into_iter()
                .filter(|cfg| references_node_resource(cfg, &name))
                .map(|cfg| ObjectRef::from_obj(&*cfg))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(Context::new(client, requeue)))
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(configuration = %obj.name, "Reconciled"),
                Err(e) => warn!(error = %e, "Reconcile loop error"),
            }
        })
        .await;

    info!("Controller terminated");
}
