//! Lifecycle of one mock resource on this node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dpmock_api::{ResourceDescription, build_device_ids};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::device_plugin::PluginServer;
use crate::error::NodeError;
use crate::node::NodeClient;
use crate::supervise::supervise;

struct EngineState {
    resource_name: String,
    /// Replaced as a whole on every accepted update.
    description: RwLock<Option<Arc<ResourceDescription>>>,
    /// Set when `description` has not been pushed yet.
    dirty: AtomicBool,
    server: PluginServer,
    node: Arc<dyn NodeClient>,
}

impl EngineState {
    fn current(&self) -> Option<Arc<ResourceDescription>> {
        self.description
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn sync_once(&self) -> Result<(), NodeError> {
        let Some(description) = self.current() else {
            return Ok(());
        };

        let ids = build_device_ids(&description.basic.device_id_format);
        debug!(resource = %self.resource_name, devices = ids.len(), "Updating device IDs");
        self.server.update_device_ids(ids);

        if !description.node_patch.is_empty() {
            self.node.patch(&description.node_patch).await?;
            debug!(resource = %self.resource_name, patch = %description.node_patch, "Applied node patch");
        }
        Ok(())
    }

    async fn sync_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.dirty.swap(false, Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(e) = self.sync_once().await {
                        warn!(resource = %self.resource_name, error = %e, "Sync failed, retrying");
                        self.dirty.store(true, Ordering::SeqCst);
                    }
                }
            }
        }
    }
}

/// A running device plugin server plus the loops feeding it.
///
/// Created by [`ResourceEngine::start`], torn down by
/// [`ResourceEngine::stop`], which applies the undo patch of the last
/// accepted description.
pub struct ResourceEngine {
    state: Arc<EngineState>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    exit_timeout: Duration,
}

impl ResourceEngine {
    /// Spawn the serve and sync loops under a child of `parent`.
    pub fn start(
        resource_name: impl Into<String>,
        ctx: &AppContext,
        parent: &CancellationToken,
    ) -> Self {
        let resource_name = resource_name.into();
        let state = Arc::new(EngineState {
            server: PluginServer::new(resource_name.clone(), ctx),
            resource_name: resource_name.clone(),
            description: RwLock::new(None),
            dirty: AtomicBool::new(false),
            node: Arc::clone(&ctx.node),
        });
        let cancel = parent.child_token();

        let serve = {
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            let backoff = ctx.timings.serve_backoff;
            tokio::spawn(async move {
                let name = format!("serve {}", state.resource_name);
                supervise(&name, backoff, cancel, |token| {
                    let state = Arc::clone(&state);
                    async move { state.server.serve(token).await }
                })
                .await
            })
        };
        let sync = tokio::spawn(Arc::clone(&state).sync_loop(ctx.timings.sync_interval, cancel.clone()));

        info!(resource = %resource_name, socket = %state.server.socket_path().display(), "Resource engine started");

        Self {
            state,
            cancel,
            tasks: vec![serve, sync],
            exit_timeout: ctx.timings.exit_timeout,
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.state.resource_name
    }

    pub fn description(&self) -> Option<Arc<ResourceDescription>> {
        self.state.current()
    }

    /// Store `description` if it differs from the current one. Returns
    /// whether it was accepted.
    pub fn update(&self, description: &ResourceDescription) -> bool {
        let mut current = self
            .state
            .description
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if current.as_deref() == Some(description) {
            return false;
        }
        *current = Some(Arc::new(description.clone()));
        self.state.dirty.store(true, Ordering::SeqCst);
        true
    }

    /// Cancel both loops, wait for them, then apply the undo patch.
    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(resource = %self.state.resource_name, error = %e, "Engine task failed");
            }
        }

        if let Some(description) = self.state.current()
            && !description.node_undo_patch.is_empty()
        {
            let undo = self.state.node.patch(&description.node_undo_patch);
            match tokio::time::timeout(self.exit_timeout, undo).await {
                Ok(Ok(())) => info!(resource = %self.state.resource_name, "Applied node undo patch"),
                Ok(Err(e)) => {
                    error!(resource = %self.state.resource_name, error = %e, "Failed to apply node undo patch")
                }
                Err(_) => error!(resource = %self.state.resource_name, "Node undo patch timed out"),
            }
        }

        info!(resource = %self.state.resource_name, "Resource engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{RecordingNodeClient, test_context};
    use dpmock_api::{DeviceIdFormat, ResourceBasicDescription};
    use std::collections::BTreeMap;

    fn description(count: i32, patch: &str, undo: &str) -> ResourceDescription {
        ResourceDescription {
            basic: ResourceBasicDescription {
                resource_name: "example.com/gpu".to_string(),
                device_id_format: DeviceIdFormat {
                    prefix: BTreeMap::from([("dev".to_string(), count)]),
                    delimiter: "-".to_string(),
                    ordinal_start: 0,
                },
                ..Default::default()
            },
            node_patch: patch.to_string(),
            node_undo_patch: undo.to_string(),
        }
    }

    #[tokio::test]
    async fn test_update_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(RecordingNodeClient::new());
        let ctx = test_context(dir.path(), node.clone());
        let engine = ResourceEngine::start("example.com/gpu", &ctx, &CancellationToken::new());

        assert!(engine.update(&description(2, "", "")));
        assert!(!engine.update(&description(2, "", "")));
        assert!(engine.update(&description(3, "", "")));
        assert_eq!(
            engine.description().unwrap().basic.device_id_format.prefix["dev"],
            3
        );

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_sync_applies_patch_once_per_change() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(RecordingNodeClient::new());
        let ctx = test_context(dir.path(), node.clone());
        let engine = ResourceEngine::start("example.com/gpu", &ctx, &CancellationToken::new());

        engine.update(&description(2, r#"{"metadata":{"labels":{"a":"1"}}}"#, ""));
        assert!(node.wait_for_patches(1).await);
        tokio::time::sleep(ctx.timings.sync_interval * 3).await;
        assert_eq!(node.patches(), vec![r#"{"metadata":{"labels":{"a":"1"}}}"#]);

        engine.update(&description(2, r#"{"metadata":{"labels":{"a":"2"}}}"#, ""));
        assert!(node.wait_for_patches(2).await);

        engine.stop().await;
        // No undo patch configured
        assert_eq!(node.patches().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_sync_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(RecordingNodeClient::new());
        node.fail_next_patches(2);
        let ctx = test_context(dir.path(), node.clone());
        let engine = ResourceEngine::start("example.com/gpu", &ctx, &CancellationToken::new());

        engine.update(&description(1, r#"{"metadata":{}}"#, ""));
        assert!(node.wait_for_patches(1).await);
        assert_eq!(node.failed_patches(), 2);

        engine.stop().await;
    }

    #[tokio::test]
    async fn test_stop_applies_undo_once() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(RecordingNodeClient::new());
        let ctx = test_context(dir.path(), node.clone());
        let parent = CancellationToken::new();
        let engine = ResourceEngine::start("example.com/gpu", &ctx, &parent);

        engine.update(&description(1, "", r#"{"metadata":{"labels":{"a":null}}}"#));

        // Ambient cancellation first, teardown still runs the undo
        parent.cancel();
        engine.stop().await;
        assert_eq!(node.patches(), vec![r#"{"metadata":{"labels":{"a":null}}}"#]);
    }

    #[tokio::test]
    async fn test_stop_without_description() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(RecordingNodeClient::new());
        let ctx = test_context(dir.path(), node.clone());
        let engine = ResourceEngine::start("example.com/gpu", &ctx, &CancellationToken::new());
        engine.stop().await;
        assert!(node.patches().is_empty());
    }
}
