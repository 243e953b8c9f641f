//! The set of resource engines running on this node.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use dpmock_api::ResourceDescription;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::context::AppContext;
use crate::engine::ResourceEngine;

/// Engines created and removed by one [`EngineSet::reconcile`] call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub created: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty()
    }
}

/// Resource engines keyed by resource name.
///
/// The map lock is only held while the map changes. Teardown of removed
/// engines happens after it is released.
pub struct EngineSet {
    ctx: Arc<AppContext>,
    cancel: CancellationToken,
    engines: Mutex<HashMap<String, ResourceEngine>>,
}

impl EngineSet {
    /// Engines started by this set run under children of `cancel`.
    pub fn new(ctx: Arc<AppContext>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            cancel,
            engines: Mutex::new(HashMap::new()),
        }
    }

    fn engines(&self) -> MutexGuard<'_, HashMap<String, ResourceEngine>> {
        self.engines.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the running engines match `desired`.
    pub async fn reconcile(
        &self,
        desired: &BTreeMap<String, ResourceDescription>,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        let removed: Vec<ResourceEngine> = {
            let mut engines = self.engines();

            let stale: Vec<String> = engines
                .keys()
                .filter(|name| !desired.contains_key(*name))
                .cloned()
                .collect();
            let removed = stale
                .iter()
                .filter_map(|name| engines.remove(name))
                .collect();

            for (name, description) in desired {
                let engine = engines.entry(name.clone()).or_insert_with(|| {
                    outcome.created.push(name.clone());
                    ResourceEngine::start(name.clone(), &self.ctx, &self.cancel)
                });
                engine.update(description);
            }

            removed
        };

        outcome.removed = removed.iter().map(|e| e.resource_name().to_string()).collect();
        outcome.removed.sort();
        for name in &outcome.removed {
            info!(resource = %name, "Removing resource engine");
        }
        join_all(removed.into_iter().map(ResourceEngine::stop)).await;

        if !outcome.is_noop() {
            info!(engines = ?self.names(), "Resource engines updated");
        }
        outcome
    }

    /// Names of the running engines, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn description(&self, name: &str) -> Option<Arc<ResourceDescription>> {
        self.engines().get(name).and_then(|e| e.description())
    }

    /// Stop every engine.
    pub async fn shutdown(&self) {
        let engines: Vec<ResourceEngine> = self.engines().drain().map(|(_, e)| e).collect();
        info!(engines = engines.len(), "Stopping resource engines");
        join_all(engines.into_iter().map(ResourceEngine::stop)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{RecordingNodeClient, test_context};
    use dpmock_api::ResourceBasicDescription;

    fn desired(entries: &[(&str, &str)]) -> BTreeMap<String, ResourceDescription> {
        entries
            .iter()
            .map(|(name, undo)| {
                let description = ResourceDescription {
                    basic: ResourceBasicDescription {
                        resource_name: name.to_string(),
                        ..Default::default()
                    },
                    node_undo_patch: undo.to_string(),
                    ..Default::default()
                };
                (name.to_string(), description)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(RecordingNodeClient::new());
        let set = EngineSet::new(test_context(dir.path(), node), CancellationToken::new());

        let want = desired(&[("a", ""), ("b", "")]);
        let first = set.reconcile(&want).await;
        assert_eq!(first.created, vec!["a", "b"]);
        assert!(first.removed.is_empty());

        let second = set.reconcile(&want).await;
        assert!(second.is_noop());
        assert_eq!(set.names(), vec!["a", "b"]);

        set.shutdown().await;
        assert!(set.names().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_replaces_and_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(RecordingNodeClient::new());
        let set = EngineSet::new(
            test_context(dir.path(), node.clone()),
            CancellationToken::new(),
        );

        set.reconcile(&desired(&[("a", r#"{"a":null}"#), ("b", "")])).await;
        let outcome = set.reconcile(&desired(&[("b", ""), ("c", "")])).await;
        assert_eq!(
            outcome,
            ReconcileOutcome {
                created: vec!["c".to_string()],
                removed: vec!["a".to_string()],
            }
        );
        assert_eq!(node.patches(), vec![r#"{"a":null}"#]);

        let outcome = set.reconcile(&BTreeMap::new()).await;
        assert_eq!(outcome.removed, vec!["b", "c"]);
        assert!(set.names().is_empty());
    }

    #[tokio::test]
    async fn test_existing_engine_gets_update() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(RecordingNodeClient::new());
        let set = EngineSet::new(test_context(dir.path(), node), CancellationToken::new());

        set.reconcile(&desired(&[("a", "")])).await;
        let outcome = set.reconcile(&desired(&[("a", r#"{"x":null}"#)])).await;
        assert!(outcome.is_noop());
        assert_eq!(set.description("a").unwrap().node_undo_patch, r#"{"x":null}"#);

        set.shutdown().await;
    }
}
