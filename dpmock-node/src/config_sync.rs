//! Picks the configuration for this node and feeds it to the engines.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use dpmock_api::{NodeResourceConfiguration, ResourceDescription, label_selector_matches};
use futures::StreamExt;
use kube::runtime::reflector::Store;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::engine_set::EngineSet;
use crate::supervise::supervise;

fn creation_order(a: &NodeResourceConfiguration, b: &NodeResourceConfiguration) -> CmpOrdering {
    let created = |c: &NodeResourceConfiguration| c.metadata.creation_timestamp.clone().map(|t| t.0);
    created(a)
        .cmp(&created(b))
        .then_with(|| a.metadata.uid.cmp(&b.metadata.uid))
}

/// The oldest configuration whose node selector matches `labels`.
///
/// Ties on creation time are broken by UID. Configurations with an invalid
/// selector are skipped.
pub fn select_configuration<'a>(
    configurations: &'a [Arc<NodeResourceConfiguration>],
    labels: &BTreeMap<String, String>,
) -> Option<&'a NodeResourceConfiguration> {
    let mut ordered: Vec<&NodeResourceConfiguration> =
        configurations.iter().map(|c| c.as_ref()).collect();
    ordered.sort_by(|a, b| creation_order(a, b));

    ordered.into_iter().find(|cfg| {
        match label_selector_matches(cfg.spec.node_selector.as_ref(), labels) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(configuration = %cfg.name_any(), error = %e, "Invalid node selector");
                false
            }
        }
    })
}

/// Resolved descriptions of `configuration` keyed by resource name. Later
/// entries win on duplicate names.
pub fn desired_descriptions(
    configuration: Option<&NodeResourceConfiguration>,
) -> BTreeMap<String, ResourceDescription> {
    configuration
        .and_then(|c| c.status.as_ref())
        .map(|s| {
            s.resource_descriptions
                .iter()
                .map(|d| (d.resource_name().to_string(), d.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Watches configurations and applies the one selecting this node.
pub struct ConfigSync {
    ctx: Arc<AppContext>,
    engines: Arc<EngineSet>,
    store: Store<NodeResourceConfiguration>,
    dirty: Arc<AtomicBool>,
}

impl ConfigSync {
    /// Start watching `api`. Every watch event marks the state dirty.
    pub fn start(
        ctx: Arc<AppContext>,
        api: Api<NodeResourceConfiguration>,
        engines: Arc<EngineSet>,
        cancel: &CancellationToken,
    ) -> Self {
        let (store, writer) = reflector::store();
        let dirty = Arc::new(AtomicBool::new(true));

        let watch_dirty = Arc::clone(&dirty);
        let watch = reflector(writer, watcher(api, watcher::Config::default()))
            .default_backoff()
            .for_each(move |event| {
                if let Err(e) = event {
                    warn!(error = %e, "Configuration watch error");
                }
                watch_dirty.store(true, Ordering::SeqCst);
                futures::future::ready(())
            });

        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watch => {}
                _ = cancel.cancelled() => {}
            }
        });

        Self::with_store(ctx, store, engines, dirty)
    }

    /// Build from an existing store, without a watch of its own.
    pub fn with_store(
        ctx: Arc<AppContext>,
        store: Store<NodeResourceConfiguration>,
        engines: Arc<EngineSet>,
        dirty: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ctx,
            engines,
            store,
            dirty,
        }
    }

    /// Mark the state as changed; the next tick resyncs.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Apply the matching configuration once, if anything changed.
    pub async fn sync_once(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.apply().await;
        if result.is_err() {
            self.mark_dirty();
        }
        result
    }

    async fn apply(&self) -> Result<()> {
        let labels = self
            .ctx
            .node
            .labels()
            .await
            .with_context(|| format!("Failed to read labels of node {}", self.ctx.node_name))?;

        let configurations = self.store.state();
        let selected = select_configuration(&configurations, &labels);
        match selected {
            Some(cfg) => debug!(configuration = %cfg.name_any(), "Applying configuration"),
            None => debug!("No configuration selects this node"),
        }

        let outcome = self.engines.reconcile(&desired_descriptions(selected)).await;
        if !outcome.is_noop() {
            info!(
                configuration = %selected.map(|c| c.name_any()).unwrap_or_default(),
                created = ?outcome.created,
                removed = ?outcome.removed,
                "Applied configuration"
            );
        }
        Ok(())
    }

    /// Tick every sync interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let sync = Arc::new(self);
        let interval = sync.ctx.timings.sync_interval;
        supervise("config-sync", interval, cancel, |token| {
            let sync = Arc::clone(&sync);
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return Ok::<(), anyhow::Error>(()),
                        _ = ticker.tick() => sync.sync_once().await?,
                    }
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{RecordingNodeClient, test_context};
    use dpmock_api::k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
    use dpmock_api::k8s_openapi::chrono::{TimeZone, Utc};
    use dpmock_api::{
        NodeResourceConfigurationSpec, NodeResourceConfigurationStatus, ResourceBasicDescription,
    };
    use kube::runtime::watcher::Event;

    fn configuration(
        name: &str,
        created_secs: i64,
        uid: &str,
        selector: Option<&[(&str, &str)]>,
        resources: &[&str],
    ) -> NodeResourceConfiguration {
        let mut cfg = NodeResourceConfiguration::new(
            name,
            NodeResourceConfigurationSpec {
                node_selector: selector.map(|pairs| LabelSelector {
                    match_labels: Some(
                        pairs
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                }),
                resources: vec![],
            },
        );
        cfg.metadata.uid = Some(uid.to_string());
        cfg.metadata.creation_timestamp =
            Some(Time(Utc.timestamp_opt(created_secs, 0).single().unwrap()));
        cfg.status = Some(NodeResourceConfigurationStatus {
            resource_descriptions: resources
                .iter()
                .map(|r| ResourceDescription {
                    basic: ResourceBasicDescription {
                        resource_name: r.to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        });
        cfg
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_oldest_match_wins() {
        let configs = vec![
            Arc::new(configuration("new", 200, "a", Some(&[("mock", "true")]), &[])),
            Arc::new(configuration("old", 100, "z", Some(&[("mock", "true")]), &[])),
            Arc::new(configuration("tie", 100, "b", Some(&[("mock", "true")]), &[])),
        ];
        let selected = select_configuration(&configs, &labels(&[("mock", "true")]));
        assert_eq!(selected.unwrap().name_any(), "tie");
    }

    #[test]
    fn test_missing_selector_never_matches() {
        let configs = vec![
            Arc::new(configuration("none", 100, "a", None, &[])),
            Arc::new(configuration("empty", 200, "b", Some(&[]), &[])),
        ];
        let selected = select_configuration(&configs, &labels(&[]));
        assert_eq!(selected.unwrap().name_any(), "empty");

        let configs = vec![Arc::new(configuration("none", 100, "a", None, &[]))];
        assert!(select_configuration(&configs, &labels(&[("a", "b")])).is_none());
    }

    #[test]
    fn test_desired_descriptions() {
        let cfg = configuration("cfg", 1, "a", None, &["gpu", "npu", "gpu"]);
        let desired = desired_descriptions(Some(&cfg));
        assert_eq!(desired.keys().collect::<Vec<_>>(), vec!["gpu", "npu"]);
        assert!(desired_descriptions(None).is_empty());
    }

    #[tokio::test]
    async fn test_sync_follows_store() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(RecordingNodeClient::new());
        node.set_labels(&[("mock", "true")]);
        let ctx = test_context(dir.path(), node.clone());
        let engines = Arc::new(EngineSet::new(Arc::clone(&ctx), CancellationToken::new()));

        let (store, mut writer) = reflector::store();
        let sync = ConfigSync::with_store(
            ctx,
            store,
            Arc::clone(&engines),
            Arc::new(AtomicBool::new(true)),
        );

        // Empty store tears everything down
        sync.sync_once().await.unwrap();
        assert!(engines.names().is_empty());

        let cfg = configuration("cfg", 1, "a", Some(&[("mock", "true")]), &["gpu", "npu"]);
        writer.apply_watcher_event(&Event::Apply(cfg.clone()));
        sync.sync_once().await.unwrap();
        // Not dirty, nothing happens
        assert!(engines.names().is_empty());

        sync.mark_dirty();
        sync.sync_once().await.unwrap();
        assert_eq!(engines.names(), vec!["gpu", "npu"]);

        node.set_labels(&[("mock", "false")]);
        sync.mark_dirty();
        sync.sync_once().await.unwrap();
        assert!(engines.names().is_empty());

        engines.shutdown().await;
    }
}
