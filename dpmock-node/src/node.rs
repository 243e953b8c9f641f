//! Access to the local node object.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::Value;

use crate::error::NodeError;

/// Operations the daemon performs on its own node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Current labels of the node.
    async fn labels(&self) -> Result<BTreeMap<String, String>, NodeError>;

    /// Apply a strategic merge patch given as JSON text.
    async fn patch(&self, patch: &str) -> Result<(), NodeError>;

    /// Apply a strategic merge patch to the node's status subresource.
    async fn patch_status(&self, patch: &Value) -> Result<(), NodeError>;
}

/// [`NodeClient`] backed by the Kubernetes API.
pub struct KubeNodeClient {
    api: Api<Node>,
    name: String,
}

impl KubeNodeClient {
    pub fn new(client: Client, name: impl Into<String>) -> Self {
        Self {
            api: Api::all(client),
            name: name.into(),
        }
    }
}

#[async_trait]
impl NodeClient for KubeNodeClient {
    async fn labels(&self) -> Result<BTreeMap<String, String>, NodeError> {
        let node = self.api.get(&self.name).await.map_err(|source| NodeError::Get {
            name: self.name.clone(),
            source,
        })?;
        Ok(node.labels().clone())
    }

    async fn patch(&self, patch: &str) -> Result<(), NodeError> {
        let value: Value = serde_json::from_str(patch).map_err(NodeError::InvalidPatch)?;
        self.api
            .patch(&self.name, &PatchParams::default(), &Patch::Strategic(value))
            .await
            .map_err(|source| NodeError::Patch {
                name: self.name.clone(),
                source,
            })?;
        Ok(())
    }

    async fn patch_status(&self, patch: &Value) -> Result<(), NodeError> {
        self.api
            .patch_status(&self.name, &PatchParams::default(), &Patch::Strategic(patch))
            .await
            .map_err(|source| NodeError::Patch {
                name: self.name.clone(),
                source,
            })?;
        Ok(())
    }
}
