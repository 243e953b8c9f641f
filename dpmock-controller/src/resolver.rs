//! Resolution of configuration entries into resource descriptions.
//!
//! The chain tries each [`Resolver`] in a fixed order. A resolver answering
//! [`ResolveError::Unsupported`] passes the entry on to the next one; any
//! other error stops the chain for that entry.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use dpmock_api::{
    DeviceIdFormat, DeviceIdGeneratePolicy, NodeResource, NodeResourceConfiguration,
    PrefixGeneratePolicy, ResourceBasicDescription, ResourceDescription, ResourceRequirement,
    build_device_ids, quantity_as_i64, quantity_from_i64,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::Api;
use tracing::debug;

use crate::error::ResolveError;
use crate::render::PatchRenderer;

/// Prefix used for resources named directly in a configuration.
pub const DEFAULT_DEVICE_PREFIX: &str = "dev";

/// Read-only access to NodeResource objects.
#[async_trait]
pub trait NodeResourceLookup: Send + Sync {
    /// Returns `Ok(None)` if the object does not exist.
    async fn node_resource(&self, name: &str) -> Result<Option<NodeResource>, kube::Error>;
}

#[async_trait]
impl NodeResourceLookup for Api<NodeResource> {
    async fn node_resource(&self, name: &str) -> Result<Option<NodeResource>, kube::Error> {
        self.get_opt(name).await
    }
}

#[async_trait]
impl NodeResourceLookup for HashMap<String, NodeResource> {
    async fn node_resource(&self, name: &str) -> Result<Option<NodeResource>, kube::Error> {
        Ok(self.get(name).cloned())
    }
}

/// Resolver strategies, in the order the default chain tries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolver {
    /// Entries naming a resource inline.
    Name,
    /// Entries referencing a NodeResource, with one level of cascade.
    NodeResourceRef,
}

impl Resolver {
    pub fn name(&self) -> &'static str {
        match self {
            Resolver::Name => "name-resolver",
            Resolver::NodeResourceRef => "node-resource-resolver",
        }
    }
}

/// Ordered resolver chain.
pub struct ResolverChain<L> {
    resolvers: Vec<Resolver>,
    lookup: L,
    renderer: PatchRenderer,
}

impl<L: NodeResourceLookup> ResolverChain<L> {
    pub fn new(lookup: L) -> Self {
        Self::with_resolvers(lookup, vec![Resolver::Name, Resolver::NodeResourceRef])
    }

    pub fn with_resolvers(lookup: L, resolvers: Vec<Resolver>) -> Self {
        Self {
            resolvers,
            lookup,
            renderer: PatchRenderer::new(),
        }
    }

    /// Resolve entry `index` of `configuration`.
    ///
    /// `resolved` holds the descriptions produced earlier in the same pass.
    /// Cascading entries look their parent up there first and then in the
    /// configuration's persisted status.
    pub async fn resolve(
        &self,
        configuration: &NodeResourceConfiguration,
        index: usize,
        resolved: &[ResourceDescription],
    ) -> Result<ResourceDescription, ResolveError> {
        let entry = configuration
            .spec
            .resources
            .get(index)
            .ok_or(ResolveError::IndexOutOfRange(index))?;

        for resolver in &self.resolvers {
            let result = match resolver {
                Resolver::Name => self.resolve_by_name(entry),
                Resolver::NodeResourceRef => {
                    self.resolve_by_reference(configuration, entry, resolved)
                        .await
                }
            };
            match result {
                Err(e) if e.is_unsupported() => {
                    debug!(resolver = resolver.name(), index, reason = %e, "Resolver skipped entry");
                }
                Err(e) => return Err(e),
                Ok(description) => {
                    debug!(
                        resolver = resolver.name(),
                        index,
                        resource = %description.resource_name(),
                        "Resolved resource entry"
                    );
                    return Ok(description);
                }
            }
        }

        Err(ResolveError::Unsupported(format!(
            "no resolver accepts resource entry {}",
            index
        )))
    }

    fn resolve_by_name(
        &self,
        entry: &ResourceRequirement,
    ) -> Result<ResourceDescription, ResolveError> {
        if entry.info.resource_name.is_empty() || entry.info.resource_ref.is_some() {
            return Err(ResolveError::Unsupported(
                "entry does not name a resource inline".to_string(),
            ));
        }

        let capacity = entry.capacity.as_ref().ok_or_else(|| {
            ResolveError::Invalid(format!(
                "capacity of {} must be set",
                entry.info.resource_name
            ))
        })?;
        let count = as_count(capacity)?;

        let basic = ResourceBasicDescription {
            resource_name: entry.info.resource_name.clone(),
            capacity: capacity.clone(),
            device_id_format: DeviceIdFormat {
                prefix: BTreeMap::from([(DEFAULT_DEVICE_PREFIX.to_string(), count)]),
                ..Default::default()
            },
        };

        self.describe(basic, &entry.node_patch_template, &entry.node_undo_patch)
    }

    async fn resolve_by_reference(
        &self,
        configuration: &NodeResourceConfiguration,
        entry: &ResourceRequirement,
        resolved: &[ResourceDescription],
    ) -> Result<ResourceDescription, ResolveError> {
        let reference = entry
            .info
            .resource_ref
            .as_ref()
            .filter(|r| r.is_node_resource())
            .ok_or_else(|| {
                ResolveError::Unsupported("entry does not reference a NodeResource".to_string())
            })?;

        let node_resource = self.get_node_resource(&reference.name).await?;
        let spec = &node_resource.spec;
        let policy = spec.device_id_generate_policy.clone().unwrap_or_default();

        let prefixes = self
            .prefixes(&reference.name, &policy, configuration, resolved)
            .await?;

        let zero = Quantity("0".to_string());
        let capacity = entry
            .capacity
            .as_ref()
            .or(spec.default_capacity.as_ref())
            .unwrap_or(&zero);
        let per_prefix = as_count(capacity)?;

        let prefix: BTreeMap<String, i32> = prefixes.into_iter().map(|p| (p, per_prefix)).collect();
        let total = i64::from(per_prefix)
            .checked_mul(prefix.len() as i64)
            .ok_or_else(|| ResolveError::Invalid("total capacity overflows".to_string()))?;

        let basic = ResourceBasicDescription {
            resource_name: spec.resource_name.clone(),
            capacity: quantity_from_i64(total),
            device_id_format: DeviceIdFormat {
                prefix,
                delimiter: policy.delimiter.clone(),
                ordinal_start: policy.ordinal_start,
            },
        };

        let patch_template = non_empty_or(&entry.node_patch_template, &spec.default_node_patch_template);
        let undo_template = non_empty_or(&entry.node_undo_patch, &spec.default_node_undo_patch);
        self.describe(basic, patch_template, undo_template)
    }

    /// Prefix list of a NodeResource under `policy`.
    async fn prefixes(
        &self,
        name: &str,
        policy: &DeviceIdGeneratePolicy,
        configuration: &NodeResourceConfiguration,
        resolved: &[ResourceDescription],
    ) -> Result<Vec<String>, ResolveError> {
        match &policy.prefix {
            Some(prefix) if !prefix.static_prefixes.is_empty() => {
                Ok(prefix.static_prefixes.clone())
            }
            Some(PrefixGeneratePolicy {
                parent_resource_ref: Some(parent),
                ..
            }) => {
                if !parent.is_node_resource() {
                    return Err(ResolveError::Unsupported(format!(
                        "parent of {} is not a NodeResource",
                        name
                    )));
                }

                let parent = self.get_node_resource(&parent.name).await?;
                let parent_cascades = parent
                    .spec
                    .device_id_generate_policy
                    .as_ref()
                    .and_then(|p| p.prefix.as_ref())
                    .is_some_and(|p| p.parent_resource_ref.is_some());
                if parent_cascades {
                    return Err(ResolveError::Unsupported(format!(
                        "NodeResource {} cascades through a parent that cascades itself",
                        name
                    )));
                }

                let parent_name = &parent.spec.resource_name;
                let persisted = configuration
                    .status
                    .iter()
                    .flat_map(|s| s.resource_descriptions.iter());
                let parent_description = resolved
                    .iter()
                    .chain(persisted)
                    .find(|d| d.resource_name() == parent_name);

                // Parent not resolved yet: no prefixes until a later pass.
                Ok(parent_description
                    .map(|d| build_device_ids(&d.basic.device_id_format))
                    .unwrap_or_default())
            }
            _ => Err(ResolveError::Invalid(format!(
                "NodeResource {} has an empty prefix generate policy",
                name
            ))),
        }
    }

    /// Not-found is reported as unsupported: the object may appear later.
    async fn get_node_resource(&self, name: &str) -> Result<NodeResource, ResolveError> {
        match self.lookup.node_resource(name).await {
            Ok(Some(node_resource)) => Ok(node_resource),
            Ok(None) => Err(ResolveError::Unsupported(format!(
                "NodeResource {} not found",
                name
            ))),
            Err(source) => Err(ResolveError::Lookup {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn describe(
        &self,
        basic: ResourceBasicDescription,
        patch_template: &str,
        undo_template: &str,
    ) -> Result<ResourceDescription, ResolveError> {
        let node_patch = self.renderer.render(patch_template, &basic)?;
        let node_undo_patch = self.renderer.render(undo_template, &basic)?;
        Ok(ResourceDescription {
            basic,
            node_patch,
            node_undo_patch,
        })
    }
}

fn as_count(quantity: &Quantity) -> Result<i32, ResolveError> {
    let value = quantity_as_i64(quantity)?;
    i32::try_from(value)
        .map_err(|_| ResolveError::Invalid(format!("capacity {} out of range", value)))
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() { fallback } else { value }
}
