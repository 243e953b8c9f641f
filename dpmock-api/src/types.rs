//! NodeResource and NodeResourceConfiguration object types.
//!
//! Both objects are cluster scoped. Wire names follow the published
//! `dpmock.volcano.sh/v1alpha1` schema, so several fields carry explicit
//! renames where the acronym casing (`deviceID...`) differs from what
//! `rename_all = "camelCase"` would produce.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the dpmock objects.
pub const GROUP: &str = "dpmock.volcano.sh";

/// Kind name a [`ResourceReference`] must carry to be resolvable.
pub const NODE_RESOURCE_KIND: &str = "NodeResource";

/// Typed pointer to another declared object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    /// Group of the referenced object.
    #[serde(default)]
    pub api_group: String,
    /// Kind of the referenced object.
    #[serde(default)]
    pub kind: String,
    /// Name of the referenced object.
    #[serde(default)]
    pub name: String,
}

impl ResourceReference {
    pub fn node_resource(name: impl Into<String>) -> Self {
        Self {
            api_group: GROUP.to_string(),
            kind: NODE_RESOURCE_KIND.to_string(),
            name: name.into(),
        }
    }

    /// Only NodeResource references within our own group can be followed.
    pub fn is_node_resource(&self) -> bool {
        self.api_group == GROUP && self.kind == NODE_RESOURCE_KIND
    }
}

/// Returns true if `reference` is set and points at a NodeResource.
pub fn is_node_resource_reference(reference: Option<&ResourceReference>) -> bool {
    reference.is_some_and(ResourceReference::is_node_resource)
}

/// How the prefixes of the device ID serial are generated.
///
/// One of the two fields is expected to be set. When both are, a non-empty
/// static list takes precedence.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrefixGeneratePolicy {
    /// Fixed list of prefixes.
    #[serde(default, rename = "static", skip_serializing_if = "Vec::is_empty")]
    pub static_prefixes: Vec<String>,

    /// Use every device ID of the referenced parent resource as a prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_resource_ref: Option<ResourceReference>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdGeneratePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<PrefixGeneratePolicy>,

    /// Joins prefix and ordinal.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub delimiter: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub ordinal_start: i32,
}

/// Spec of a NodeResource: one mockable resource and its defaults.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dpmock.volcano.sh",
    version = "v1alpha1",
    kind = "NodeResource",
    shortname = "nr"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeResourceSpec {
    /// Extended resource name advertised to the node agent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_name: String,

    #[serde(
        default,
        rename = "deviceIDGeneratePolicy",
        skip_serializing_if = "Option::is_none"
    )]
    pub device_id_generate_policy: Option<DeviceIdGeneratePolicy>,

    /// Capacity per prefix when the configuration entry gives none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_capacity: Option<Quantity>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_node_patch_template: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_node_undo_patch: String,
}

/// What a configuration entry mocks: either an inline name or a reference.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<ResourceReference>,
}

/// One entry of a NodeResourceConfiguration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirement {
    #[serde(flatten)]
    pub info: ResourceInfo,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Quantity>,

    /// Template rendered against the resolved [`ResourceBasicDescription`].
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_patch_template: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_undo_patch: String,
}

impl ResourceRequirement {
    pub fn named(name: impl Into<String>, capacity: Quantity) -> Self {
        Self {
            info: ResourceInfo {
                resource_name: name.into(),
                resource_ref: None,
            },
            capacity: Some(capacity),
            ..Default::default()
        }
    }

    pub fn referencing(reference: ResourceReference) -> Self {
        Self {
            info: ResourceInfo {
                resource_name: String::new(),
                resource_ref: Some(reference),
            },
            ..Default::default()
        }
    }
}

/// Spec of a NodeResourceConfiguration.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "dpmock.volcano.sh",
    version = "v1alpha1",
    kind = "NodeResourceConfiguration",
    shortname = "nrcfg",
    status = "NodeResourceConfigurationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NodeResourceConfigurationSpec {
    /// Nodes this configuration applies to. Unset selects no node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceRequirement>,
}

/// Final format of a device ID serial.
///
/// `{prefix: {"dev0": 2, "dev1": 2}, delimiter: "-", ordinalStart: 0}` yields
/// `dev0-0, dev0-1, dev1-0, dev1-1`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdFormat {
    /// Prefix to number of IDs under that prefix.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prefix: BTreeMap<String, i32>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub delimiter: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub ordinal_start: i32,
}

/// The part of a description that node patch templates are rendered against.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBasicDescription {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_name: String,

    #[serde(default)]
    pub capacity: Quantity,

    #[serde(default, rename = "deviceIDFormat")]
    pub device_id_format: DeviceIdFormat,
}

/// Fully resolved form of one configuration entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescription {
    #[serde(flatten)]
    pub basic: ResourceBasicDescription,

    /// Rendered apply patch as JSON. Empty means nothing to apply.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_patch: String,

    /// Rendered undo patch as JSON. Empty means nothing to undo.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_undo_patch: String,
}

impl ResourceDescription {
    pub fn resource_name(&self) -> &str {
        &self.basic.resource_name
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeResourceConfigurationStatus {
    /// Resolution results, in configuration entry order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_descriptions: Vec<ResourceDescription>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub number_desired: i32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub number_available: i32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub number_synchronized: i32,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}
