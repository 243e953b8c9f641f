//! One resolution pass over a NodeResourceConfiguration.

use dpmock_api::{NodeResourceConfiguration, ResourceDescription};
use kube::ResourceExt;
use tracing::{error, warn};

use crate::error::ResolveError;
use crate::resolver::{NodeResourceLookup, ResolverChain};

/// Resolve every entry of `configuration`, left to right.
///
/// Unsupported entries are skipped and malformed ones are excluded, in both
/// cases without affecting the others. A failed object lookup aborts the
/// pass, so a flaky API server never shrinks the published list.
pub async fn reconcile_configuration<L: NodeResourceLookup>(
    chain: &ResolverChain<L>,
    configuration: &NodeResourceConfiguration,
) -> Result<Vec<ResourceDescription>, ResolveError> {
    let name = configuration.name_any();
    let mut resolved = Vec::with_capacity(configuration.spec.resources.len());

    for index in 0..configuration.spec.resources.len() {
        match chain.resolve(configuration, index, &resolved).await {
            Ok(description) => resolved.push(description),
            Err(e) if e.is_unsupported() => {
                warn!(configuration = %name, index, reason = %e, "Skipping unsupported resource entry");
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                error!(configuration = %name, index, error = %e, "Excluding invalid resource entry");
            }
        }
    }

    Ok(resolved)
}

/// Whether `descriptions` differ from what the configuration's status holds.
pub fn status_changed(
    configuration: &NodeResourceConfiguration,
    descriptions: &[ResourceDescription],
) -> bool {
    let current = configuration
        .status
        .as_ref()
        .map(|s| s.resource_descriptions.as_slice())
        .unwrap_or_default();
    current != descriptions
}
