//! Controller error types.

use dpmock_api::QuantityError;
use thiserror::Error;

use crate::render::RenderError;

/// Errors from resolving one configuration entry.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The entry has a shape this resolver (or the whole chain) does not
    /// handle. Never fatal: the entry is skipped.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("resource entry {0} out of range")]
    IndexOutOfRange(usize),

    /// The entry or its referenced objects are malformed.
    #[error("invalid resource entry: {0}")]
    Invalid(String),

    #[error("invalid capacity: {0}")]
    Capacity(#[from] QuantityError),

    #[error(transparent)]
    Render(#[from] RenderError),

    /// Reading a referenced object failed for a reason other than absence.
    #[error("failed to get NodeResource {name}: {source}")]
    Lookup {
        name: String,
        #[source]
        source: kube::Error,
    },
}

impl ResolveError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ResolveError::Unsupported(_))
    }

    /// Worth retrying the whole pass later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::Lookup { .. })
    }
}

/// Errors from one reconcile of a NodeResourceConfiguration.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to update status of {name}: {source}")]
    StatusUpdate {
        name: String,
        #[source]
        source: kube::Error,
    },
}
