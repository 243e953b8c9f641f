//! dpmock-controller: resolves NodeResourceConfiguration entries into the
//! resource descriptions node daemons consume.

pub mod controller;
pub mod error;
pub mod reconcile;
pub mod render;
pub mod resolver;

pub use error::{ReconcileError, ResolveError};
pub use reconcile::{reconcile_configuration, status_changed};
pub use render::{PatchRenderer, RenderError};
pub use resolver::{DEFAULT_DEVICE_PREFIX, NodeResourceLookup, Resolver, ResolverChain};
