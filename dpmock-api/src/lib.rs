//! dpmock-api: object types and helpers shared by the dpmock controller and
//! the node daemon.

pub mod device_id;
pub mod quantity;
pub mod selector;
pub mod types;

pub use device_id::build_device_ids;
pub use quantity::{QuantityError, quantity_as_i64, quantity_from_i64};
pub use selector::{SelectorError, label_selector_matches};
pub use types::*;

// Re-export so dependents build against the same versions
pub use k8s_openapi;
pub use kube;
