//! dpmock-node: advertises mock extended resources on one node.
//!
//! Every resolved resource description selected for this node gets a
//! [`ResourceEngine`]: a kubelet device plugin server advertising the
//! description's device IDs, plus a loop applying its node patch.

pub mod config_sync;
pub mod context;
pub mod device_plugin;
pub mod engine;
pub mod engine_set;
pub mod error;
pub mod node;
pub mod proto;
pub mod supervise;
pub mod test_util;

pub use config_sync::{ConfigSync, desired_descriptions, select_configuration};
pub use context::{AppContext, PluginConfig, Timings};
pub use device_plugin::PluginServer;
pub use engine::ResourceEngine;
pub use engine_set::{EngineSet, ReconcileOutcome};
pub use error::{NodeError, PluginError};
pub use node::{KubeNodeClient, NodeClient};
