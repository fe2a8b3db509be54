//! KDL configuration parsing for repobuild.
//!
//! This crate handles:
//! - Cluster settings for build pods
//! - Garbage collector settings
//! - Loading both from a `repobuild.kdl` file

pub mod cluster;
pub mod error;
pub mod gc;
pub mod system;

pub use cluster::ClusterClientConfig;
pub use error::{ConfigError, ConfigResult};
pub use gc::GcConfig;
pub use system::{SystemConfig, load_system_config, parse_system_config};
