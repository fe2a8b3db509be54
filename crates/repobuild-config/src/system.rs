//! System configuration parsing.
//!
//! A configuration file has up to two top-level blocks:
//!
//! ```kdl
//! cluster {
//!     namespace "binder"
//!     memory-limit "2G"
//!     sticky-builds #true
//!     node-selector { "kubernetes.io/os" "linux" }
//! }
//! gc {
//!     max-age 14400
//! }
//! ```
//!
//! Missing blocks and missing fields take their defaults. The `gc` block
//! inherits `namespace` and `component-label` from `cluster` unless it sets
//! its own.

use kdl::{KdlDocument, KdlNode, KdlValue};
use repobuild_core::ByteSize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::cluster::ClusterClientConfig;
use crate::gc::GcConfig;
use crate::{ConfigError, ConfigResult};

/// System-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub cluster: ClusterClientConfig,
    pub gc: GcConfig,
}

/// Read and parse a configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut cluster_node = None;
    let mut gc_node = None;

    for node in doc.nodes() {
        match node.name().value() {
            "cluster" => {
                if cluster_node.replace(node).is_some() {
                    return Err(ConfigError::Duplicate("cluster".to_string()));
                }
            }
            "gc" => {
                if gc_node.replace(node).is_some() {
                    return Err(ConfigError::Duplicate("gc".to_string()));
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let cluster = match cluster_node {
        Some(node) => parse_cluster(node)?,
        None => ClusterClientConfig::default(),
    };
    let gc = parse_gc(gc_node, &cluster)?;

    cluster.validate()?;
    gc.validate()?;

    Ok(SystemConfig { cluster, gc })
}

fn parse_cluster(node: &KdlNode) -> ConfigResult<ClusterClientConfig> {
    let mut config = ClusterClientConfig::default();

    let Some(children) = node.children() else {
        return Ok(config);
    };

    for child in children.nodes() {
        let field = child.name().value();
        match field {
            "namespace" => config.namespace = required_string(child, field)?,
            "build-image" => config.build_image = required_string(child, field)?,
            "builder-command" => config.builder_command = required_string(child, field)?,
            "docker-host" => config.docker_host = nullable_string(child, field)?,
            "push-secret" => config.push_secret = nullable_string(child, field)?,
            "image-pull-secrets" => config.image_pull_secrets = get_all_string_args(child),
            "memory-limit" => config.memory_limit = Some(byte_size(child, field)?),
            "memory-request" => config.memory_request = Some(byte_size(child, field)?),
            "cpu-request" => config.cpu_request = Some(required_string(child, field)?),
            "log-tail-lines" => {
                let lines = non_negative(child, field)?;
                config.log_tail_lines = u32::try_from(lines)
                    .map_err(|_| ConfigError::invalid(field, "value too large"))?;
            }
            "watch-timeout" => config.watch_timeout = seconds(child, field)?,
            "sticky-builds" => config.sticky_builds = required_bool(child, field)?,
            "placement-selector" => config.placement_selector = required_string(child, field)?,
            "component-label" => config.component_label = required_string(child, field)?,
            "node-selector" => config.node_selector = string_map(child)?,
            "env" => config.extra_env = string_map(child)?,
            "registry-credentials" => config.registry_credentials = string_map(child)?,
            _ => {}
        }
    }

    Ok(config)
}

fn parse_gc(node: Option<&KdlNode>, cluster: &ClusterClientConfig) -> ConfigResult<GcConfig> {
    let mut config = GcConfig {
        namespace: cluster.namespace.clone(),
        component_label: cluster.component_label.clone(),
        ..GcConfig::default()
    };

    let Some(children) = node.and_then(|n| n.children()) else {
        return Ok(config);
    };

    for child in children.nodes() {
        let field = child.name().value();
        match field {
            "namespace" => config.namespace = required_string(child, field)?,
            "component-label" => config.component_label = required_string(child, field)?,
            "max-age" => config.max_age = seconds(child, field)?,
            "interval" => config.interval = seconds(child, field)?,
            _ => {}
        }
    }

    Ok(config)
}

// Helper functions for extracting values from KDL nodes

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn required_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::invalid(field, "expected a string"))
}

/// A string that may be set to `#null` to switch the feature off.
fn nullable_string(node: &KdlNode, field: &str) -> ConfigResult<Option<String>> {
    match first_arg(node) {
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_string()
            .map(|s| Some(s.to_string()).filter(|s| !s.is_empty()))
            .ok_or_else(|| ConfigError::invalid(field, "expected a string or #null")),
        None => Err(ConfigError::invalid(field, "expected a string or #null")),
    }
}

fn required_bool(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    first_arg(node)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| ConfigError::invalid(field, "expected #true or #false"))
}

fn non_negative(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = first_arg(node)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| ConfigError::invalid(field, "expected an integer"))?;
    u64::try_from(value).map_err(|_| ConfigError::invalid(field, "must not be negative"))
}

fn seconds(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    non_negative(node, field).map(Duration::from_secs)
}

/// Byte sizes may be given as a plain integer or a string such as `"2G"`.
fn byte_size(node: &KdlNode, field: &str) -> ConfigResult<ByteSize> {
    let value = first_arg(node).ok_or_else(|| ConfigError::invalid(field, "missing value"))?;
    if let Some(bytes) = value.as_integer() {
        return u64::try_from(bytes)
            .map(ByteSize::from_bytes)
            .map_err(|_| ConfigError::invalid(field, "must not be negative"));
    }
    let text = value
        .as_string()
        .ok_or_else(|| ConfigError::invalid(field, "expected a byte size"))?;
    text.parse()
        .map_err(|e: repobuild_core::Error| ConfigError::invalid(field, e.to_string()))
}

/// Children of the form `key "value"` collected into a map.
fn string_map(node: &KdlNode) -> ConfigResult<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            let value = required_string(child, &key)?;
            if map.insert(key.clone(), value).is_some() {
                return Err(ConfigError::Duplicate(key));
            }
        }
    }
    Ok(map)
}
