//! Settings for the build pod garbage collector.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cluster::{DEFAULT_COMPONENT_LABEL, default_namespace};
use crate::{ConfigError, ConfigResult};

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(4 * 3600);
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcConfig {
    /// Namespace swept for build pods.
    pub namespace: String,
    /// Builds started longer ago than this are deleted whatever their phase.
    /// Zero disables the age check.
    pub max_age: Duration,
    /// Time between sweeps.
    pub interval: Duration,
    /// Value of the `component` label identifying build pods.
    pub component_label: String,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            max_age: DEFAULT_MAX_AGE,
            interval: DEFAULT_GC_INTERVAL,
            component_label: DEFAULT_COMPONENT_LABEL.to_string(),
        }
    }
}

impl GcConfig {
    pub fn build_selector(&self) -> String {
        format!("component={}", self.component_label)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.namespace.is_empty() {
            return Err(ConfigError::MissingField("gc namespace".to_string()));
        }
        if self.component_label.is_empty() {
            return Err(ConfigError::MissingField("gc component-label".to_string()));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("gc interval", "must be positive"));
        }
        Ok(())
    }
}
