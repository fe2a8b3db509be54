//! Settings for running builds on the cluster.

use repobuild_core::{BuildSpec, BuildSpecBuilder, ByteSize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use crate::{ConfigError, ConfigResult};

pub const DEFAULT_BUILD_IMAGE: &str = "quay.io/jupyterhub/repo2docker:2024.07.0";
pub const DEFAULT_BUILDER_COMMAND: &str = "jupyter-repo2docker";
pub const DEFAULT_DOCKER_HOST: &str = "/var/run/docker.sock";
pub const DEFAULT_PUSH_SECRET: &str = "binder-build-docker-config";
pub const DEFAULT_COMPONENT_LABEL: &str = "repobuild-build";
pub const DEFAULT_PLACEMENT_SELECTOR: &str = "component=image-builder";
pub const DEFAULT_LOG_TAIL_LINES: u32 = 100;
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(30);
/// The API server caps watch timeouts just below five minutes.
pub const MAX_WATCH_TIMEOUT: Duration = Duration::from_secs(290);

/// Namespace to use when none is configured.
pub fn default_namespace() -> String {
    std::env::var("BUILD_NAMESPACE").unwrap_or_else(|_| "default".to_string())
}

/// How build pods are created and observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterClientConfig {
    /// Namespace build pods are created in.
    pub namespace: String,
    /// Image containing the build tool.
    pub build_image: String,
    /// Build tool executable, passed as the first container argument.
    pub builder_command: String,
    /// Docker daemon socket mounted into the pod, as a path or `unix://` URL.
    /// `None` disables the mount.
    pub docker_host: Option<String>,
    /// Secret holding a docker config used for pushing.
    pub push_secret: Option<String>,
    /// Pull secrets for the build image.
    pub image_pull_secrets: Vec<String>,
    /// Registry credentials handed to the build tool as JSON. When set they
    /// replace `push_secret`.
    pub registry_credentials: BTreeMap<String, String>,
    pub memory_limit: Option<ByteSize>,
    pub memory_request: Option<ByteSize>,
    pub cpu_request: Option<String>,
    pub node_selector: BTreeMap<String, String>,
    /// Environment variables added to every build.
    pub extra_env: BTreeMap<String, String>,
    /// Lines of backlog fetched when attaching to a build's logs.
    pub log_tail_lines: u32,
    /// Server-side timeout of each watch request.
    pub watch_timeout: Duration,
    /// Prefer the same node for repeated builds of one repository.
    pub sticky_builds: bool,
    /// Selects the pods whose nodes are candidates for sticky placement.
    pub placement_selector: String,
    /// Value of the `component` label on build pods.
    pub component_label: String,
}

impl Default for ClusterClientConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            build_image: DEFAULT_BUILD_IMAGE.to_string(),
            builder_command: DEFAULT_BUILDER_COMMAND.to_string(),
            docker_host: Some(DEFAULT_DOCKER_HOST.to_string()),
            push_secret: Some(DEFAULT_PUSH_SECRET.to_string()),
            image_pull_secrets: Vec::new(),
            registry_credentials: BTreeMap::new(),
            memory_limit: None,
            memory_request: None,
            cpu_request: None,
            node_selector: BTreeMap::new(),
            extra_env: BTreeMap::new(),
            log_tail_lines: DEFAULT_LOG_TAIL_LINES,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
            sticky_builds: false,
            placement_selector: DEFAULT_PLACEMENT_SELECTOR.to_string(),
            component_label: DEFAULT_COMPONENT_LABEL.to_string(),
        }
    }
}

impl ClusterClientConfig {
    /// Label selector matching every build pod.
    pub fn build_selector(&self) -> String {
        format!("component={}", self.component_label)
    }

    /// Filesystem path of the docker socket on the node, if mounted.
    pub fn docker_socket_path(&self) -> Option<String> {
        self.docker_host.as_deref().and_then(socket_path)
    }

    /// Start a [`BuildSpec`] carrying this cluster's defaults for
    /// resources, push credentials and environment.
    pub fn spec_builder(
        &self,
        repo_url: impl Into<String>,
        git_ref: impl Into<String>,
        image_name: impl Into<String>,
    ) -> BuildSpecBuilder {
        let mut builder = BuildSpec::builder(repo_url, git_ref, image_name)
            .envs(self.extra_env.clone());
        if let Some(limit) = self.memory_limit {
            builder = builder.memory_limit(limit);
        }
        if let Some(request) = self.memory_request {
            builder = builder.memory_request(request);
        }
        if let Some(ref cpu) = self.cpu_request {
            builder = builder.cpu_request(cpu.clone());
        }
        if let Some(ref secret) = self.push_secret {
            builder = builder.push_secret(secret.clone());
        }
        builder.registry_credentials(self.registry_credentials.clone())
    }

    /// Check invariants that parsing alone does not enforce.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.namespace.is_empty() {
            return Err(ConfigError::MissingField("cluster namespace".to_string()));
        }
        if self.build_image.is_empty() {
            return Err(ConfigError::MissingField("cluster build-image".to_string()));
        }
        if self.builder_command.is_empty() {
            return Err(ConfigError::MissingField(
                "cluster builder-command".to_string(),
            ));
        }
        if self.component_label.is_empty() {
            return Err(ConfigError::MissingField(
                "cluster component-label".to_string(),
            ));
        }
        if self.watch_timeout.is_zero() || self.watch_timeout > MAX_WATCH_TIMEOUT {
            return Err(ConfigError::invalid(
                "watch-timeout",
                format!(
                    "must be between 1 and {} seconds",
                    MAX_WATCH_TIMEOUT.as_secs()
                ),
            ));
        }
        if let Some(ref host) = self.docker_host {
            if socket_path(host).is_none() {
                return Err(ConfigError::invalid(
                    "docker-host",
                    format!("{:?} is not a unix socket path", host),
                ));
            }
        }
        Ok(())
    }
}

fn socket_path(host: &str) -> Option<String> {
    if host.starts_with('/') {
        return Some(host.to_string());
    }
    let url = Url::parse(host).ok()?;
    if url.scheme() != "unix" || url.path().is_empty() {
        return None;
    }
    Some(url.path().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClusterClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.build_selector(), "component=repobuild-build");
        assert_eq!(config.log_tail_lines, 100);
        assert!(!config.sticky_builds);
    }

    #[test]
    fn test_docker_socket_path_from_url() {
        let config = ClusterClientConfig {
            docker_host: Some("unix:///var/run/dind/docker.sock".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.docker_socket_path().as_deref(),
            Some("/var/run/dind/docker.sock")
        );
    }

    #[test]
    fn test_docker_socket_path_plain() {
        let config = ClusterClientConfig::default();
        assert_eq!(
            config.docker_socket_path().as_deref(),
            Some("/var/run/docker.sock")
        );
    }

    #[test]
    fn test_tcp_docker_host_rejected() {
        let config = ClusterClientConfig {
            docker_host: Some("tcp://10.0.0.1:2375".to_string()),
            ..Default::default()
        };
        assert!(config.docker_socket_path().is_none());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_watch_timeout_bounds() {
        let config = ClusterClientConfig {
            watch_timeout: Duration::from_secs(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClusterClientConfig {
            watch_timeout: Duration::from_secs(600),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_spec_builder_applies_defaults() {
        let mut config = ClusterClientConfig {
            memory_limit: Some(ByteSize::from_bytes(2048)),
            cpu_request: Some("500m".to_string()),
            ..Default::default()
        };
        config.extra_env.insert("PIP_NO_CACHE".to_string(), "1".to_string());

        let spec = config
            .spec_builder("https://github.com/org/repo", "main", "reg/img:abc")
            .build()
            .unwrap();

        assert_eq!(spec.resources.memory_limit, Some(ByteSize::from_bytes(2048)));
        assert_eq!(spec.resources.cpu_request.as_deref(), Some("500m"));
        assert_eq!(
            spec.credentials.push_secret.as_deref(),
            Some(DEFAULT_PUSH_SECRET)
        );
        assert_eq!(spec.extra_env.get("PIP_NO_CACHE").map(String::as_str), Some("1"));
    }
}
