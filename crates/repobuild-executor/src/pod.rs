//! Pod spec construction for build jobs.

use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, HostPathVolumeSource, LocalObjectReference, Pod, PodSpec,
    ResourceRequirements, SecretVolumeSource, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use repobuild_config::ClusterClientConfig;
use repobuild_core::{BuildName, BuildSpec, Result};
use std::collections::BTreeMap;

use crate::cluster::{COMPONENT_LABEL, NAME_LABEL};

pub const BUILDER_CONTAINER: &str = "builder";
/// Annotation recording which repository a build pod is building.
pub const REPO_ANNOTATION: &str = "repo";
pub const GIT_CREDENTIAL_ENV: &str = "GIT_CREDENTIAL_ENV";
pub const REGISTRY_CREDENTIALS_ENV: &str = "CONTAINER_ENGINE_REGISTRY_CREDENTIALS";

const BUILD_USER_NAME: &str = "jovyan";
const BUILD_USER_ID: u32 = 1000;

const DOCKER_SOCKET_VOLUME: &str = "docker-socket";
const DOCKER_SOCKET_MOUNT: &str = "/var/run/docker.sock";
const DOCKER_CONFIG_VOLUME: &str = "docker-config";
const DOCKER_CONFIG_MOUNT: &str = "/root/.docker/config.json";
const DOCKER_CONFIG_FILE: &str = "config.json";

/// Taints on nodes reserved for user workloads. Both spellings are in use.
const DEDICATED_TAINT_KEYS: [&str; 2] = ["hub.jupyter.org/dedicated", "hub.jupyter.org_dedicated"];
const DEDICATED_TAINT_VALUE: &str = "user";

/// Command line of the build container. The repository URL is always last.
pub fn builder_args(spec: &BuildSpec, builder_command: &str) -> Vec<String> {
    let mut args = vec![
        builder_command.to_string(),
        format!("--ref={}", spec.git_ref),
        format!("--image={}", spec.image_name),
        "--no-clean".to_string(),
        "--no-run".to_string(),
        "--json-logs".to_string(),
        format!("--user-name={}", BUILD_USER_NAME),
        format!("--user-id={}", BUILD_USER_ID),
    ];

    if let Some(ref appendix) = spec.appendix {
        args.push("--appendix".to_string());
        args.push(appendix.clone());
    }

    if spec.credentials.can_push() {
        args.push("--push".to_string());
    }

    if let Some(limit) = spec.resources.memory_limit {
        args.push("--build-memory-limit".to_string());
        args.push(limit.as_u64().to_string());
    }

    args.extend(spec.extra_args.iter().cloned());
    args.push(spec.repo_url.clone());
    args
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Environment of the build container.
///
/// Cluster-wide variables come first and are overridden by the build's own.
pub fn builder_env(spec: &BuildSpec, config: &ClusterClientConfig) -> Result<Vec<EnvVar>> {
    let mut vars: BTreeMap<&str, &str> = config
        .extra_env
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    vars.extend(spec.extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let mut env: Vec<EnvVar> = vars.into_iter().map(|(k, v)| env_var(k, v)).collect();

    if let Some(ref git) = spec.credentials.git {
        env.push(env_var(GIT_CREDENTIAL_ENV, git));
    }
    if let Some(ref registry) = spec.credentials.registry {
        let encoded = serde_json::to_string(registry)?;
        env.push(env_var(REGISTRY_CREDENTIALS_ENV, &encoded));
    }

    Ok(env)
}

/// Volumes of the build pod and where the build container mounts them.
pub fn builder_volumes(
    spec: &BuildSpec,
    config: &ClusterClientConfig,
) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    if let Some(socket) = config.docker_socket_path() {
        volumes.push(Volume {
            name: DOCKER_SOCKET_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: socket,
                type_: Some("Socket".to_string()),
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: DOCKER_SOCKET_VOLUME.to_string(),
            mount_path: DOCKER_SOCKET_MOUNT.to_string(),
            ..Default::default()
        });
    }

    if let Some(secret) = spec.credentials.static_push_secret() {
        volumes.push(Volume {
            name: DOCKER_CONFIG_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: DOCKER_CONFIG_VOLUME.to_string(),
            mount_path: DOCKER_CONFIG_MOUNT.to_string(),
            sub_path: Some(DOCKER_CONFIG_FILE.to_string()),
            ..Default::default()
        });
    }

    (volumes, mounts)
}

fn builder_resources(spec: &BuildSpec) -> ResourceRequirements {
    let bytes = |size: Option<repobuild_core::ByteSize>| {
        Quantity(size.map(|s| s.as_u64()).unwrap_or(0).to_string())
    };

    let limits = BTreeMap::from([("memory".to_string(), bytes(spec.resources.memory_limit))]);
    let mut requests =
        BTreeMap::from([("memory".to_string(), bytes(spec.resources.memory_request))]);
    if let Some(ref cpu) = spec.resources.cpu_request {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }

    ResourceRequirements {
        limits: Some(limits),
        requests: Some(requests),
        ..Default::default()
    }
}

fn dedicated_tolerations() -> Vec<Toleration> {
    DEDICATED_TAINT_KEYS
        .iter()
        .map(|key| Toleration {
            key: Some(key.to_string()),
            operator: Some("Equal".to_string()),
            value: Some(DEDICATED_TAINT_VALUE.to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        })
        .collect()
}

/// Build the pod that runs one build.
pub fn build_pod(
    name: &BuildName,
    spec: &BuildSpec,
    config: &ClusterClientConfig,
    affinity: Affinity,
) -> Result<Pod> {
    let (volumes, volume_mounts) = builder_volumes(spec, config);

    let container = Container {
        name: BUILDER_CONTAINER.to_string(),
        image: Some(config.build_image.clone()),
        args: Some(builder_args(spec, &config.builder_command)),
        env: Some(builder_env(spec, config)?),
        resources: Some(builder_resources(spec)),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    let labels = [
        (NAME_LABEL.to_string(), name.to_string()),
        (COMPONENT_LABEL.to_string(), config.component_label.clone()),
    ]
    .into_iter()
    .collect();
    let annotations = [(REPO_ANNOTATION.to_string(), spec.repo_url.clone())]
        .into_iter()
        .collect();

    let image_pull_secrets = (!config.image_pull_secrets.is_empty()).then(|| {
        config
            .image_pull_secrets
            .iter()
            .map(|secret| LocalObjectReference {
                name: secret.clone(),
            })
            .collect()
    });
    let node_selector = (!config.node_selector.is_empty()).then(|| config.node_selector.clone());

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            tolerations: Some(dedicated_tolerations()),
            node_selector,
            image_pull_secrets,
            affinity: Some(affinity),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}
