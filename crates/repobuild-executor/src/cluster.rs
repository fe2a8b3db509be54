//! The slice of the cluster API that builds depend on.
//!
//! [`BuildJobApi`] is implemented against a real API server by
//! [`KubeJobApi`](crate::kube_api::KubeJobApi). Tests use the in-memory
//! `InMemoryCluster` from the `test-util` feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use repobuild_core::Result;
use std::fmt;
use std::time::Duration;

/// Label carrying the build name on every build pod.
pub const NAME_LABEL: &str = "name";
/// Label shared by every build pod, used for selection and anti-affinity.
pub const COMPONENT_LABEL: &str = "component";

/// One change observed on a watched build job.
#[derive(Debug, Clone)]
pub enum JobWatchEvent {
    /// The job was created or modified.
    Applied(Pod),
    /// The job was deleted. Carries its last known state.
    Deleted(Pod),
}

impl JobWatchEvent {
    pub fn job(&self) -> &Pod {
        match self {
            JobWatchEvent::Applied(job) | JobWatchEvent::Deleted(job) => job,
        }
    }
}

/// Phase reported by the cluster for a build job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
    /// Anything else the cluster reports, such as `Evicted`.
    Other(String),
}

impl JobPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => JobPhase::Pending,
            "Running" => JobPhase::Running,
            "Succeeded" => JobPhase::Succeeded,
            "Failed" => JobPhase::Failed,
            "Unknown" => JobPhase::Unknown,
            other => JobPhase::Other(other.to_string()),
        }
    }

    /// Phase of a job, if the cluster has reported one yet.
    pub fn of(job: &Pod) -> Option<Self> {
        job.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .map(JobPhase::parse)
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobPhase::Pending => "Pending",
            JobPhase::Running => "Running",
            JobPhase::Succeeded => "Succeeded",
            JobPhase::Failed => "Failed",
            JobPhase::Unknown => "Unknown",
            JobPhase::Other(other) => other,
        }
    }

    /// Whether the job has stopped and can be deleted.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of a job, or the empty string if it has none.
pub fn job_name(job: &Pod) -> &str {
    job.metadata.name.as_deref().unwrap_or_default()
}

/// When the job's container started, if it has.
pub fn job_start_time(job: &Pod) -> Option<DateTime<Utc>> {
    job.status
        .as_ref()
        .and_then(|status| status.start_time.as_ref())
        .map(|time| time.0)
}

/// Node the job has been scheduled onto.
pub fn job_node(job: &Pod) -> Option<&str> {
    job.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .filter(|node| !node.is_empty())
}

/// Namespaced build job operations.
///
/// Errors follow [`repobuild_core::Error`]: an existing name on create is
/// `Conflict`, a missing name on delete or logs is `NotFound`.
#[async_trait]
pub trait BuildJobApi: Send + Sync {
    /// Namespace every operation applies to.
    fn namespace(&self) -> &str;

    async fn create(&self, job: &Pod) -> Result<()>;

    /// Delete a job immediately, without a grace period.
    async fn delete(&self, name: &str) -> Result<()>;

    async fn list(&self, label_selector: &str) -> Result<Vec<Pod>>;

    /// Watch jobs matching a selector.
    ///
    /// The stream starts with the current state of every matching job and
    /// ends once `timeout` has passed.
    async fn watch(
        &self,
        label_selector: &str,
        timeout: Duration,
    ) -> Result<BoxStream<'static, Result<JobWatchEvent>>>;

    /// Follow a job's output, starting `tail_lines` lines back.
    async fn logs(
        &self,
        name: &str,
        tail_lines: Option<i64>,
    ) -> Result<BoxStream<'static, Result<String>>>;
}
