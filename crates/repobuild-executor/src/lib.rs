//! Build executors for repobuild.
//!
//! Provides:
//! - [`ClusterBuildExecutor`], running each build as a Kubernetes pod
//! - [`FakeBuildExecutor`], which only pretends to build
//! - The [`BuildJobApi`] seam, with a kube-backed implementation and, behind the
//!   `test-util` feature, an in-memory one

pub mod affinity;
pub mod cluster;
pub mod fake;
pub mod kube_api;
pub mod kubernetes;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod pod;
pub mod watch;

pub use affinity::{AffinityDecision, NodeAffinityPolicy, rendezvous_rank};
pub use cluster::{BuildJobApi, JobPhase, JobWatchEvent};
pub use fake::FakeBuildExecutor;
pub use kube_api::KubeJobApi;
pub use kubernetes::ClusterBuildExecutor;
#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryCluster;
