//! Build executor trait.
//!
//! An executor turns one [`BuildSpec`](crate::spec::BuildSpec) into an image
//! and reports progress as [`ProgressEvent`](crate::event::ProgressEvent)s on
//! the channel it was constructed with.

use async_trait::async_trait;

use crate::{BuildName, Result};

/// Lifecycle of a single build.
///
/// `submit` and `stream_logs` are long-running and meant to be driven on
/// separate tasks. Both stop early once [`cancel`](BuildExecutor::cancel)
/// has been called. Cancelling only stops this executor from watching; the
/// build itself keeps running in the cluster.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Name of the build, unique per `(repo_url, ref)`.
    fn name(&self) -> &BuildName;

    /// Repository being built.
    fn repo_url(&self) -> &str;

    /// Ref of the repository being built.
    fn git_ref(&self) -> &str;

    /// Full name of the image being produced.
    fn image_name(&self) -> &str;

    /// Start the build and follow it until it finishes or is cancelled.
    ///
    /// Emits status changes, with at most one terminal status. Returns
    /// `Ok(())` on completion and on cancellation.
    async fn submit(&self) -> Result<()>;

    /// Forward build log lines until the log stream ends or the executor is
    /// cancelled.
    async fn stream_logs(&self) -> Result<()>;

    /// Release whatever the build allocated. Safe to call more than once and
    /// from several executors sharing one build name.
    async fn cleanup(&self) -> Result<()>;

    /// Stop watching this build. Idempotent and never undone.
    fn cancel(&self);

    /// Whether [`cancel`](BuildExecutor::cancel) has been called.
    fn is_cancelled(&self) -> bool;
}
