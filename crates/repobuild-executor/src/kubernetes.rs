//! Builds run as pods on a Kubernetes cluster.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Affinity;
use repobuild_config::ClusterClientConfig;
use repobuild_core::{BuildExecutor, BuildName, BuildSpec, LogLine, ProgressEvent, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::affinity::{AffinityDecision, NodeAffinityPolicy, active_nodes};
use crate::cluster::{BuildJobApi, NAME_LABEL};
use crate::pod::build_pod;
use crate::watch::StatusTracker;

/// Runs one build as a pod and follows it.
///
/// The pod is named after the build, so executors for the same
/// `(repo_url, ref)` share one pod: the first to submit creates it and the
/// others observe it.
pub struct ClusterBuildExecutor {
    name: BuildName,
    spec: BuildSpec,
    config: ClusterClientConfig,
    api: Arc<dyn BuildJobApi>,
    progress: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
}

impl ClusterBuildExecutor {
    pub fn new(
        spec: BuildSpec,
        config: ClusterClientConfig,
        api: Arc<dyn BuildJobApi>,
        progress: mpsc::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            name: BuildName::new(&spec.repo_url, &spec.git_ref),
            spec,
            config,
            api,
            progress,
            cancel: CancellationToken::new(),
        }
    }

    /// Use a token shared with the caller, so that cancelling it stops this
    /// executor too.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn spec(&self) -> &BuildSpec {
        &self.spec
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn name_selector(&self) -> String {
        format!("{}={}", NAME_LABEL, self.name)
    }

    /// Send an event, giving up if the executor is cancelled while the
    /// channel is full.
    async fn emit(&self, event: ProgressEvent) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(build = %self.name, "Dropping progress event, build cancelled");
            }
            sent = self.progress.send(event) => {
                if sent.is_err() {
                    debug!(build = %self.name, "Progress receiver dropped");
                }
            }
        }
    }

    async fn placement(&self) -> Result<Affinity> {
        let policy =
            NodeAffinityPolicy::new(self.config.sticky_builds, &self.config.component_label);
        let decision = if self.config.sticky_builds {
            let pods = self.api.list(&self.config.placement_selector).await?;
            policy.decide(active_nodes(&pods), &self.spec.repo_url)
        } else {
            AffinityDecision::SpreadFromBuilds
        };
        debug!(build = %self.name, decision = ?decision, "Chose build placement");
        Ok(policy.affinity(&decision))
    }

    /// Follow the build pod until it finishes or the executor is cancelled.
    async fn watch_build(&self) -> Result<()> {
        let selector = self.name_selector();
        let mut tracker = StatusTracker::new(self.name.clone());

        loop {
            if self.cancel.is_cancelled() {
                info!(build = %self.name, "Stopping watch, build cancelled");
                return Ok(());
            }
            // Failed is final even if the deletion that follows was missed.
            if tracker.terminal_sent() {
                debug!(build = %self.name, "Build finished, not watching again");
                return Ok(());
            }

            let mut events = self.api.watch(&selector, self.config.watch_timeout).await?;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        info!(build = %self.name, "Stopping watch, build cancelled");
                        return Ok(());
                    }
                    next = events.next() => next,
                };
                let Some(event) = next else { break };
                let event = event.inspect_err(|e| {
                    error!(build = %self.name, error = %e, "Watching build pod failed");
                })?;

                if self.cancel.is_cancelled() {
                    info!(build = %self.name, "Stopping watch, build cancelled");
                    return Ok(());
                }

                let step = tracker.observe(&event);
                if step.cleanup {
                    self.cleanup().await?;
                }
                if let Some(status) = step.emit {
                    info!(build = %self.name, status = %status, "Build status changed");
                    self.emit(ProgressEvent::StatusChange(status)).await;
                }
                if step.finished {
                    return Ok(());
                }
            }
            debug!(build = %self.name, "Watch expired, subscribing again");
        }
    }
}

#[async_trait]
impl BuildExecutor for ClusterBuildExecutor {
    fn name(&self) -> &BuildName {
        &self.name
    }

    fn repo_url(&self) -> &str {
        &self.spec.repo_url
    }

    fn git_ref(&self) -> &str {
        &self.spec.git_ref
    }

    fn image_name(&self) -> &str {
        &self.spec.image_name
    }

    async fn submit(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            info!(build = %self.name, "Build cancelled before submission");
            return Ok(());
        }

        let affinity = self.placement().await?;
        let pod = build_pod(&self.name, &self.spec, &self.config, affinity)?;

        match self.api.create(&pod).await {
            Ok(()) => info!(
                build = %self.name,
                repo = %self.spec.repo_url,
                git_ref = %self.spec.git_ref,
                namespace = %self.api.namespace(),
                "Started build"
            ),
            Err(e) if e.is_conflict() => {
                info!(build = %self.name, "Build already running, following it")
            }
            Err(e) => {
                error!(build = %self.name, error = %e, "Failed to create build pod");
                return Err(e);
            }
        }

        info!(build = %self.name, "Watching build pod");
        self.watch_build().await
    }

    async fn stream_logs(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        info!(build = %self.name, "Watching logs");
        let tail_lines = Some(i64::from(self.config.log_tail_lines));
        let mut lines = self.api.logs(self.name.as_str(), tail_lines).await?;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(build = %self.name, "Stopping logs, build cancelled");
                    return Ok(());
                }
                next = lines.next() => next,
            };
            let Some(line) = next else { break };
            let line = line?;
            let raw = line.trim_end_matches(['\r', '\n']);

            let entry = match LogLine::parse(raw) {
                Ok(entry) => entry,
                Err(_) => {
                    error!(build = %self.name, line = %raw, "Log line is not a JSON build event");
                    LogLine::unknown(raw)
                }
            };
            self.emit(ProgressEvent::LogMessage(entry)).await;
        }

        info!(build = %self.name, "Finished streaming logs");
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        match self.api.delete(self.name.as_str()).await {
            Ok(()) => {
                info!(build = %self.name, "Deleted build pod");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(build = %self.name, "Build pod already deleted");
                Ok(())
            }
            Err(e) => {
                error!(build = %self.name, error = %e, "Failed to delete build pod");
                Err(e)
            }
        }
    }

    fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!(build = %self.name, "Cancelling build");
        }
        self.cancel.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{JobPhase, JobWatchEvent, job_name};
    use crate::memory::{InMemoryCluster, Operation};
    use futures::stream::{self, BoxStream};
    use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use repobuild_core::{BuildStatus, Error};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    const REPO: &str = "https://github.com/org/repo";

    fn spec() -> BuildSpec {
        BuildSpec::builder(REPO, "abc123", "registry.example/org-repo:abc123")
            .build()
            .unwrap()
    }

    fn config() -> ClusterClientConfig {
        ClusterClientConfig {
            namespace: "test".to_string(),
            ..Default::default()
        }
    }

    fn new_executor(
        cluster: &Arc<InMemoryCluster>,
        config: ClusterClientConfig,
    ) -> (Arc<ClusterBuildExecutor>, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(100);
        let api: Arc<dyn BuildJobApi> = cluster.clone();
        (Arc::new(ClusterBuildExecutor::new(spec(), config, api, tx)), rx)
    }

    fn spawn_submit(executor: &Arc<ClusterBuildExecutor>) -> JoinHandle<Result<()>> {
        let executor = executor.clone();
        tokio::spawn(async move { executor.submit().await })
    }

    fn spawn_logs(executor: &Arc<ClusterBuildExecutor>) -> JoinHandle<Result<()>> {
        let executor = executor.clone();
        tokio::spawn(async move { executor.stream_logs().await })
    }

    async fn next_event(rx: &mut mpsc::Receiver<ProgressEvent>) -> ProgressEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("progress channel closed")
    }

    async fn next_status(rx: &mut mpsc::Receiver<ProgressEvent>) -> BuildStatus {
        match next_event(rx).await {
            ProgressEvent::StatusChange(status) => status,
            other => panic!("expected status change, got {:?}", other),
        }
    }

    async fn finish(handle: JoinHandle<Result<()>>) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("timed out waiting for task")
            .expect("task panicked")
    }

    fn drain(rx: &mut mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_successful_build() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (executor, mut rx) = new_executor(&cluster, config());
        let name = executor.name().to_string();
        let handle = spawn_submit(&executor);

        assert_eq!(next_status(&mut rx).await, BuildStatus::Pending);
        cluster.set_phase(&name, "Running").await.unwrap();
        assert_eq!(next_status(&mut rx).await, BuildStatus::Running);
        cluster.set_phase(&name, "Succeeded").await.unwrap();
        assert_eq!(next_status(&mut rx).await, BuildStatus::Built);

        finish(handle).await.unwrap();
        assert!(cluster.get(&name).await.is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_created_pod_matches_build() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (executor, mut rx) = new_executor(&cluster, config());
        let handle = spawn_submit(&executor);
        assert_eq!(next_status(&mut rx).await, BuildStatus::Pending);

        let names = cluster.job_names().await;
        assert_eq!(names, vec![executor.name().to_string()]);
        let pod = cluster.get(executor.name().as_str()).await.unwrap();
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(
            labels.get("component").map(String::as_str),
            Some("repobuild-build")
        );
        assert_eq!(executor.repo_url(), REPO);
        assert_eq!(executor.git_ref(), "abc123");
        assert_eq!(executor.image_name(), "registry.example/org-repo:abc123");

        executor.cancel();
        finish(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_build_cleans_up_before_single_terminal_event() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (executor, mut rx) = new_executor(&cluster, config());
        let name = executor.name().to_string();
        let handle = spawn_submit(&executor);

        assert_eq!(next_status(&mut rx).await, BuildStatus::Pending);
        cluster.set_phase(&name, "Failed").await.unwrap();
        assert_eq!(next_status(&mut rx).await, BuildStatus::Failed);
        // The pod is already gone when the terminal event arrives.
        assert!(cluster.get(&name).await.is_none());

        finish(handle).await.unwrap();
        let terminal = drain(&mut rx)
            .into_iter()
            .filter(ProgressEvent::is_terminal)
            .count();
        assert_eq!(terminal, 0);
    }

    #[tokio::test]
    async fn test_pod_deleted_while_running_fails_build() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (executor, mut rx) = new_executor(&cluster, config());
        let name = executor.name().to_string();
        let handle = spawn_submit(&executor);

        assert_eq!(next_status(&mut rx).await, BuildStatus::Pending);
        cluster.set_phase(&name, "Running").await.unwrap();
        assert_eq!(next_status(&mut rx).await, BuildStatus::Running);
        cluster.delete(&name).await.unwrap();
        assert_eq!(next_status(&mut rx).await, BuildStatus::Failed);
        finish(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_submits_share_one_pod() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (first, mut first_rx) = new_executor(&cluster, config());
        let (second, mut second_rx) = new_executor(&cluster, config());
        assert_eq!(first.name(), second.name());
        let name = first.name().to_string();

        let first_handle = spawn_submit(&first);
        let second_handle = spawn_submit(&second);

        assert_eq!(next_status(&mut first_rx).await, BuildStatus::Pending);
        assert_eq!(next_status(&mut second_rx).await, BuildStatus::Pending);
        assert_eq!(cluster.create_calls(), 2);
        assert_eq!(cluster.job_names().await.len(), 1);

        cluster.set_phase(&name, "Running").await.unwrap();
        cluster.set_phase(&name, "Succeeded").await.unwrap();

        for rx in [&mut first_rx, &mut second_rx] {
            assert_eq!(next_status(rx).await, BuildStatus::Running);
            assert_eq!(next_status(rx).await, BuildStatus::Built);
        }
        finish(first_handle).await.unwrap();
        finish(second_handle).await.unwrap();

        assert!(drain(&mut first_rx).is_empty());
        assert!(drain(&mut second_rx).is_empty());
        assert!(cluster.job_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_watch_without_terminal_event() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (executor, mut rx) = new_executor(&cluster, config());
        let name = executor.name().to_string();
        let handle = spawn_submit(&executor);

        assert_eq!(next_status(&mut rx).await, BuildStatus::Pending);
        executor.cancel();
        executor.cancel();
        assert!(executor.is_cancelled());
        finish(handle).await.unwrap();

        assert!(drain(&mut rx).is_empty());
        // Cancelling only stops watching; the build keeps running.
        assert!(cluster.get(&name).await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_before_submit_creates_nothing() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (executor, _rx) = new_executor(&cluster, config());
        executor.cancel();
        executor.submit().await.unwrap();
        assert_eq!(cluster.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_shared_cancellation_token() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(10);
        let api: Arc<dyn BuildJobApi> = cluster.clone();
        let executor =
            ClusterBuildExecutor::new(spec(), config(), api, tx).with_cancellation(token.child_token());

        token.cancel();
        assert!(executor.is_cancelled());
    }

    #[tokio::test]
    async fn test_create_error_is_fatal() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        cluster.fail_next(Operation::Create).await;
        let (executor, mut rx) = new_executor(&cluster, config());

        assert!(executor.submit().await.is_err());
        assert_eq!(cluster.watcher_count(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_watch_error_is_fatal() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        cluster.fail_next(Operation::Watch).await;
        let (executor, _rx) = new_executor(&cluster, config());

        assert!(executor.submit().await.is_err());
        assert_eq!(cluster.job_names().await.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_resubscribes_after_timeout() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let config = ClusterClientConfig {
            watch_timeout: Duration::from_millis(20),
            ..config()
        };
        let (executor, mut rx) = new_executor(&cluster, config);
        let name = executor.name().to_string();
        let handle = spawn_submit(&executor);

        assert_eq!(next_status(&mut rx).await, BuildStatus::Pending);
        // Let several watches expire and replay the pending pod.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(drain(&mut rx).is_empty());

        cluster.set_phase(&name, "Succeeded").await.unwrap();
        assert_eq!(next_status(&mut rx).await, BuildStatus::Built);
        finish(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_unrecognized_phase_emits_nothing() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (executor, mut rx) = new_executor(&cluster, config());
        let name = executor.name().to_string();
        let handle = spawn_submit(&executor);

        assert_eq!(next_status(&mut rx).await, BuildStatus::Pending);
        cluster.set_phase(&name, "Evicted").await.unwrap();
        cluster.set_phase(&name, "Running").await.unwrap();
        assert_eq!(next_status(&mut rx).await, BuildStatus::Running);

        executor.cancel();
        finish(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (executor, _rx) = new_executor(&cluster, config());

        let pod = build_pod(executor.name(), executor.spec(), &config(), Affinity::default()).unwrap();
        cluster.create(&pod).await.unwrap();

        executor.cleanup().await.unwrap();
        executor.cleanup().await.unwrap();
        assert_eq!(cluster.delete_calls(), 2);
        assert!(cluster.job_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_propagates_other_errors() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (executor, _rx) = new_executor(&cluster, config());
        cluster.fail_next(Operation::Delete).await;
        assert!(executor.cleanup().await.is_err());
    }

    #[tokio::test]
    async fn test_stream_logs_wraps_unstructured_lines() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (executor, mut rx) = new_executor(&cluster, config());
        let name = executor.name().to_string();
        let handle = spawn_submit(&executor);
        assert_eq!(next_status(&mut rx).await, BuildStatus::Pending);

        cluster
            .push_log(&name, r#"{"phase":"building","message":"Step 1/3\n"}"#)
            .await
            .unwrap();
        cluster.push_log(&name, "not json").await.unwrap();

        let logs = spawn_logs(&executor);
        for expected in [
            LogLine::new("building", "Step 1/3\n"),
            LogLine::new("unknown", "not json"),
        ] {
            match next_event(&mut rx).await {
                ProgressEvent::LogMessage(line) => assert_eq!(line, expected),
                other => panic!("expected log line, got {:?}", other),
            }
        }

        cluster.set_phase(&name, "Succeeded").await.unwrap();
        finish(handle).await.unwrap();
        finish(logs).await.unwrap();
        let rest = drain(&mut rx);
        assert_eq!(rest, vec![ProgressEvent::StatusChange(BuildStatus::Built)]);
    }

    #[tokio::test]
    async fn test_stream_logs_respects_tail() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let config = ClusterClientConfig {
            log_tail_lines: 2,
            ..config()
        };
        let (executor, mut rx) = new_executor(&cluster, config.clone());
        let pod = build_pod(executor.name(), executor.spec(), &config, Affinity::default()).unwrap();
        cluster.create(&pod).await.unwrap();
        let name = executor.name().to_string();
        for i in 0..5 {
            cluster.push_log(&name, format!("line {}", i)).await.unwrap();
        }

        let logs = spawn_logs(&executor);
        for expected in ["line 3", "line 4"] {
            assert_eq!(
                next_event(&mut rx).await,
                ProgressEvent::LogMessage(LogLine::unknown(expected))
            );
        }
        executor.cancel();
        finish(logs).await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_logs_missing_pod() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (executor, _rx) = new_executor(&cluster, config());
        let err = executor.stream_logs().await.unwrap_err();
        assert!(err.is_not_found());
    }

    fn placement_pod(name: &str, node: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    [("component".to_string(), "image-builder".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sticky_build_prefers_ranked_node() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        for (pod, node) in [("builder-a", "node-a"), ("builder-b", "node-b"), ("builder-c", "node-c")] {
            cluster.insert(placement_pod(pod, node)).await;
        }
        let config = ClusterClientConfig {
            sticky_builds: true,
            ..config()
        };
        let (executor, mut rx) = new_executor(&cluster, config);
        let handle = spawn_submit(&executor);
        assert_eq!(next_status(&mut rx).await, BuildStatus::Pending);

        let expected = crate::affinity::rendezvous_rank(["node-a", "node-b", "node-c"], REPO).remove(0);
        let pod = cluster.get(executor.name().as_str()).await.unwrap();
        let terms = pod
            .spec
            .unwrap()
            .affinity
            .unwrap()
            .node_affinity
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution
            .unwrap();
        let values = terms[0].preference.match_expressions.as_ref().unwrap()[0]
            .values
            .clone()
            .unwrap();
        assert_eq!(values, vec![expected]);

        executor.cancel();
        finish(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_existing_pod_is_followed() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (executor, mut rx) = new_executor(&cluster, config());
        let pod = build_pod(executor.name(), executor.spec(), &config(), Affinity::default()).unwrap();
        cluster.create(&pod).await.unwrap();
        cluster.set_phase(job_name(&pod), "Running").await.unwrap();

        let handle = spawn_submit(&executor);
        assert_eq!(next_status(&mut rx).await, BuildStatus::Running);
        let existing = cluster.get(executor.name().as_str()).await.unwrap();
        assert_eq!(JobPhase::of(&existing), Some(JobPhase::Running));

        executor.cancel();
        finish(handle).await.unwrap();
    }

    /// Reports the build pod as failed on the first watch and never shows it
    /// again, as if its deletion fell between two watches.
    struct FailedThenGone {
        pod: Pod,
        watches: AtomicUsize,
    }

    #[async_trait]
    impl BuildJobApi for FailedThenGone {
        fn namespace(&self) -> &str {
            "test"
        }

        async fn create(&self, _job: &Pod) -> Result<()> {
            Ok(())
        }

        async fn delete(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn list(&self, _label_selector: &str) -> Result<Vec<Pod>> {
            Ok(Vec::new())
        }

        async fn watch(
            &self,
            _label_selector: &str,
            _timeout: Duration,
        ) -> Result<BoxStream<'static, Result<JobWatchEvent>>> {
            if self.watches.fetch_add(1, Ordering::SeqCst) == 0 {
                let event = JobWatchEvent::Applied(self.pod.clone());
                Ok(stream::iter([Ok(event)]).boxed())
            } else {
                Ok(stream::empty().boxed())
            }
        }

        async fn logs(
            &self,
            name: &str,
            _tail_lines: Option<i64>,
        ) -> Result<BoxStream<'static, Result<String>>> {
            Err(Error::NotFound(format!("pods \"{}\" not found", name)))
        }
    }

    #[tokio::test]
    async fn test_failed_build_finishes_without_deletion_event() {
        let spec = spec();
        let name = BuildName::new(&spec.repo_url, &spec.git_ref);
        let mut pod = build_pod(&name, &spec, &config(), Affinity::default()).unwrap();
        pod.status = Some(PodStatus {
            phase: Some("Failed".to_string()),
            ..Default::default()
        });
        let api = Arc::new(FailedThenGone {
            pod,
            watches: AtomicUsize::new(0),
        });

        let (tx, mut rx) = mpsc::channel(100);
        let job_api: Arc<dyn BuildJobApi> = api.clone();
        let executor = Arc::new(ClusterBuildExecutor::new(spec, config(), job_api, tx));
        let handle = spawn_submit(&executor);

        assert_eq!(next_status(&mut rx).await, BuildStatus::Failed);
        finish(handle).await.unwrap();
        assert_eq!(api.watches.load(Ordering::SeqCst), 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unblocks_full_progress_channel() {
        let cluster = Arc::new(InMemoryCluster::new("test"));
        let (tx, _rx) = mpsc::channel(1);
        let api: Arc<dyn BuildJobApi> = cluster.clone();
        let executor = Arc::new(ClusterBuildExecutor::new(spec(), config(), api, tx));
        let name = executor.name().to_string();
        let handle = spawn_submit(&executor);

        tokio::time::timeout(Duration::from_secs(5), async {
            while cluster.get(&name).await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("build pod was never created");

        // Pending fills the channel and nobody reads it, so Running blocks.
        cluster.set_phase(&name, "Running").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        executor.cancel();
        finish(handle).await.unwrap();
    }
}
