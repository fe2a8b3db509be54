//! An in-memory [`BuildJobApi`].
//!
//! Behaves like a single namespace of an API server with no scheduler: jobs
//! stay in whatever phase they were created or last set to. Tests drive the
//! lifecycle through [`InMemoryCluster::set_phase`] and friends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use repobuild_core::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::debug;

use crate::cluster::{BuildJobApi, JobPhase, JobWatchEvent, job_name};

const EVENT_CAPACITY: usize = 1024;

/// Cluster operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Delete,
    List,
    Watch,
    Logs,
}

/// Equality-based label selector, such as `name=x,component=y`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EqualitySelector {
    requirements: Vec<(String, String)>,
}

impl EqualitySelector {
    pub fn parse(selector: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in selector.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
                .ok_or_else(|| {
                    Error::InvalidInput(format!("unsupported selector term: {}", term))
                })?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || key.ends_with('!') {
                return Err(Error::InvalidInput(format!(
                    "unsupported selector term: {}",
                    term
                )));
            }
            requirements.push((key.to_string(), value.to_string()));
        }
        Ok(Self { requirements })
    }

    pub fn matches(&self, job: &Pod) -> bool {
        let labels = job.metadata.labels.as_ref();
        self.requirements.iter().all(|(key, value)| {
            labels
                .and_then(|labels| labels.get(key))
                .is_some_and(|v| v == value)
        })
    }
}

#[derive(Debug, Clone)]
enum LogEvent {
    Line { job: String, line: String },
    Closed { job: String },
}

#[derive(Default)]
struct ClusterState {
    jobs: BTreeMap<String, Pod>,
    logs: HashMap<String, Vec<String>>,
    failures: HashSet<Operation>,
    resource_version: u64,
}

impl ClusterState {
    fn check(&mut self, op: Operation) -> Result<()> {
        if self.failures.remove(&op) {
            return Err(Error::Transport(format!("injected {:?} failure", op)));
        }
        Ok(())
    }

    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn job_mut(&mut self, name: &str) -> Result<&mut Pod> {
        self.jobs
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("pods \"{}\" not found", name)))
    }
}

/// A namespace of build jobs held in memory.
pub struct InMemoryCluster {
    namespace: String,
    state: Mutex<ClusterState>,
    events: broadcast::Sender<JobWatchEvent>,
    log_events: broadcast::Sender<LogEvent>,
    creates: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new(namespace: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (log_events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            namespace: namespace.into(),
            state: Mutex::new(ClusterState::default()),
            events,
            log_events,
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Number of create calls, successful or not.
    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of delete calls, successful or not.
    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Number of open watch streams.
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Make the next call of `op` fail with a transport error.
    pub async fn fail_next(&self, op: Operation) {
        self.state.lock().await.failures.insert(op);
    }

    pub async fn get(&self, name: &str) -> Option<Pod> {
        self.state.lock().await.jobs.get(name).cloned()
    }

    pub async fn job_names(&self) -> Vec<String> {
        self.state.lock().await.jobs.keys().cloned().collect()
    }

    /// Store a job exactly as given, replacing any job of the same name.
    pub async fn insert(&self, mut job: Pod) {
        let mut state = self.state.lock().await;
        let name = job_name(&job).to_string();
        job.metadata.namespace = Some(self.namespace.clone());
        job.metadata.resource_version = Some(state.next_version());
        state.logs.entry(name.clone()).or_default();
        state.jobs.insert(name, job.clone());
        let _ = self.events.send(JobWatchEvent::Applied(job));
    }

    /// Move a job to a new phase and notify watchers.
    pub async fn set_phase(&self, name: &str, phase: &str) -> Result<()> {
        self.update(name, |job| {
            job.status.get_or_insert_with(PodStatus::default).phase = Some(phase.to_string());
        })
        .await
    }

    pub async fn set_start_time(&self, name: &str, start_time: DateTime<Utc>) -> Result<()> {
        self.update(name, |job| {
            job.status.get_or_insert_with(PodStatus::default).start_time = Some(Time(start_time));
        })
        .await
    }

    /// Append a line to a job's output.
    pub async fn push_log(&self, name: &str, line: impl Into<String>) -> Result<()> {
        let line = line.into();
        let mut state = self.state.lock().await;
        state.job_mut(name)?;
        state
            .logs
            .entry(name.to_string())
            .or_default()
            .push(line.clone());
        let _ = self.log_events.send(LogEvent::Line {
            job: name.to_string(),
            line,
        });
        Ok(())
    }

    async fn update(&self, name: &str, change: impl FnOnce(&mut Pod)) -> Result<()> {
        let mut state = self.state.lock().await;
        let version = state.next_version();
        let job = state.job_mut(name)?;
        change(job);
        job.metadata.resource_version = Some(version);
        let _ = self.events.send(JobWatchEvent::Applied(job.clone()));
        Ok(())
    }
}

#[async_trait]
impl BuildJobApi for InMemoryCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create(&self, job: &Pod) -> Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.check(Operation::Create)?;

        let name = job_name(job).to_string();
        if name.is_empty() {
            return Err(Error::InvalidInput("job has no name".to_string()));
        }
        if state.jobs.contains_key(&name) {
            return Err(Error::Conflict(format!(
                "pods \"{}\" already exists",
                name
            )));
        }

        let mut job = job.clone();
        job.metadata.namespace = Some(self.namespace.clone());
        job.metadata.resource_version = Some(state.next_version());
        job.metadata.creation_timestamp = Some(Time(Utc::now()));
        let status = job.status.get_or_insert_with(PodStatus::default);
        status.phase.get_or_insert_with(|| JobPhase::Pending.to_string());
        status.start_time.get_or_insert_with(|| Time(Utc::now()));

        debug!(job = %name, "Created job");
        state.logs.insert(name.clone(), Vec::new());
        state.jobs.insert(name, job.clone());
        let _ = self.events.send(JobWatchEvent::Applied(job));
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.check(Operation::Delete)?;

        let job = state
            .jobs
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("pods \"{}\" not found", name)))?;
        state.logs.remove(name);

        debug!(job = %name, "Deleted job");
        let _ = self.events.send(JobWatchEvent::Deleted(job));
        let _ = self.log_events.send(LogEvent::Closed {
            job: name.to_string(),
        });
        Ok(())
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let selector = EqualitySelector::parse(label_selector)?;
        let mut state = self.state.lock().await;
        state.check(Operation::List)?;
        Ok(state
            .jobs
            .values()
            .filter(|job| selector.matches(job))
            .cloned()
            .collect())
    }

    async fn watch(
        &self,
        label_selector: &str,
        timeout: Duration,
    ) -> Result<BoxStream<'static, Result<JobWatchEvent>>> {
        let selector = EqualitySelector::parse(label_selector)?;
        let mut state = self.state.lock().await;
        state.check(Operation::Watch)?;

        // Subscribe while holding the lock so no change falls between the
        // snapshot and the live feed.
        let receiver = self.events.subscribe();
        let snapshot: Vec<_> = state
            .jobs
            .values()
            .filter(|job| selector.matches(job))
            .cloned()
            .map(|job| Ok(JobWatchEvent::Applied(job)))
            .collect();
        drop(state);

        let deadline = Instant::now() + timeout;
        let live = stream::unfold(
            (receiver, selector),
            move |(mut receiver, selector)| async move {
                loop {
                    let received = tokio::time::timeout_at(deadline, receiver.recv()).await;
                    match received {
                        Err(_) => return None,
                        Ok(Ok(event)) if selector.matches(event.job()) => {
                            return Some((Ok(event), (receiver, selector)));
                        }
                        Ok(Ok(_)) => continue,
                        Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                            let err = Error::Transport(format!("watch fell {} events behind", skipped));
                            return Some((Err(err), (receiver, selector)));
                        }
                        Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                    }
                }
            },
        );

        Ok(stream::iter(snapshot).chain(live).boxed())
    }

    async fn logs(
        &self,
        name: &str,
        tail_lines: Option<i64>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let mut state = self.state.lock().await;
        state.check(Operation::Logs)?;
        state.job_mut(name)?;

        let receiver = self.log_events.subscribe();
        let lines = state.logs.get(name).cloned().unwrap_or_default();
        drop(state);

        let skip = match tail_lines {
            Some(tail) => lines.len().saturating_sub(usize::try_from(tail).unwrap_or(0)),
            None => 0,
        };
        let backlog: Vec<_> = lines.into_iter().skip(skip).map(Ok).collect();

        let job = name.to_string();
        let live = stream::unfold(receiver, move |mut receiver| {
            let job = job.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(LogEvent::Line { job: from, line }) if from == job => {
                            return Some((Ok(line), receiver));
                        }
                        Ok(LogEvent::Closed { job: from }) if from == job => return None,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let err = Error::Transport(format!("log stream fell {} lines behind", skipped));
                            return Some((Err(err), receiver));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(backlog).chain(live).boxed())
    }
}
