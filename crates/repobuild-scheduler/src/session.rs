//! Running one build's submission and log streaming side by side.

use repobuild_core::{BuildExecutor, BuildName, BuildStatus, Error, ProgressEvent, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 100;

/// A build whose `submit` runs on its own task, with `stream_logs` started
/// once the build is running.
///
/// Build logs can only be read once the pod's container has started, so the
/// session relays the executor's events and starts streaming logs on the
/// first `Running` status.
pub struct BuildSession {
    executor: Arc<dyn BuildExecutor>,
    submit: JoinHandle<Result<()>>,
    submitted: oneshot::Sender<()>,
    relay: JoinHandle<Option<Result<()>>>,
}

impl BuildSession {
    /// Spawn the build. `events` is the receiving end of the executor's
    /// progress channel; the session's events are read from the returned
    /// receiver instead. Log streaming is skipped unless `follow_logs` is set.
    pub fn start(
        executor: Arc<dyn BuildExecutor>,
        events: mpsc::Receiver<ProgressEvent>,
        follow_logs: bool,
    ) -> (Self, mpsc::Receiver<ProgressEvent>) {
        info!(build = %executor.name(), follow_logs, "Starting build session");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (submitted, submitted_rx) = oneshot::channel();
        let submit = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.submit().await })
        };
        let relay = tokio::spawn(relay(
            executor.clone(),
            events,
            tx,
            follow_logs,
            submitted_rx,
        ));

        let session = Self {
            executor,
            submit,
            submitted,
            relay,
        };
        (session, rx)
    }

    pub fn name(&self) -> &BuildName {
        self.executor.name()
    }

    /// Stop watching the build. The build itself keeps running.
    pub fn cancel(&self) {
        self.executor.cancel();
    }

    /// Wait for submission to finish and return its result.
    ///
    /// Log streaming is waited for too, and every event has been relayed by
    /// the time this returns. If submission failed the log stream is
    /// cancelled first, since nothing else would end it.
    pub async fn wait(self) -> Result<()> {
        let submitted = flatten(self.submit.await);
        if submitted.is_err() {
            self.executor.cancel();
        }

        // Ignored if the relay is already gone.
        let _ = self.submitted.send(());
        match self.relay.await {
            Ok(Some(Err(e))) => {
                warn!(build = %self.executor.name(), error = %e, "Log streaming failed");
            }
            Err(e) => {
                warn!(build = %self.executor.name(), error = %e, "Event relay failed");
            }
            Ok(_) => {}
        }

        submitted
    }
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined.map_err(|e| Error::Internal(format!("build task failed: {}", e)))?
}

async fn forward(out: &mpsc::Sender<ProgressEvent>, event: ProgressEvent) {
    if out.send(event).await.is_err() {
        debug!("Session receiver dropped");
    }
}

/// Forward events until submission is over and log streaming, if started,
/// has finished. Returns the log stream's result.
async fn relay(
    executor: Arc<dyn BuildExecutor>,
    mut events: mpsc::Receiver<ProgressEvent>,
    out: mpsc::Sender<ProgressEvent>,
    follow_logs: bool,
    mut submitted: oneshot::Receiver<()>,
) -> Option<Result<()>> {
    let mut logs = None;

    // Every status is sent before `submit` returns, so once `submitted`
    // fires with nothing queued no `Running` can still be on its way.
    loop {
        tokio::select! {
            biased;
            event = events.recv() => {
                let Some(event) = event else { break };
                let running = event == ProgressEvent::StatusChange(BuildStatus::Running);
                if running && follow_logs && logs.is_none() {
                    debug!(build = %executor.name(), "Build running, streaming logs");
                    let executor = executor.clone();
                    logs = Some(tokio::spawn(async move { executor.stream_logs().await }));
                }
                forward(&out, event).await;
            }
            _ = &mut submitted => break,
        }
    }
    drop(executor);

    let result = match logs {
        Some(mut handle) => loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => forward(&out, event).await,
                joined = &mut handle => break Some(flatten(joined)),
            }
        },
        None => None,
    };

    while let Ok(event) = events.try_recv() {
        forward(&out, event).await;
    }
    result
}
