//! An executor that pretends to build.
//!
//! Emits a plausible sequence of progress events without touching a
//! cluster. Useful for working on whatever consumes the events.

use async_trait::async_trait;
use repobuild_core::{
    BuildExecutor, BuildName, BuildSpec, BuildStatus, LogLine, ProgressEvent, Result,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const FAKE_PHASES: [&str; 4] = ["Pending", "Running", "Succeed", "Building"];
const FAKE_STEPS: usize = 5;
const DEFAULT_STEP_DELAY: Duration = Duration::from_secs(1);

pub struct FakeBuildExecutor {
    name: BuildName,
    spec: BuildSpec,
    progress: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
    step_delay: Duration,
}

impl FakeBuildExecutor {
    pub fn new(spec: BuildSpec, progress: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            name: BuildName::new(&spec.repo_url, &spec.git_ref),
            spec,
            progress,
            cancel: CancellationToken::new(),
            step_delay: DEFAULT_STEP_DELAY,
        }
    }

    /// Pause between fake build steps.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    async fn emit(&self, event: ProgressEvent) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.progress.send(event) => {}
        }
    }

    /// Sleep for one step. Returns false if cancelled meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.step_delay) => true,
        }
    }
}

#[async_trait]
impl BuildExecutor for FakeBuildExecutor {
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
        info!(build = %self.name, "Starting fake build");
        self.emit(ProgressEvent::StatusChange(BuildStatus::Running)).await;
        Ok(())
    }

    async fn stream_logs(&self) -> Result<()> {
        if !self.pause().await {
            return Ok(());
        }

        for phase in FAKE_PHASES {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let line = LogLine::new(phase, format!("{}...\n", phase));
            self.emit(ProgressEvent::LogMessage(line)).await;
        }

        for step in 1..=FAKE_STEPS {
            if !self.pause().await {
                return Ok(());
            }
            let line = LogLine::unknown(format!("Step {}/{}\n", step, FAKE_STEPS));
            self.emit(ProgressEvent::LogMessage(line)).await;
        }

        self.emit(ProgressEvent::StatusChange(BuildStatus::Built)).await;
        let deleted = LogLine::new("Deleted", "Deleted...\n");
        self.emit(ProgressEvent::LogMessage(deleted)).await;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
