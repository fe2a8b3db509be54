//! Turning job watch events into build status changes.
//!
//! [`StatusTracker`] holds no I/O: it is fed one [`JobWatchEvent`] at a time
//! and answers with a [`Step`] saying which status to emit, whether the job
//! should be deleted, and whether watching is over. The executor performs the
//! step, cleanup first.

use repobuild_core::{BuildName, BuildStatus};
use tracing::{debug, warn};

use crate::cluster::{JobPhase, JobWatchEvent};

/// What to do after one watch event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    /// Status change to report.
    pub emit: Option<BuildStatus>,
    /// Delete the job before reporting anything.
    pub cleanup: bool,
    /// Stop watching.
    pub finished: bool,
}

#[derive(Debug)]
pub struct StatusTracker {
    name: BuildName,
    last_phase: Option<JobPhase>,
    last_emitted: Option<BuildStatus>,
    terminal_sent: bool,
}

impl StatusTracker {
    pub fn new(name: BuildName) -> Self {
        Self {
            name,
            last_phase: None,
            last_emitted: None,
            terminal_sent: false,
        }
    }

    /// Whether a terminal status has already been emitted.
    pub fn terminal_sent(&self) -> bool {
        self.terminal_sent
    }

    pub fn observe(&mut self, event: &JobWatchEvent) -> Step {
        match event {
            JobWatchEvent::Deleted(job) => {
                let phase = JobPhase::of(job).or_else(|| self.last_phase.clone());
                debug!(build = %self.name, phase = ?phase, "Build pod deleted");
                let outcome = match phase {
                    Some(JobPhase::Succeeded) => BuildStatus::Built,
                    _ => BuildStatus::Failed,
                };
                Step {
                    emit: self.terminal(outcome),
                    cleanup: false,
                    finished: true,
                }
            }
            JobWatchEvent::Applied(job) => {
                let phase = JobPhase::of(job);
                let status = match phase {
                    Some(JobPhase::Pending) => Some(BuildStatus::Pending),
                    Some(JobPhase::Running) => Some(BuildStatus::Running),
                    Some(JobPhase::Failed) => Some(BuildStatus::Failed),
                    Some(JobPhase::Unknown) => Some(BuildStatus::Unknown),
                    Some(JobPhase::Succeeded) | None => None,
                    Some(JobPhase::Other(ref other)) => {
                        warn!(build = %self.name, phase = %other, "Unrecognized build pod phase");
                        None
                    }
                };
                let cleanup = phase.as_ref().is_some_and(JobPhase::is_finished);
                self.last_phase = phase;

                let emit = match status {
                    Some(status) if status.is_terminal() => self.terminal(status),
                    Some(status) => self.transition(status),
                    None => None,
                };
                Step {
                    emit,
                    cleanup,
                    finished: false,
                }
            }
        }
    }

    fn terminal(&mut self, status: BuildStatus) -> Option<BuildStatus> {
        if self.terminal_sent {
            return None;
        }
        self.terminal_sent = true;
        self.last_emitted = Some(status);
        Some(status)
    }

    fn transition(&mut self, status: BuildStatus) -> Option<BuildStatus> {
        if self.terminal_sent || self.last_emitted == Some(status) {
            return None;
        }
        self.last_emitted = Some(status);
        Some(status)
    }
}
