//! Garbage collection of build pods.
//!
//! A sweep deletes every build pod that has finished, and every build pod
//! that started longer ago than the configured maximum age whatever its
//! phase. Executors delete their own pods when they see them finish; the
//! sweep catches pods nobody is watching any more.

use chrono::{DateTime, Utc};
use repobuild_config::GcConfig;
use repobuild_core::Result;
use repobuild_executor::cluster::{BuildJobApi, JobPhase, job_name, job_start_time};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Key used in [`GcSummary::phases`] for pods without a phase.
pub const NO_PHASE: &str = "<none>";

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GcSummary {
    /// Build pods seen.
    pub total: usize,
    /// Build pods selected for deletion, including any that were already
    /// gone by the time they were deleted.
    pub deleted: usize,
    /// Build pods seen, by phase.
    pub phases: BTreeMap<String, usize>,
}

fn is_collectable_phase(phase: &JobPhase) -> bool {
    match phase {
        JobPhase::Succeeded | JobPhase::Failed => true,
        JobPhase::Other(other) => other == "Evicted",
        _ => false,
    }
}

pub struct BuildPodGc {
    api: Arc<dyn BuildJobApi>,
    config: GcConfig,
}

impl BuildPodGc {
    pub fn new(api: Arc<dyn BuildJobApi>, config: GcConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub async fn sweep(&self) -> Result<GcSummary> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<GcSummary> {
        let cutoff = if self.config.max_age.is_zero() {
            None
        } else {
            chrono::Duration::from_std(self.config.max_age)
                .ok()
                .and_then(|max_age| now.checked_sub_signed(max_age))
        };

        let jobs = self.api.list(&self.config.build_selector()).await?;
        let mut summary = GcSummary {
            total: jobs.len(),
            ..Default::default()
        };

        for job in &jobs {
            let name = job_name(job);
            let phase = JobPhase::of(job);
            let phase_key = phase
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| NO_PHASE.to_string());
            *summary.phases.entry(phase_key).or_default() += 1;

            let finished = phase.as_ref().is_some_and(is_collectable_phase);
            let started = job_start_time(job);
            let stale = match (cutoff, started) {
                (Some(cutoff), Some(started)) => started < cutoff,
                _ => false,
            };

            if finished {
                info!(build = %name, phase = ?phase, "Deleting finished build pod");
            } else if stale {
                info!(build = %name, started = ?started, "Deleting stale build pod");
            } else {
                continue;
            }

            match self.api.delete(name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(build = %name, "Build pod already deleted");
                }
                Err(e) => return Err(e),
            }
            summary.deleted += 1;
        }

        info!(
            namespace = %self.api.namespace(),
            total = summary.total,
            deleted = summary.deleted,
            phases = ?summary.phases,
            "Build pod sweep finished"
        );
        Ok(summary)
    }
}

/// Sweep every `interval` until cancelled. Failed sweeps are logged and
/// retried on the next tick.
pub async fn run_gc_loop(gc: &BuildPodGc, interval: Duration, cancel: CancellationToken) {
    info!(interval = ?interval, max_age = ?gc.config.max_age, "Starting build pod GC");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Stopping build pod GC");
                return;
            }
            _ = ticker.tick() => {}
        }

        if let Err(e) = gc.sweep().await {
            warn!(error = %e, "Build pod sweep failed");
        }
    }
}
