//! Garbage collection command.

use anyhow::{Context, Result};
use repobuild_config::SystemConfig;
use repobuild_executor::KubeJobApi;
use repobuild_scheduler::{BuildPodGc, run_gc_loop};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Sweep build pods once, or periodically until interrupted.
pub async fn gc(config: &SystemConfig, once: bool) -> Result<()> {
    let api = KubeJobApi::new(config.gc.namespace.clone())
        .await
        .context("Failed to connect to the cluster")?;
    let gc = BuildPodGc::new(Arc::new(api), config.gc.clone());

    if once {
        let summary = gc.sweep().await.context("Sweep failed")?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let interval = config.gc.interval;
    let handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { run_gc_loop(&gc, interval, cancel).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt")?;
    cancel.cancel();
    handle.await.context("GC task failed")?;
    Ok(())
}
