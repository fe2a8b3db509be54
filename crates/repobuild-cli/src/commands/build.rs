//! Build command.

use anyhow::{Context, Result};
use repobuild_config::SystemConfig;
use repobuild_core::{BuildExecutor, BuildStatus, ProgressEvent};
use repobuild_executor::{ClusterBuildExecutor, FakeBuildExecutor, KubeJobApi};
use repobuild_scheduler::BuildSession;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct BuildArgs {
    pub repo: String,
    pub git_ref: String,
    pub image: String,
    pub follow_logs: bool,
    pub git_credentials: Option<String>,
    pub extra_args: Vec<String>,
    pub appendix: Option<String>,
    pub fake: bool,
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::StatusChange(status) => {
            let marker = match status {
                BuildStatus::Built => "✓",
                BuildStatus::Failed => "✗",
                _ => "▶",
            };
            println!("{} Build {}", marker, status);
        }
        ProgressEvent::LogMessage(line) => {
            let message = line.message.trim_end_matches('\n');
            println!("  [{}] {}", line.phase, message);
        }
    }
}

/// Submit a build and print its progress until it finishes.
pub async fn build(config: &SystemConfig, args: BuildArgs) -> Result<()> {
    let mut builder = config
        .cluster
        .spec_builder(&args.repo, &args.git_ref, &args.image);
    if let Some(credentials) = args.git_credentials {
        builder = builder.git_credentials(credentials);
    }
    for arg in args.extra_args {
        builder = builder.extra_arg(arg);
    }
    if let Some(appendix) = args.appendix {
        builder = builder.appendix(appendix);
    }
    let spec = builder.build().context("Invalid build request")?;

    let (tx, events) = mpsc::channel(100);
    let executor: Arc<dyn BuildExecutor> = if args.fake {
        Arc::new(FakeBuildExecutor::new(spec, tx))
    } else {
        let api = KubeJobApi::new(config.cluster.namespace.clone())
            .await
            .context("Failed to connect to the cluster")?;
        Arc::new(ClusterBuildExecutor::new(
            spec,
            config.cluster.clone(),
            Arc::new(api),
            tx,
        ))
    };

    println!("Building {} at {}", executor.repo_url(), executor.git_ref());
    println!("Image: {}", executor.image_name());
    println!("Build: {}\n", executor.name());

    let (session, mut rx) = BuildSession::start(executor.clone(), events, args.follow_logs);
    let mut done = tokio::spawn(session.wait());
    let mut outcome = None;

    let result = loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                print_event(&event);
                if let ProgressEvent::StatusChange(status) = event {
                    if status.is_terminal() {
                        outcome = Some(status);
                    }
                }
            }
            result = &mut done => break result.context("Build task failed")?,
            _ = tokio::signal::ctrl_c(), if !executor.is_cancelled() => {
                println!("Cancelling, the build keeps running in the cluster");
                executor.cancel();
            }
        }
    };

    while let Ok(event) = rx.try_recv() {
        print_event(&event);
        if let ProgressEvent::StatusChange(status) = event {
            if status.is_terminal() {
                outcome = Some(status);
            }
        }
    }

    result.context("Build failed")?;
    match outcome {
        Some(BuildStatus::Built) => {
            println!("\n✓ Build succeeded");
            Ok(())
        }
        Some(_) => anyhow::bail!("Build failed"),
        None if executor.is_cancelled() => {
            println!("\nStopped following {}", executor.name());
            Ok(())
        }
        None => {
            println!("\nSubmitted {}", executor.name());
            Ok(())
        }
    }
}
