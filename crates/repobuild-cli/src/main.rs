//! repobuild CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "repobuild")]
#[command(about = "Build repositories into container images on Kubernetes", long_about = None)]
struct Cli {
    /// Configuration file. Defaults to ./repobuild.kdl when it exists.
    #[arg(long, env = "REPOBUILD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Write logs as JSON
    #[arg(long, env = "REPOBUILD_JSON_LOGS", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a repository and follow its progress
    Build {
        /// Repository URL
        #[arg(long)]
        repo: String,
        /// Ref to build
        #[arg(long = "ref")]
        git_ref: String,
        /// Full name of the image to produce
        #[arg(long)]
        image: String,
        /// Don't stream build logs
        #[arg(long)]
        no_logs: bool,
        /// Git credentials passed to the build
        #[arg(long, env = "REPOBUILD_GIT_CREDENTIALS", hide_env_values = true)]
        git_credentials: Option<String>,
        /// Extra argument for the build tool (repeatable)
        #[arg(long = "extra-arg", allow_hyphen_values = true)]
        extra_args: Vec<String>,
        /// Text appended to the generated Dockerfile
        #[arg(long)]
        appendix: Option<String>,
        /// Pretend to build without contacting the cluster
        #[arg(long)]
        fake: bool,
    },
    /// Delete finished and stale build pods
    Gc {
        /// Sweep once and exit instead of sweeping periodically
        #[arg(long)]
        once: bool,
    },
    /// Print the build name for a repository and ref
    Name {
        /// Repository URL
        #[arg(long)]
        repo: String,
        /// Ref to build
        #[arg(long = "ref")]
        git_ref: String,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = commands::DEFAULT_CONFIG_PATH)]
        path: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Build {
            repo,
            git_ref,
            image,
            no_logs,
            git_credentials,
            extra_args,
            appendix,
            fake,
        } => {
            let config = commands::load_config(cli.config.as_deref())?;
            let args = commands::build::BuildArgs {
                repo,
                git_ref,
                image,
                follow_logs: !no_logs,
                git_credentials,
                extra_args,
                appendix,
                fake,
            };
            commands::build::build(&config, args).await?;
        }
        Commands::Gc { once } => {
            let config = commands::load_config(cli.config.as_deref())?;
            commands::gc::gc(&config, once).await?;
        }
        Commands::Name { repo, git_ref } => {
            commands::name(&repo, &git_ref);
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
