//! emr-runner CLI
//!
//! ```bash
//! # Check that the config resolves
//! emr-runner -f emr.yml -s settings/prod.yml validate
//!
//! # Deploy the resource stack
//! emr-runner -f emr.yml -s settings/prod.yml resources
//!
//! # Full flow: resources, package, cluster with steps, wait
//! emr-runner -f emr.yml -s settings/prod.yml run --no-keep-cluster
//!
//! # Submit steps to the running cluster named after the config
//! emr-runner -f emr.yml -s settings/prod.yml run-step
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use emr_runner::{ConfigResolver, EmrRunner, PollSettings, Services};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Deploy resources and run Spark steps on EMR
#[derive(Parser)]
#[command(name = "emr-runner")]
#[command(about = "Deploy resources and run Spark steps on EMR", long_about = None)]
struct Cli {
    /// Config template (YAML with mustache tags)
    #[arg(short = 'f', long, global = true)]
    config_file: Option<PathBuf>,

    /// Settings files, rendered and merged in order into `Values`
    #[arg(short = 's', long = "setting-files", global = true)]
    setting_files: Vec<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the config and print it
    Validate,

    /// Create or update the resource stack
    Resources,

    /// Delete the resource stack
    DeleteResources,

    /// Start a cluster and leave it waiting for steps
    StartCluster,

    /// Terminate a cluster
    TerminateCluster {
        /// Cluster id; defaults to the active cluster named after the config
        #[arg(short = 'c', long)]
        cluster_id: Option<String>,
    },

    /// Submit the configured steps to a running cluster and wait for them
    RunStep {
        /// Cluster id; defaults to the active cluster named after the config
        #[arg(short = 'c', long)]
        cluster_id: Option<String>,
    },

    /// Deploy resources, start a cluster with the steps and wait for it
    Run {
        /// Leave the cluster waiting after the steps finish
        #[arg(long, overrides_with = "no_keep_cluster")]
        keep_cluster: bool,

        /// Terminate the cluster after the steps finish
        #[arg(long, overrides_with = "keep_cluster")]
        no_keep_cluster: bool,
    },

    /// Terminate waiting clusters idle past their maxIdleMinutes tag
    CleanupIdle,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "emr_runner=debug,info"
    } else {
        "emr_runner=info,info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_file = cli
        .config_file
        .ok_or_else(|| anyhow::anyhow!("--config-file is required"))?;

    let mut resolver = ConfigResolver::new(&config_file, cli.setting_files);
    if let Commands::Run {
        keep_cluster,
        no_keep_cluster,
    } = &cli.command
    {
        if *keep_cluster || *no_keep_cluster {
            resolver.add_override_config("cluster.Instances.KeepJobFlowAliveWhenNoSteps", *keep_cluster);
        }
    }

    let config = resolver
        .load()
        .with_context(|| format!("failed to resolve {}", config_file.display()))?;
    let services = Services::load(config.deploy.region.as_deref()).await;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pending waits");
            on_interrupt.cancel();
        }
    });

    let mut runner = EmrRunner::with_config(resolver, config, services, PollSettings::default(), cancel);

    match cli.command {
        Commands::Validate => {
            runner.validate()?;
            println!("{}", runner.config().to_json_pretty()?);
        }

        Commands::Resources => {
            let outcome = runner.deploy_resources().await?;
            info!(outcome = ?outcome, "Done");
        }

        Commands::DeleteResources => {
            runner.delete_resources().await?;
            info!("Resource stack deleted");
        }

        Commands::StartCluster => {
            let cluster_id = runner.start_cluster().await?;
            println!("{}", cluster_id);
        }

        Commands::TerminateCluster { cluster_id } => {
            let cluster_id = runner.terminate_cluster(cluster_id).await?;
            info!(cluster_id = %cluster_id, "Cluster terminated");
        }

        Commands::RunStep { cluster_id } => {
            let step_ids = runner.run_steps(cluster_id).await?;
            info!(steps = step_ids.len(), "All steps completed");
        }

        Commands::Run { .. } => {
            let cluster_id = runner.run().await?;
            println!("{}", cluster_id);
        }

        Commands::CleanupIdle => {
            let terminated = runner.cleanup_idle().await?;
            info!(terminated = ?terminated, "Idle cleanup finished");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(["emr-runner"].iter().chain(args).copied()).unwrap()
    }

    #[test]
    fn test_cluster_id_short_flag() {
        let cli = parse(&["-f", "emr.yml", "run-step", "-c", "j-1"]);
        assert!(matches!(cli.command, Commands::RunStep { cluster_id: Some(ref id) } if id == "j-1"));

        let cli = parse(&["terminate-cluster", "--cluster-id", "j-2", "-f", "emr.yml"]);
        assert!(matches!(cli.command, Commands::TerminateCluster { cluster_id: Some(ref id) } if id == "j-2"));
        assert_eq!(cli.config_file, Some(PathBuf::from("emr.yml")));
    }

    #[test]
    fn test_global_flags() {
        let cli = parse(&["-f", "emr.yml", "-s", "a.yml", "-s", "b.yml", "-v", "validate"]);
        assert!(cli.verbose);
        assert_eq!(cli.setting_files, [PathBuf::from("a.yml"), PathBuf::from("b.yml")]);
        assert!(matches!(cli.command, Commands::Validate));
    }

    #[test]
    fn test_keep_cluster_flags_override_each_other() {
        let cli = parse(&["run", "--keep-cluster", "--no-keep-cluster"]);
        assert!(matches!(
            cli.command,
            Commands::Run {
                keep_cluster: false,
                no_keep_cluster: true
            }
        ));
    }

    #[test]
    fn test_missing_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["emr-runner", "-f", "emr.yml"]).is_err());
    }
}
