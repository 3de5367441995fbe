use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod dispatch;

#[derive(Parser)]
#[command(name = "kube-job")]
#[command(about = "Run CI jobs in Kubernetes pods", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.config/kube-job/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage of a job, then clean up
    Run {
        /// Job definition (YAML)
        job: PathBuf,

        /// Serve the service proxy on this address while the job runs
        #[arg(long)]
        proxy_listen: Option<SocketAddr>,
    },

    /// Check cluster version, features and permissions
    Check,

    /// Delete the resources left behind by a job
    Cleanup {
        /// Job ID
        job_id: i64,
    },

    /// Show or initialize the config file
    Config {
        /// Print the config path only
        #[arg(long)]
        path: bool,

        /// Write a sample config
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    use Commands::*;

    match cli.command {
        Run { job, proxy_listen } => {
            let config = dispatch::load_config(cli.config.as_deref())?;
            commands::run(&config, &job, proxy_listen).await?;
        }
        Check => {
            let config = dispatch::load_config(cli.config.as_deref())?;
            commands::check(&config).await?;
        }
        Cleanup { job_id } => {
            let config = dispatch::load_config(cli.config.as_deref())?;
            commands::cleanup(&config, job_id).await?;
        }
        Config { path, init } => {
            commands::config(cli.config.as_deref(), path, init).await?;
        }
    }

    Ok(())
}
