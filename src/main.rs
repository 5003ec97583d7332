//! labrun CLI - kernel test-job orchestration for Beaker.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use labrun::blacklist::Blacklist;
use labrun::config::{self, Config};
use labrun::interrupt::InterruptGuard;
use labrun::lab::BkrClient;
use labrun::orchestrator::{Orchestrator, RunRequest};
use labrun::report::print_summary;

#[derive(Parser)]
#[command(name = "labrun")]
#[command(about = "Kernel test-job orchestration for the Beaker lab scheduler", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "labrun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit jobs for a kernel build and optionally wait for the verdict
    Run {
        /// URL of the kernel artifact
        #[arg(long)]
        url: String,

        /// Kernel release
        #[arg(long)]
        release: String,

        /// Wait for the jobs and exit with the verdict code
        #[arg(long)]
        wait: bool,

        /// Identifier added to the job whiteboard
        #[arg(long, default_value = "")]
        uid: String,

        /// Target architecture
        #[arg(long, default_value = std::env::consts::ARCH)]
        arch: String,

        /// Run every recipe on this host
        #[arg(long)]
        host: Option<String>,

        /// Override the number of tolerated aborted recipe sets
        #[arg(long)]
        max_aborted: Option<u32>,

        /// Retry aborted recipe sets on the same host
        #[arg(long)]
        samehost: bool,

        /// Do not submit the soak job
        #[arg(long)]
        no_soak: bool,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            url,
            release,
            wait,
            uid,
            arch,
            host,
            max_aborted,
            samehost,
            no_soak,
        } => {
            let mut config = config::load_config(&cli.config).with_context(|| {
                format!("Failed to load config from {}", cli.config.display())
            })?;
            info!("Loaded configuration from {}", cli.config.display());

            // Apply overrides
            if samehost {
                config.runner.samehost = true;
            }
            if no_soak {
                config.runner.soak = false;
            }

            let request = RunRequest::new(url, release)
                .wait(wait)
                .uid(uid)
                .arch(arch)
                .host(host)
                .max_aborted(max_aborted);
            let code = run(config, request).await?;
            std::process::exit(code);
        }
        Commands::Validate => validate_config(&cli.config),
    }
}

async fn run(config: Config, request: RunRequest) -> Result<i32> {
    let guard = InterruptGuard::new();
    let client = BkrClient::new(&config.bkr)
        .context("Invalid bkr command")?
        .with_job_owner(config.runner.jobowner.clone())
        .with_cancellation(guard.token());

    let listener = guard
        .install()
        .context("Failed to install signal handlers")?;

    let orchestrator = Orchestrator::from_config(config.runner, client)?.with_guard(guard);
    let outcome = orchestrator.run(&request).await;
    listener.abort();

    if request.wait {
        print_summary(&outcome);
    } else {
        for job in &outcome.jobs {
            println!("{}", job);
        }
    }
    Ok(outcome.verdict.code())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)?;
    let runner = &config.runner;

    let template = runner.jobtemplate_path();
    std::fs::metadata(&template)
        .with_context(|| format!("Job template not found: {}", template.display()))?;
    if let Some(soak) = runner.soak_jobtemplate_path() {
        std::fs::metadata(&soak)
            .with_context(|| format!("Soak job template not found: {}", soak.display()))?;
    }
    let blacklist = match runner.blacklist_path() {
        Some(path) => Blacklist::load(&path)?,
        None => Blacklist::new(),
    };

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Job template: {}", template.display());
    if let Some(soak) = runner.soak_jobtemplate_path() {
        println!("  Soak template: {}", soak.display());
    }
    if let Some(owner) = &runner.jobowner {
        println!("  Job owner: {}", owner);
    }
    println!("  Blacklisted hosts: {}", blacklist.len());
    println!("  Watch delay: {}s", runner.watchdelay_secs);
    println!("  Max aborted: {}", runner.max_aborted);
    println!("  Same host retries: {}", runner.samehost);
    println!("  bkr command: {}", config.bkr.command);

    Ok(())
}
