//! Autoheal CLI
//!
//! Serves the remediation HTTP API, or performs a single run and prints its
//! final results as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use autoheal::adapters::{
    ChatFixPlanner, CommandSandbox, GitCli, GitHubActions, GitHubClient, LayeredPlanner,
    RuleClassifier,
};
use autoheal::remediation::{Capabilities, Orchestrator, RunRequest};
use autoheal::server::{run_server, ServerState};
use autoheal::Config;

/// Autonomous repository remediation - runs tests, patches failures, and watches CI until green
#[derive(Parser)]
#[command(name = "autoheal")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file
    #[arg(long, env = "AUTOHEAL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Listen address, overrides the config file
        #[arg(long)]
        bind: Option<String>,
    },
    /// Remediate one repository and print the final results
    Run {
        /// Repository to clone
        #[arg(long)]
        repo: String,

        /// Team name, used in the branch name
        #[arg(long)]
        team: String,

        /// Team leader name, used in the branch name
        #[arg(long)]
        leader: String,

        /// Iteration budget, at most the configured maximum
        #[arg(long)]
        max_iterations: Option<u32>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("autoheal=info,tower_http=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let github = GitHubClient::new(&config.github.api_base, config.github.token.clone())
        .context("Failed to create GitHub client")?;

    let model = if config.llm_enabled() {
        info!(model = %config.llm.model, "Model fallback enabled for fix generation");
        Some(ChatFixPlanner::new(config.llm.clone()).context("Failed to create model client")?)
    } else {
        None
    };

    let caps = Capabilities {
        repository: Arc::new(GitCli::new(
            config.sandbox.workspace_dir.clone(),
            github.clone(),
        )),
        ci: Arc::new(GitHubActions::new(github)),
        sandbox: Arc::new(
            CommandSandbox::new(
                config.sandbox.test_command.clone(),
                Duration::from_secs(config.sandbox.timeout_secs),
            )
            .with_discovery(config.sandbox.discover_framework),
        ),
        diagnoser: Arc::new(RuleClassifier::new()),
        planner: Arc::new(LayeredPlanner::new(model)),
    };
    Ok(Orchestrator::new(caps, config.orchestrator_settings()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let orchestrator = build_orchestrator(&config)?;

    match cli.command {
        Commands::Serve { bind } => {
            let addr = bind.unwrap_or_else(|| config.server.bind.clone());
            run_server(Arc::new(ServerState::new(orchestrator)), &addr).await?;
        }
        Commands::Run {
            repo,
            team,
            leader,
            max_iterations,
        } => {
            let run_id = orchestrator
                .start(RunRequest {
                    repo_url: repo,
                    team_name: team,
                    leader_name: leader,
                    max_iterations,
                })
                .await?;
            info!(%run_id, "Run started");

            let results = orchestrator
                .wait_for(run_id, Duration::from_secs(1))
                .await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    Ok(())
}
