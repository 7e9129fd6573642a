//! Remediator CLI
//!
//! Runs the CI remediation service: HTTP intake for build failures and task
//! completions, the message consumer, and the CI build poller.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use notify::Notifier;
use remediation::{RemediationConfig, Service};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Automated CI remediation - turns failed builds into fix pull requests
#[derive(Parser)]
#[command(name = "remediator")]
#[command(about = "Automated CI remediation - turns failed builds into fix pull requests")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the JSON configuration file
    #[arg(long, env = "REMEDIATION_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// GitHub API token
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true, global = true)]
    github_token: Option<String>,

    /// Task service base URL
    #[arg(long, env = "TASKS_API_URL", global = true)]
    tasks_url: Option<String>,

    /// Task service API key
    #[arg(long, env = "TASKS_API_KEY", hide_env_values = true, global = true)]
    tasks_api_key: Option<String>,

    /// Database URL (e.g., sqlite://remediation.db); unset keeps state in memory
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Repository to poll (repeatable, adds to the configured list)
    #[arg(long = "repository", global = true)]
    repositories: Vec<String>,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP intake, message consumer and build poller
    Serve {
        /// Address to listen on
        #[arg(long, env = "REMEDIATION_ADDR", default_value = "0.0.0.0:8080")]
        addr: String,

        /// Do not poll CI (intake only)
        #[arg(long)]
        no_poller: bool,
    },
    /// Poll CI for failed builds
    Poll {
        /// Run a single poll cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Classify an error message against the pattern table
    Classify {
        /// Error message to classify
        message: String,
    },
    /// Print the effective configuration (secrets omitted)
    Config,
}

impl Cli {
    /// Configuration file plus command-line / environment overrides.
    fn load_config(&self) -> Result<RemediationConfig> {
        let mut config = RemediationConfig::load(self.config.as_deref())?;

        if let Some(token) = &self.github_token {
            config.github.token = Some(token.clone());
        }
        if let Some(url) = &self.tasks_url {
            config.task_service.url.clone_from(url);
        }
        if let Some(key) = &self.tasks_api_key {
            config.task_service.api_key = Some(key.clone());
        }
        if let Some(url) = &self.database_url {
            config.store.database_url = Some(url.clone());
        }
        for repository in &self.repositories {
            if !config.poller.repositories.contains(repository) {
                config.poller.repositories.push(repository.clone());
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(format: LogFormat, verbose: bool) {
    let default = if verbose {
        "remediation=debug,remediator=debug,notify=debug,scm=debug,tower_http=debug"
    } else {
        "remediation=info,remediator=info,notify=info,scm=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Token cancelled on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            return;
        }
        info!("Shutdown requested");
        cancel.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose);

    let config = cli.load_config()?;

    match cli.command {
        Commands::Serve { addr, no_poller } => run_serve_command(config, &addr, !no_poller).await,
        Commands::Poll { once } => run_poll_command(config, once).await,
        Commands::Classify { message } => run_classify_command(&config, &message),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

// =============================================================================
// Command handlers
// =============================================================================

async fn run_serve_command(config: RemediationConfig, addr: &str, with_poller: bool) -> Result<()> {
    println!("{}", "═".repeat(60).cyan());
    println!("{}", "CI REMEDIATION SERVICE".cyan().bold());
    println!("{}", "═".repeat(60).cyan());
    println!();
    println!("  Address:      {}", addr.green());
    println!("  Task service: {}", config.task_service.url.green());
    println!(
        "  Store:        {}",
        match config.store.database_url.as_deref() {
            Some(url) if !url.is_empty() => url.green(),
            _ => "in-memory".yellow(),
        }
    );
    println!(
        "  Poller:       {}",
        if with_poller && !config.poller.repositories.is_empty() {
            format!("{} repositories", config.poller.repositories.len()).green()
        } else {
            "disabled".red()
        }
    );
    println!();

    let service = Service::build(config, Notifier::from_env()).await?;
    service.serve(addr, with_poller, shutdown_on_ctrl_c()).await
}

async fn run_poll_command(config: RemediationConfig, once: bool) -> Result<()> {
    if config.poller.repositories.is_empty() {
        anyhow::bail!("No repositories configured; set poller.repositories or pass --repository");
    }

    let service = Service::build(config, Notifier::from_env()).await?;
    let mut poller = service.poller();

    if !once {
        return poller.run(shutdown_on_ctrl_c()).await;
    }

    let summary = poller.poll_once().await?;
    println!("{}", "Poll complete".cyan().bold());
    println!("  Runs seen:           {}", summary.runs_seen);
    println!("  Builds recorded:     {}", summary.builds_recorded);
    println!("  Failures dispatched: {}", summary.failures_dispatched);
    println!("  Fix attempts:        {}", summary.attempts_created.to_string().green());
    if summary.dispatch_errors > 0 || summary.record_errors > 0 || summary.repositories_failed > 0 {
        println!(
            "  Errors:              {}",
            format!(
                "{} dispatch, {} record, {} repository",
                summary.dispatch_errors, summary.record_errors, summary.repositories_failed
            )
            .red()
        );
    }
    Ok(())
}

fn run_classify_command(config: &RemediationConfig, message: &str) -> Result<()> {
    let classifier = config.classifier()?;
    match classifier.classify(message) {
        Some(label) => println!("{} {}", "Pattern:".bold(), label.green()),
        None => println!("{} {}", "Pattern:".bold(), "unrecognized (no fix would be attempted)".yellow()),
    }
    Ok(())
}
