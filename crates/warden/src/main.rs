//! Warden CLI
//!
//! Runs the compliance reconciler as a long-lived service, or performs a
//! single scan, inspection or configuration check from the command line.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use warden::outcome::{OutcomeRecord, OutcomeStatus, Trigger};
use warden::scheduler::ScanReport;
use warden::server::{run_server, ServerState};
use warden::trigger::{EventFilter, EventTrigger};
use warden::{app, WardenConfig};

/// Self-healing reconciler that keeps WAF Web ACLs attached to cloud resources
#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Self-healing reconciler that keeps WAF Web ACLs attached to cloud resources")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(long, short, default_value = "warden.yaml", env = "WARDEN_CONFIG", global = true)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum LogFormat {
    Json,
    #[default]
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Run periodic scans and the event endpoint until interrupted
    Run,
    /// Reconcile the fleet (or selected resources) once and exit
    Scan {
        /// Resource id to reconcile (repeatable, defaults to the whole fleet)
        #[arg(long = "resource", short)]
        resources: Vec<String>,
    },
    /// Show the observed state and verdict for one resource without changing it
    Inspect {
        /// Resource id to inspect
        #[arg(long)]
        resource: String,
    },
    /// Load and validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Run => run(&cli.config).await?,
        Commands::Scan { resources } => return scan(&cli.config, resources).await,
        Commands::Inspect { resource } => inspect(&cli.config, &resource).await?,
        Commands::Validate => validate(&cli.config)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "warden=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

fn load_config(path: &Path) -> Result<WardenConfig> {
    WardenConfig::load(path).with_context(|| format!("invalid configuration {}", path.display()))
}

// ============================================================================
// Commands
// ============================================================================

async fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let scheduler = app::build_scheduler(&config).await?;
    let shutdown = CancellationToken::new();

    let (tx, rx) = mpsc::channel(config.events.queue_capacity);
    let trigger = EventTrigger::new(
        Arc::clone(&scheduler),
        EventFilter::new(config.events.watched.iter().cloned()),
    );
    let state = Arc::new(ServerState {
        scheduler: Arc::clone(&scheduler),
        events: tx,
    });

    let periodic = tokio::spawn(
        Arc::clone(&scheduler).run_periodic(config.scan_interval(), shutdown.clone()),
    );
    let events = tokio::spawn(trigger.run(rx, shutdown.clone()));
    let mut server = {
        let shutdown = shutdown.clone();
        let addr = config.events.listen_addr.clone();
        tokio::spawn(async move { run_server(state, &addr, shutdown).await })
    };

    info!(
        scan_interval_secs = config.scan_interval_secs,
        listen_addr = %config.events.listen_addr,
        "Warden running"
    );

    let failed = tokio::select! {
        () = async { tokio::signal::ctrl_c().await.ok(); } => {
            info!("Received SIGINT, shutting down");
            shutdown.cancel();
            report_server_exit(server.await)
        }
        result = &mut server => {
            shutdown.cancel();
            report_server_exit(result)
        }
    };

    if let Err(e) = events.await {
        error!(error = %e, "Event trigger task aborted");
    }
    if let Err(e) = periodic.await {
        error!(error = %e, "Periodic scan task aborted");
    }
    scheduler.flush().await;

    info!("Warden stopped");
    if failed {
        anyhow::bail!("HTTP server exited with an error");
    }
    Ok(())
}

/// Log how the server task ended. Returns `true` if it failed.
fn report_server_exit(result: Result<Result<()>, tokio::task::JoinError>) -> bool {
    match result {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            error!(error = %e, "HTTP server failed");
            true
        }
        Err(e) => {
            error!(error = %e, "HTTP server task aborted");
            true
        }
    }
}

/// Exits with status 1 if any resource ended in a terminal failure.
async fn scan(config_path: &Path, resources: Vec<String>) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let scheduler = app::build_scheduler(&config).await?;

    let report = if resources.is_empty() {
        scheduler.run_full_scan().await
    } else {
        scheduler.run_scan(resources, Trigger::Manual).await
    };

    scheduler.flush().await;

    print_report(&report);
    if report.has_terminal_failures() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn inspect(config_path: &Path, id: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let scheduler = app::build_scheduler(&config).await?;

    let (resource, _) = scheduler
        .fleet()
        .lease(id)
        .await
        .with_context(|| format!("{id} is not a managed resource"))?;
    let observed = scheduler.inspector().inspect(&resource).await?;
    let verdict = scheduler.policies().evaluate(&resource, &observed);

    println!("{} {}", "Resource:".bold(), resource.id);
    println!("{} {}", "Kind:".bold(), resource.kind);
    println!(
        "{} {}",
        "Web ACL:".bold(),
        observed.web_acl_arn().unwrap_or("(none)")
    );
    let status = if verdict.compliant {
        "compliant".green()
    } else {
        "non-compliant".red()
    };
    println!("{} {status} ({})", "Status:".bold(), verdict.detail);
    Ok(())
}

fn validate(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let resources = config.resource_refs()?;
    let policies = config.policy_set()?;

    println!(
        "{}",
        format!("✓ {} is valid", config_path.display()).green()
    );
    println!("  resources:     {}", resources.len());
    println!("  policies:      {}", policies.len());
    for policy in policies.iter() {
        println!("    {:<28} {}", policy.kind().to_string(), policy.web_acl_arn());
    }
    println!("  workers:       {}", config.workers);
    println!("  scan interval: {}s", config.scan_interval_secs);
    println!("  listen addr:   {}", config.events.listen_addr);
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn print_report(report: &ScanReport) {
    for record in &report.outcomes {
        println!(
            "{:<11} {:<64} attempts={} {}",
            status_label(record),
            record.resource_id,
            record.attempts,
            record.detail.dimmed()
        );
    }
    for id in &report.coalesced {
        println!("{:<11} {id}", "coalesced".dimmed());
    }
    for id in &report.unmanaged {
        println!("{:<11} {id}", "unmanaged".yellow());
    }

    println!();
    println!(
        "{} compliant={} remediated={} removed={} failed={} cancelled={}",
        "Summary:".bold(),
        report.count(OutcomeStatus::Compliant),
        report.count(OutcomeStatus::Remediated),
        report.count(OutcomeStatus::Removed),
        report.count(OutcomeStatus::Failed),
        report.count(OutcomeStatus::Cancelled),
    );
}

fn status_label(record: &OutcomeRecord) -> colored::ColoredString {
    let label = format!("{:<11}", record.status.as_str());
    match record.status {
        OutcomeStatus::Compliant => label.green(),
        OutcomeStatus::Remediated => label.cyan(),
        OutcomeStatus::Removed | OutcomeStatus::Cancelled => label.yellow(),
        OutcomeStatus::Failed => label.red().bold(),
    }
}
