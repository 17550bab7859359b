use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{debug, info};

use jobguard::app::{handle_fatal_error, init_logging, Services};
use jobguard::config::load_config;
use jobguard::error::{ErrorCode, JobGuardError};
use jobguard::orchestrator::{HealthLevel, Orchestrator, PlanStatus, RecoveryAction};
use jobguard::recovery::CorruptionReport;

/// Operate the resilience layer of a job pipeline
#[derive(Parser)]
#[command(name = "jobguard", version)]
#[command(about = "Diagnose, recover and monitor an asynchronous job pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check every component and report overall health
    Diagnose {
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Describe the available recovery actions
    Actions,
    /// Execute recovery actions in order, e.g. `recover clear_stuck_tasks scale_workers:4`
    Recover {
        #[arg(required = true)]
        actions: Vec<RecoveryAction>,
        /// Print the plan report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-run integrity validation on a stored job record
    Check { job_id: String },
    /// Repair a corrupted job record from backup or field-level fixes
    Repair {
        job_id: String,
        /// What was observed, recorded in the recovery audit log
        #[arg(long, default_value = "operator requested repair")]
        reason: String,
        /// Print the recovery result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and maintain the dead letter store
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// Inspect and manage active alerts
    Alerts {
        #[command(subcommand)]
        command: AlertCommands,
    },
    /// Run the monitor loop until interrupted
    Monitor {
        /// Run a single cycle and print its report
        #[arg(long)]
        once: bool,
    },
    /// Validation, recovery and dead letter statistics
    Stats,
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List entries, newest first
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Counters and fill level
    Stats,
    /// Group recent entries by category, queue and error signature
    Analyze {
        /// Entries to sample (default: dlq.analysis_sample_size)
        #[arg(long)]
        sample: Option<usize>,
    },
    /// Delete entries older than N days
    Purge {
        #[arg(long)]
        days: u32,
    },
    /// Delete every entry and counter
    Clear,
}

#[derive(Subcommand)]
enum AlertCommands {
    /// List active alerts, most severe first
    List,
    /// Acknowledge an alert by ID
    Ack { id: String },
    /// Drop every active alert
    Clear,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let config = match load_config(cli.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            init_logging(verbose, "warn");
            handle_fatal_error(e.into(), verbose)
        }
    };
    init_logging(verbose, config.effective_log_level());

    if let Err(e) = run(cli.command, config).await {
        handle_fatal_error(e, verbose);
    }
}

async fn run(command: Commands, config: jobguard::JobGuardConfig) -> anyhow::Result<()> {
    if let Commands::Config = command {
        print!(
            "{}",
            toml::to_string_pretty(&config).context("Failed to render configuration")?
        );
        return Ok(());
    }
    if let Commands::Actions = command {
        print_action_docs();
        return Ok(());
    }

    let services = Services::connect(config).await?;
    debug!("Services ready");

    match command {
        Commands::Diagnose { json } => run_diagnose(&services.orchestrator(), json).await,
        Commands::Recover { actions, json } => run_recover(&services, &actions, json).await,
        Commands::Check { job_id } => run_check(&services, &job_id).await,
        Commands::Repair {
            job_id,
            reason,
            json,
        } => run_repair(&services, &job_id, &reason, json).await,
        Commands::Dlq { command } => run_dlq_command(&services, command).await,
        Commands::Alerts { command } => run_alert_command(&services, command).await,
        Commands::Monitor { once } => run_monitor(&services, once).await,
        Commands::Stats => run_stats(&services).await,
        Commands::Config | Commands::Actions => Ok(()),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_action_docs() {
    for doc in Orchestrator::action_docs() {
        println!("{} [{:?} risk]", doc.name, doc.risk);
        println!("    {}", doc.description);
        println!("    When: {}", doc.when_to_use);
    }
}

async fn run_diagnose(orchestrator: &Orchestrator, json: bool) -> anyhow::Result<()> {
    let report = orchestrator.diagnose().await;
    if json {
        return print_json(&report);
    }

    println!("Overall health: {}", report.overall_health);
    for (name, component) in &report.components {
        println!("  {:<14} {}", name, component.health);
    }
    if !report.issues.is_empty() {
        println!("\nIssues:");
        for issue in &report.issues {
            println!("  [{}] {}: {}", issue.severity, issue.component, issue.message);
        }
    }
    if !report.recommendations.is_empty() {
        println!("\nRecommendations:");
        for recommendation in &report.recommendations {
            println!("  - {}", recommendation);
        }
    }
    if !report.suggested_actions.is_empty() {
        let actions: Vec<String> = report
            .suggested_actions
            .iter()
            .map(|a| a.to_string())
            .collect();
        println!("\nSuggested plan: jobguard recover {}", actions.join(" "));
    }
    if report.overall_health == HealthLevel::Healthy {
        info!("All components healthy");
    }
    Ok(())
}

async fn run_recover(
    services: &Services,
    actions: &[RecoveryAction],
    json: bool,
) -> anyhow::Result<()> {
    let report = services.orchestrator().execute_plan(actions).await;
    if json {
        print_json(&report)?;
    } else {
        for result in &report.results {
            let mark = if result.success { "ok" } else { "FAILED" };
            println!(
                "{:<28} {:<6} {} ({}ms)",
                result.action.to_string(),
                mark,
                result.message,
                result.duration_ms
            );
        }
        println!(
            "\nPlan {}: {} succeeded, {} failed",
            report.plan_id, report.success_count, report.failure_count
        );
    }
    if report.overall_status == PlanStatus::Failed {
        return Err(JobGuardError::recovery(
            ErrorCode::RECOVERY_ACTION_FAILED,
            format!("every recovery action failed in plan {}", report.plan_id),
            None,
        )
        .into());
    }
    Ok(())
}

async fn run_check(services: &Services, job_id: &str) -> anyhow::Result<()> {
    let session = services.sessions.acquire("cli-check");
    let job = session
        .get(job_id)
        .await
        .context("Failed to load job")?
        .ok_or_else(|| {
            JobGuardError::processing(
                ErrorCode::PROCESSING_JOB_NOT_FOUND,
                "no such job",
                Some(job_id.to_string()),
            )
        })?;

    let result = services.validator.check_stored(&job).await;
    for issue in &result.issues {
        println!(
            "[{:?}] {}{}: {}",
            issue.severity,
            issue.code,
            issue.field.as_deref().map(|f| format!(" ({})", f)).unwrap_or_default(),
            issue.message
        );
    }
    let result = result.ensure_valid()?;
    println!("Job {} is valid ({:?} checks)", result.job_id, result.stage);
    Ok(())
}

async fn run_repair(
    services: &Services,
    job_id: &str,
    reason: &str,
    json: bool,
) -> anyhow::Result<()> {
    let session = services.sessions.acquire("cli-repair");
    let result = services
        .recovery
        .recover_corrupted(&session, job_id, &CorruptionReport::new(reason))
        .await;
    if json {
        print_json(&result)?;
    } else {
        let method = result
            .method_used
            .map(|m| format!("{:?}", m))
            .unwrap_or_else(|| "none".to_string());
        println!(
            "{:?} via {} (validation passed: {})",
            result.status, method, result.validation_passed
        );
        for note in &result.notes {
            println!("  - {}", note);
        }
    }
    result.ensure_recovered()?;
    Ok(())
}

async fn run_dlq_command(services: &Services, command: DlqCommands) -> anyhow::Result<()> {
    let dlq = &services.dlq;
    match command {
        DlqCommands::List { limit, offset } => {
            let entries = dlq
                .list(limit, offset)
                .await
                .context("Failed to list dead letters")?;
            if entries.is_empty() {
                println!("No dead letter entries.");
            }
            for entry in entries {
                println!(
                    "{}  {}  {} [{}] retries={}  {}",
                    entry.failed_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.job_id,
                    entry.error_type,
                    entry.error_category.as_str(),
                    entry.retry_count,
                    entry.error_message
                );
            }
        }
        DlqCommands::Stats => print_json(&dlq.stats().await?)?,
        DlqCommands::Analyze { sample } => {
            let sample = sample.unwrap_or(dlq.config().analysis_sample_size);
            print_json(&dlq.analyze_patterns(sample).await?)?;
        }
        DlqCommands::Purge { days } => {
            let purged = dlq.purge_older_than(days).await?;
            println!("Purged {} entries older than {} days", purged, days);
        }
        DlqCommands::Clear => {
            if !dlq.clear().await {
                bail!("dead letter store could not be cleared");
            }
            println!("Dead letter store cleared");
        }
    }
    Ok(())
}

async fn run_alert_command(services: &Services, command: AlertCommands) -> anyhow::Result<()> {
    let monitor = services.monitor();
    monitor
        .restore_alerts()
        .await
        .context("Failed to load active alerts")?;
    match command {
        AlertCommands::List => {
            let active = monitor.alerts().list_active();
            if active.is_empty() {
                println!("No active alerts.");
            }
            for alert in active {
                let ack = if alert.acknowledged { " (acknowledged)" } else { "" };
                println!("[{}] {}{}: {}", alert.severity, alert.id, ack, alert.message);
                if let Some(action) = alert.suggested_action {
                    println!("    suggested: jobguard recover {}", action);
                }
            }
        }
        AlertCommands::Ack { id } => {
            if !monitor.acknowledge(&id).await {
                bail!("no active alert with id '{}'", id);
            }
            println!("Acknowledged {}", id);
        }
        AlertCommands::Clear => {
            let cleared = monitor.clear_alerts().await;
            println!("Cleared {} alerts", cleared);
        }
    }
    Ok(())
}

async fn run_monitor(services: &Services, once: bool) -> anyhow::Result<()> {
    let monitor = services.monitor();
    if let Err(e) = monitor.restore_alerts().await {
        debug!("No persisted alerts restored: {}", e);
    }
    if once {
        return print_json(&monitor.run_cycle().await);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = services
        .sessions
        .spawn_reaper(services.config.sessions.reap_interval, shutdown_rx.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    monitor.run(shutdown_rx).await;
    reaper.await.context("Session reaper panicked")?;
    Ok(())
}

#[derive(Serialize)]
struct StatsReport {
    validation: jobguard::validation::ValidationStats,
    recovery: jobguard::recovery::RecoveryStats,
    dead_letters: jobguard::dlq::DlqStats,
}

async fn run_stats(services: &Services) -> anyhow::Result<()> {
    let report = StatsReport {
        validation: services.validator.cache().stats().await?,
        recovery: services.recovery.audit().stats().await?,
        dead_letters: services.dlq.stats().await?,
    };
    print_json(&report)
}
