use std::sync::Arc;

use anyhow::{Context, Result, bail};

use cronpilot_config::CronPilotConfig;
use cronpilot_cron::CronJob;
use cronpilot_cron::manager::CronManager;
use cronpilot_exec::JobRunner;
use cronpilot_types::NullSink;

/// List jobs straight from the crontab.
pub async fn run_list(config: &CronPilotConfig, user: Option<String>, json: bool) -> Result<()> {
    let manager = CronManager::from_config(&config.cron);
    let jobs = match user {
        Some(user) => manager.list_jobs(&user).await,
        None => manager.list_all_jobs().await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No cron jobs found.");
        return Ok(());
    }
    println!("{:<10} {:<10} {:<18} {:<6} COMMAND", "ID", "USER", "SCHEDULE", "FLAGS");
    for job in &jobs {
        println!("{}", format_row(job));
    }
    Ok(())
}

fn format_row(job: &CronJob) -> String {
    let flags = format!(
        "{}{}",
        if job.paused { "P" } else { "-" },
        if job.logs_enabled { "L" } else { "-" }
    );
    let mut row = format!(
        "{:<10} {:<10} {:<18} {:<6} {}",
        job.id, job.user, job.schedule, flags, job.command
    );
    if let Some(comment) = &job.comment {
        row.push_str(&format!("  # {comment}"));
    }
    row
}

/// Run a job from the command line.
pub async fn run_job(config: &CronPilotConfig, id: &str, background: bool) -> Result<()> {
    let manager = Arc::new(CronManager::from_config(&config.cron));
    let runner = JobRunner::from_config(manager, Arc::new(NullSink), &config.cron, &config.exec);

    let outcome = runner
        .execute(id, background)
        .await
        .with_context(|| format!("Cannot run job {id}"))?;

    if outcome.background {
        println!("Started run {} (pid {:?})", outcome.run_id, outcome.pid);
        if let Some(log_file) = &outcome.log_file {
            println!("Output: {log_file}");
        }
        return Ok(());
    }

    if let Some(info) = &outcome.exit_info {
        print!("{}", info.stdout);
        eprint!("{}", info.stderr);
    }
    if !outcome.success {
        bail!("{}", outcome.message);
    }
    println!("{}", outcome.message);
    Ok(())
}

/// Print configuration and crontab reachability.
pub async fn run_health(config: &CronPilotConfig) {
    let manager = CronManager::from_config(&config.cron);
    let users = manager.list_users().await;

    println!("cronpilot is healthy");
    println!("  mode: {}", if config.cron.is_bridged() { "bridged" } else { "host" });
    println!("  users: {}", users.join(", "));
    println!("  jobs: {}", manager.list_all_jobs().await.len());
    println!("  wrapper: {}", config.cron.wrapper_path().display());
    println!("  log dir: {}", config.cron.log_dir().display());
    println!("  gateway: {}:{}", config.gateway.host, config.gateway.port);
}
