//! Status command implementation.
//!
//! Query job and run status from the local state store.

use std::path::Path;

use anyhow::Result;
use console::style;

use ionflow_sched::{JobFilter, JobStatus};

use super::common::{create_controller, parse_job_id, styled_run_status};

/// Execute the status command.
pub async fn execute(config: Option<&Path>, job_id: Option<&str>, all: bool) -> Result<()> {
    let controller = create_controller(config)?;

    if all {
        let jobs = controller
            .list_jobs(&JobFilter::default())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list jobs: {e}"))?;

        if jobs.is_empty() {
            println!("No jobs found.");
            return Ok(());
        }

        println!("{} {} job(s):\n", style("→").cyan().bold(), jobs.len());

        println!(
            "  {:<36}  {:<28}  {:<10}  {:<4}  {:<10}  {}",
            style("JOB ID").bold(),
            style("EXPERIMENT").bold(),
            style("STATUS").bold(),
            style("PRIO").bold(),
            style("RUN").bold(),
            style("CREATED").bold()
        );
        println!("  {}", "-".repeat(110));

        for job in &jobs {
            let run = controller
                .run_for_job(&job.id)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to load run: {e}"))?;
            let run_status = match run {
                Some(run) => styled_run_status(run.status).to_string(),
                None => style("-").dim().to_string(),
            };
            let status = job.status.name();
            let status_styled = match job.status {
                JobStatus::Submitted => style(status).yellow(),
                JobStatus::Processing => style(status).cyan(),
                JobStatus::Processed => style(status).green(),
            };

            println!(
                "  {:<36}  {:<28}  {:<10}  {:<4}  {:<10}  {}",
                style(job.id).dim(),
                job.experiment.id,
                status_styled,
                job.priority.value(),
                run_status,
                job.created_at.format("%Y-%m-%d %H:%M"),
            );
        }

        return Ok(());
    }

    let job_id_str = job_id
        .ok_or_else(|| anyhow::anyhow!("Please provide a job ID or use --all to list all jobs"))?;
    let job_id = parse_job_id(job_id_str)?;

    let job = controller
        .job(&job_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get status: {e}"))?;

    println!("{} Job {}", style("→").cyan().bold(), style(job.id).cyan());
    println!("  Experiment:  {}", job.experiment);
    println!("  Status:      {}", style(job.status.name()).bold());
    println!("  Priority:    {}", job.priority.value());
    println!(
        "  Mode:        {}",
        if job.is_continuous() {
            "continuous".to_string()
        } else {
            format!(
                "{} axis/axes x {} repetition(s)",
                job.scan_parameters.len(),
                job.repetitions
            )
        }
    );
    if let Some(parent) = job.parent_job {
        println!("  Copy of:     {parent}");
    }

    match controller
        .run_for_job(&job.id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load run: {e}"))?
    {
        Some(run) => {
            println!("  Run:         {}", style(run.id).dim());
            println!("  Run status:  {}", styled_run_status(run.status).bold());
            println!("  Result key:  {}", run.result_key());
            if let Some(log) = run.log {
                println!("  Log:         {log}");
            }
        }
        None => println!("  Run:         {}", style("not scheduled yet").dim()),
    }

    Ok(())
}
