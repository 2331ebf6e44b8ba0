//! Submit command implementation.
//!
//! Validates a job file and inserts it as SUBMITTED; a running server picks
//! it up on its next scheduler tick.

use std::path::Path;

use anyhow::Result;
use console::style;

use super::common::{create_controller, load_submission};

/// Execute the submit command.
pub async fn execute(config: Option<&Path>, input: &Path, priority: Option<i64>) -> Result<()> {
    let mut submission = load_submission(input)?;
    if let Some(priority) = priority {
        submission.priority = priority;
    }

    println!(
        "{} Submitting {} ({} scan axis/axes, priority {})",
        style("→").cyan().bold(),
        style(&submission.experiment_id).green(),
        submission.scan_parameters.len(),
        submission.priority
    );

    let controller = create_controller(config)?;
    let job_id = controller
        .submit(submission)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to submit job: {e}"))?;

    println!("{} Job submitted: {}", style("✓").green().bold(), style(job_id).cyan());
    Ok(())
}
