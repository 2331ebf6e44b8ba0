//! Cancel command implementation.

use std::path::Path;

use anyhow::Result;
use console::style;

use super::common::{create_controller, parse_job_id};

/// Execute the cancel command.
pub async fn execute(config: Option<&Path>, job_id: &str) -> Result<()> {
    let job_id = parse_job_id(job_id)?;
    let controller = create_controller(config)?;

    let cancelled = controller
        .cancel(&job_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to cancel job: {e}"))?;

    if cancelled {
        println!("{} Cancelled job {}", style("✓").green().bold(), job_id);
    } else {
        println!(
            "{} Job {} was already processed",
            style("!").yellow().bold(),
            job_id
        );
    }
    Ok(())
}
