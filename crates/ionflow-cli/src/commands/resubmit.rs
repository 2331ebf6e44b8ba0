//! Resubmit command implementation.

use std::path::Path;

use anyhow::Result;
use console::style;

use super::common::{create_controller, parse_job_id};

/// Execute the resubmit command.
pub async fn execute(config: Option<&Path>, job_id: &str) -> Result<()> {
    let parent = parse_job_id(job_id)?;
    let controller = create_controller(config)?;

    let job_id = controller
        .resubmit(&parent)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to resubmit job: {e}"))?;

    println!(
        "{} Job submitted: {} (copy of {})",
        style("✓").green().bold(),
        style(job_id).cyan(),
        parent
    );
    Ok(())
}
