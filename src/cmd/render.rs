//! One-shot render command — `renderforge render`.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use renderforge::config::Settings;
use renderforge::render::models::{Job, JobStatus, Quality};
use renderforge::render::pipeline::Submission;
use renderforge::render::services::{Services, build_services};

/// Runs the job in-process and prints the final record. Returns whether the
/// job finished `done`.
pub async fn cmd_render(settings: &Settings, file: &Path, quality: Option<&str>, no_retry: bool) -> Result<bool> {
    let code = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let quality = match quality {
        Some(q) => q.parse::<Quality>().map_err(|e| anyhow!(e))?,
        None => settings.render.default_quality,
    };

    let services = build_services(settings).await?;
    let job = match services.pipeline.submit(&code, quality, !no_retry).await? {
        Submission::Cached(job) => job,
        // A fresh pipeline owns no jobs, so nothing can be in flight yet.
        Submission::InFlight(job) => bail!("Job {} is already rendering", job.job_id),
        Submission::Enqueued(job, task) => {
            services.pipeline.process(&task).await?;
            load(&services, &job.job_id).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(job.status == JobStatus::Done)
}

async fn load(services: &Services, job_id: &str) -> Result<Job> {
    services
        .pipeline
        .jobs()
        .get(job_id)
        .await?
        .ok_or_else(|| anyhow!("Job {} disappeared", job_id))
}
