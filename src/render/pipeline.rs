use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::PipelineError;
use crate::render::cache::{self, CacheNamespace, ResultCache};
use crate::render::jobs::JobStore;
use crate::render::llm::CodeRepair;
use crate::render::models::{Job, JobStatus, JobUpdate, Quality};
use crate::render::sandbox::{SandboxOutcome, SceneRenderer};
use crate::render::storage::ArtifactStore;
use crate::render::validator::CodeValidator;

/// One unit of dispatched work.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTask {
    pub job_id: String,
    pub code: String,
    pub quality: Quality,
    pub allow_retry: bool,
}

/// Outcome of submitting code for rendering.
#[derive(Debug)]
pub enum Submission {
    /// A previous render of identical input was reused; the job is already done.
    Cached(Job),
    /// Identical input is already being rendered by this process under this job.
    InFlight(Job),
    /// A new job was created and must be dispatched.
    Enqueued(Job, RenderTask),
}

impl Submission {
    pub fn job(&self) -> &Job {
        match self {
            Self::Cached(job) | Self::InFlight(job) | Self::Enqueued(job, _) => job,
        }
    }
}

// Advisory progress per stage; `attempt` is 1-based.
fn validating_progress(attempt: u32) -> u8 {
    (10 + (attempt - 1) * 10).min(40) as u8
}

fn retrying_validation_progress(attempt: u32) -> u8 {
    (20 + attempt * 15).min(80) as u8
}

fn rendering_progress(attempt: u32) -> u8 {
    (20 + (attempt - 1) * 20).min(80) as u8
}

fn retrying_runtime_progress(attempt: u32) -> u8 {
    (40 + attempt * 20).min(90) as u8
}

/// Validate → render → repair loop for a single job.
///
/// Each job is processed sequentially by one caller; distinct jobs may run
/// concurrently and share only the job store and the result cache.
pub struct RenderPipeline {
    jobs: Arc<dyn JobStore>,
    cache: ResultCache,
    storage: ArtifactStore,
    renderer: Arc<dyn SceneRenderer>,
    repairer: Arc<dyn CodeRepair>,
    validator: CodeValidator,
    max_retries: u32,
    /// Serializes cache lookup and job creation in `submit`.
    submit_lock: Mutex<()>,
    /// Jobs created by this pipeline whose processing has not returned yet.
    owned: StdMutex<HashSet<String>>,
}

impl RenderPipeline {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        cache: ResultCache,
        storage: ArtifactStore,
        renderer: Arc<dyn SceneRenderer>,
        repairer: Arc<dyn CodeRepair>,
        max_retries: u32,
    ) -> Self {
        Self {
            jobs,
            cache,
            storage,
            renderer,
            repairer,
            validator: CodeValidator::new(),
            max_retries,
            submit_lock: Mutex::new(()),
            owned: StdMutex::new(HashSet::new()),
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn storage(&self) -> &ArtifactStore {
        &self.storage
    }

    pub fn validator(&self) -> &CodeValidator {
        &self.validator
    }

    fn owns(&self, job_id: &str) -> bool {
        self.owned.lock().unwrap_or_else(|e| e.into_inner()).contains(job_id)
    }

    fn claim(&self, job_id: &str) {
        self.owned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.to_string());
    }

    fn release(&self, job_id: &str) {
        self.owned.lock().unwrap_or_else(|e| e.into_inner()).remove(job_id);
    }

    /// Create a job for `code`, reusing a cached render of identical input
    /// when one exists.
    ///
    /// - finished hit with the video still stored → new job cloned as `done`
    /// - hit still in progress in this process → that job, unchanged
    /// - failed, timed out or vanished hit → treated as a miss
    /// - non-terminal hit nobody here is processing (crash, restart, dropped
    ///   task) → treated as a miss; the stale job is left untouched
    pub async fn submit(&self, code: &str, quality: Quality, allow_retry: bool) -> Result<Submission, PipelineError> {
        let fingerprint = cache::fingerprint(&cache::render_canonical(quality, code));
        let _guard = self.submit_lock.lock().await;

        if let Some(cached_id) = self.cache.get(CacheNamespace::Render, &fingerprint).await
            && let Some(cached) = self.jobs.get(&cached_id).await.map_err(PipelineError::JobStore)?
        {
            match cached.status {
                JobStatus::Done => {
                    if let Some(job) = self.clone_finished(&cached_id).await? {
                        info!(job_id = %job.job_id, source_job_id = %cached_id, "render cache hit");
                        return Ok(Submission::Cached(job));
                    }
                }
                status if !status.is_terminal() && self.owns(&cached_id) => {
                    info!(job_id = %cached_id, "identical render already in flight");
                    return Ok(Submission::InFlight(cached));
                }
                status if !status.is_terminal() => {
                    warn!(job_id = %cached_id, status = %status, "cached render has no live owner; starting a new job");
                }
                _ => {}
            }
        }

        let job = self.jobs.create().await.map_err(PipelineError::JobStore)?;
        self.claim(&job.job_id);
        self.cache
            .put(CacheNamespace::Render, &fingerprint, &job.job_id)
            .await;
        let task = RenderTask {
            job_id: job.job_id.clone(),
            code: code.to_string(),
            quality,
            allow_retry,
        };
        Ok(Submission::Enqueued(job, task))
    }

    /// Clone a finished job's video into a new `done` job. `None` when the
    /// source video is gone.
    async fn clone_finished(&self, source_job_id: &str) -> Result<Option<Job>, PipelineError> {
        if self.storage.get(source_job_id).await?.is_none() {
            return Ok(None);
        }
        let job = self.jobs.create().await.map_err(PipelineError::JobStore)?;
        let Some(path) = self.storage.clone_artifact(source_job_id, &job.job_id).await? else {
            self.update(&job.job_id, JobUpdate::status(JobStatus::Failed, "failed", 100).with_error("Cached video disappeared"))
                .await?;
            return Ok(None);
        };
        let job = self
            .update(
                &job.job_id,
                JobUpdate::status(JobStatus::Done, "done", 100).with_video_path(path.display().to_string()),
            )
            .await?;
        Ok(Some(job))
    }

    /// Mark a submitted job that will never be processed as failed.
    pub async fn abandon(&self, job_id: &str, reason: &str) -> Result<(), PipelineError> {
        self.release(job_id);
        self.terminate(job_id, JobStatus::Failed, "failed", Some(reason.to_string()))
            .await?;
        Ok(())
    }

    /// Run the attempt loop for one job and return its terminal status.
    ///
    /// Recoverable failures are recorded on the job. `Err` is reserved for
    /// infrastructure failures (job store, artifact store); on `Err` the job
    /// is still moved to `failed` when the store allows it.
    pub async fn process(&self, task: &RenderTask) -> Result<JobStatus, PipelineError> {
        let result = self.attempt_loop(task).await;
        self.release(&task.job_id);
        if let Err(e) = &result {
            self.fail_unfinished(&task.job_id, e).await;
        }
        result
    }

    /// Best effort: leave no job non-terminal after processing gave up.
    async fn fail_unfinished(&self, job_id: &str, cause: &PipelineError) {
        match self.jobs.get(job_id).await {
            Ok(Some(job)) if !job.status.is_terminal() => {
                let update = JobUpdate::status(JobStatus::Failed, "failed", 100).with_error(cause.to_string());
                if let Err(e) = self.jobs.update(job_id, update).await {
                    warn!(job_id, error = %e, "failed to record processing failure");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(job_id, error = %e, "failed to load job after processing failure"),
        }
    }

    async fn attempt_loop(&self, task: &RenderTask) -> Result<JobStatus, PipelineError> {
        let job_id = task.job_id.as_str();
        let job = self
            .jobs
            .get(job_id)
            .await
            .map_err(PipelineError::JobStore)?
            .ok_or_else(|| PipelineError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        if job.status.is_terminal() {
            info!(job_id, status = %job.status, "job already finished; skipping");
            return Ok(job.status);
        }

        let attempts = if task.allow_retry {
            self.max_retries.saturating_add(1)
        } else {
            1
        };
        let mut code = task.code.clone();
        let mut progress = job.progress;
        let mut attempt = 1;

        loop {
            let retries_left = attempt < attempts;
            let validating = JobUpdate::status(JobStatus::Validating, "validating", validating_progress(attempt));
            self.advance(job_id, &mut progress, validating).await?;

            let validation = self.validator.validate(&code);
            if !validation.ok {
                let message = format!("Validation failed: {}", validation.joined());
                info!(job_id, attempt, violations = validation.errors.len(), "validation failed");
                if !retries_left {
                    return self.terminate(job_id, JobStatus::Failed, "validation", Some(message)).await;
                }
                let retrying = JobUpdate::status(
                    JobStatus::Retrying,
                    "retrying_validation",
                    retrying_validation_progress(attempt),
                )
                .with_error(message.clone());
                self.advance(job_id, &mut progress, retrying).await?;
                code = self.adopt_repair(job_id, code, &message).await;
                attempt += 1;
                continue;
            }

            let rendering =
                JobUpdate::status(JobStatus::Rendering, "rendering", rendering_progress(attempt)).clear_error();
            self.advance(job_id, &mut progress, rendering).await?;

            match self.renderer.render(job_id, &code, task.quality).await {
                SandboxOutcome::Success(artifact) => {
                    let stored = match self.storage.put(job_id, &artifact).await {
                        Ok(path) => path,
                        Err(e) => {
                            warn!(job_id, error = %e, "failed to store rendered video");
                            self.terminate(job_id, JobStatus::Failed, "failed", Some(format!("Failed to store video: {e}")))
                                .await?;
                            return Err(e.into());
                        }
                    };
                    let update = JobUpdate::status(JobStatus::Done, "done", 100)
                        .clear_error()
                        .with_video_path(stored.display().to_string());
                    self.update(job_id, update).await?;
                    info!(job_id, attempt, renderer = self.renderer.name(), "render finished");
                    return Ok(JobStatus::Done);
                }
                SandboxOutcome::Timeout => {
                    return self
                        .terminate(job_id, JobStatus::Timeout, "timeout", Some("Render timed out".to_string()))
                        .await;
                }
                SandboxOutcome::Failure(diagnostic) => {
                    info!(job_id, attempt, "render failed");
                    if !retries_left {
                        return self.terminate(job_id, JobStatus::Failed, "failed", Some(diagnostic)).await;
                    }
                    let retrying = JobUpdate::status(
                        JobStatus::Retrying,
                        "retrying_runtime",
                        retrying_runtime_progress(attempt),
                    )
                    .with_error(diagnostic.clone());
                    self.advance(job_id, &mut progress, retrying).await?;
                    code = self.adopt_repair(job_id, code, &diagnostic).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Ask for a repair; keep the current code when the repair is blank.
    async fn adopt_repair(&self, job_id: &str, code: String, diagnostic: &str) -> String {
        let candidate = self.repairer.repair(&code, diagnostic).await;
        if candidate.trim().is_empty() {
            warn!(job_id, "repair returned empty code; retrying with previous code");
            return code;
        }
        candidate
    }

    /// Non-terminal transition. Progress never moves backwards within a pass.
    async fn advance(&self, job_id: &str, progress: &mut u8, mut update: JobUpdate) -> Result<(), PipelineError> {
        if let Some(target) = update.progress {
            *progress = (*progress).max(target);
            update.progress = Some(*progress);
        }
        let job = self.update(job_id, update).await?;
        info!(job_id, status = %job.status, stage = %job.stage, progress = job.progress, "job transition");
        Ok(())
    }

    async fn terminate(
        &self,
        job_id: &str,
        status: JobStatus,
        stage: &str,
        error: Option<String>,
    ) -> Result<JobStatus, PipelineError> {
        let mut update = JobUpdate::status(status, stage, 100);
        if let Some(error) = error {
            update = update.with_error(error);
        }
        self.update(job_id, update).await?;
        info!(job_id, status = %status, stage, "job finished");
        Ok(status)
    }

    async fn update(&self, job_id: &str, update: JobUpdate) -> Result<Job, PipelineError> {
        self.jobs
            .update(job_id, update)
            .await
            .map_err(PipelineError::JobStore)?
            .ok_or_else(|| PipelineError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::render::fixtures::VALID_SCENE;

    fn invalid_scene() -> String {
        format!("import os\n{}", VALID_SCENE)
    }

    #[test]
    fn test_progress_formulas() {
        assert_eq!(
            [1, 2, 3, 4, 5].map(validating_progress),
            [10, 20, 30, 40, 40]
        );
        assert_eq!([1, 2, 3, 4].map(retrying_validation_progress), [35, 50, 65, 80]);
        assert_eq!([1, 2, 3, 4, 5].map(rendering_progress), [20, 40, 60, 80, 80]);
        assert_eq!([1, 2, 3].map(retrying_runtime_progress), [60, 80, 90]);
    }

    #[tokio::test]
    async fn test_valid_scene_reaches_done() {
        let h = harness(vec![Step::Succeed], vec![]);
        let task = h.enqueue(VALID_SCENE, true).await;

        let status = h.pipeline.process(&task).await.unwrap();
        assert_eq!(status, JobStatus::Done);
        assert_eq!(
            h.jobs.statuses(),
            vec![JobStatus::Queued, JobStatus::Validating, JobStatus::Rendering, JobStatus::Done]
        );

        let job = h.job(&task.job_id).await;
        assert_eq!(job.progress, 100);
        assert_eq!(job.stage, "done");
        assert!(job.error.is_none());
        let video = job.video_path.expect("video path set");
        assert_eq!(std::fs::read_to_string(video).unwrap(), format!("video for {}", task.job_id));
        assert_eq!(h.repair.calls(), 0);
    }

    #[tokio::test]
    async fn test_forbidden_import_without_retry_fails_immediately() {
        let h = harness(vec![], vec![]);
        let task = h.enqueue(&invalid_scene(), false).await;

        let status = h.pipeline.process(&task).await.unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(
            h.jobs.statuses(),
            vec![JobStatus::Queued, JobStatus::Validating, JobStatus::Failed]
        );

        let job = h.job(&task.job_id).await;
        assert_eq!(job.stage, "validation");
        assert_eq!(job.progress, 100);
        let error = job.error.unwrap();
        assert!(error.starts_with("Validation failed: "));
        assert!(error.contains("Forbidden import: os"));
        assert_eq!(h.repair.calls(), 0);
        assert_eq!(h.renderer.calls(), 0);
    }

    #[tokio::test]
    async fn test_validation_repair_then_done() {
        let h = harness(vec![Step::Succeed], vec![VALID_SCENE]);
        let task = h.enqueue(&invalid_scene(), true).await;

        assert_eq!(h.pipeline.process(&task).await.unwrap(), JobStatus::Done);
        let statuses = h.jobs.statuses();
        assert_eq!(statuses.iter().filter(|s| **s == JobStatus::Retrying).count(), 1);
        assert_eq!(
            statuses,
            vec![
                JobStatus::Queued,
                JobStatus::Validating,
                JobStatus::Retrying,
                JobStatus::Validating,
                JobStatus::Rendering,
                JobStatus::Done,
            ]
        );
        assert_eq!(h.repair.calls(), 1);
        assert!(h.repair.diagnostics.lock().unwrap()[0].contains("Forbidden import: os"));
        // The renderer only ever saw the repaired code.
        assert_eq!(h.renderer.seen_code.lock().unwrap().as_slice(), [VALID_SCENE.to_string()]);
    }

    #[tokio::test]
    async fn test_timeout_is_terminal() {
        let h = harness(vec![Step::TimeOut], vec![]);
        let task = h.enqueue(VALID_SCENE, true).await;

        assert_eq!(h.pipeline.process(&task).await.unwrap(), JobStatus::Timeout);
        assert_eq!(h.renderer.calls(), 1);
        assert_eq!(h.repair.calls(), 0);

        let job = h.job(&task.job_id).await;
        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(job.stage, "timeout");
        assert_eq!(job.progress, 100);
        assert!(job.video_path.is_none());
    }

    #[tokio::test]
    async fn test_timeout_after_runtime_retry_stops() {
        let h = harness(vec![Step::Fail("boom"), Step::TimeOut], vec![]);
        let task = h.enqueue(VALID_SCENE, true).await;

        assert_eq!(h.pipeline.process(&task).await.unwrap(), JobStatus::Timeout);
        assert_eq!(h.renderer.calls(), 2);
        assert_eq!(h.repair.calls(), 1);
    }

    #[tokio::test]
    async fn test_runtime_failure_repaired() {
        let h = harness(vec![Step::Fail("NameError: name 'Foo' is not defined")], vec![]);
        let task = h.enqueue(VALID_SCENE, true).await;

        assert_eq!(h.pipeline.process(&task).await.unwrap(), JobStatus::Done);
        let history = h.jobs.history.lock().unwrap().clone();
        assert!(history.iter().any(|(s, stage, _)| *s == JobStatus::Retrying && stage == "retrying_runtime"));
        assert_eq!(h.repair.diagnostics.lock().unwrap()[0], "NameError: name 'Foo' is not defined");

        let job = h.job(&task.job_id).await;
        assert!(job.error.is_none());
        assert!(job.video_path.is_some());
    }

    #[tokio::test]
    async fn test_runtime_failure_without_retry() {
        let h = harness(vec![Step::Fail("ZeroDivisionError")], vec![]);
        let task = h.enqueue(VALID_SCENE, false).await;

        assert_eq!(h.pipeline.process(&task).await.unwrap(), JobStatus::Failed);
        let job = h.job(&task.job_id).await;
        assert_eq!(job.stage, "failed");
        assert_eq!(job.error.as_deref(), Some("ZeroDivisionError"));
        assert_eq!(h.repair.calls(), 0);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let h = harness(vec![Step::Fail("e1"), Step::Fail("e2"), Step::Fail("e3")], vec![]);
        let task = h.enqueue(VALID_SCENE, true).await;

        assert_eq!(h.pipeline.process(&task).await.unwrap(), JobStatus::Failed);
        assert_eq!(h.renderer.calls(), 3);
        assert_eq!(h.repair.calls(), 2);
        assert_eq!(h.job(&task.job_id).await.error.as_deref(), Some("e3"));
    }

    #[tokio::test]
    async fn test_blank_repair_keeps_previous_code() {
        let h = harness(vec![Step::Fail("boom")], vec!["   \n"]);
        let task = h.enqueue(VALID_SCENE, true).await;

        assert_eq!(h.pipeline.process(&task).await.unwrap(), JobStatus::Done);
        let seen = h.renderer.seen_code.lock().unwrap().clone();
        assert_eq!(seen, vec![VALID_SCENE.to_string(), VALID_SCENE.to_string()]);
    }

    #[tokio::test]
    async fn test_repaired_code_is_revalidated_before_render() {
        // The runtime repair introduces a forbidden import; it must never reach the renderer.
        let bad = invalid_scene();
        let h = harness(vec![Step::Fail("boom")], vec![bad.as_str(), VALID_SCENE]);
        let task = h.enqueue(VALID_SCENE, true).await;

        assert_eq!(h.pipeline.process(&task).await.unwrap(), JobStatus::Done);
        let seen = h.renderer.seen_code.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|code| !code.contains("import os")));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let h = harness(vec![Step::Fail("e1"), Step::Fail("e2")], vec![]);
        let task = h.enqueue(VALID_SCENE, true).await;
        h.pipeline.process(&task).await.unwrap();

        let progress = h.jobs.progress();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", progress);
        assert_eq!(*progress.last().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_processing_finished_job_is_noop() {
        let h = harness(vec![Step::Succeed], vec![]);
        let task = h.enqueue(VALID_SCENE, true).await;
        h.pipeline.process(&task).await.unwrap();
        let before = h.jobs.statuses().len();

        assert_eq!(h.pipeline.process(&task).await.unwrap(), JobStatus::Done);
        assert_eq!(h.jobs.statuses().len(), before);
        assert_eq!(h.renderer.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_job_is_an_error() {
        let h = harness(vec![], vec![]);
        let task = RenderTask {
            job_id: "job_000000000000".to_string(),
            code: VALID_SCENE.to_string(),
            quality: Quality::High,
            allow_retry: true,
        };
        assert!(matches!(
            h.pipeline.process(&task).await,
            Err(PipelineError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_lost_artifact_fails_job_without_retry() {
        let h = harness(vec![Step::LoseArtifact], vec![]);
        let task = h.enqueue(VALID_SCENE, true).await;

        assert!(matches!(h.pipeline.process(&task).await, Err(PipelineError::Storage(_))));
        let job = h.job(&task.job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().starts_with("Failed to store video"));
        assert_eq!(h.repair.calls(), 0);
    }

    #[tokio::test]
    async fn test_submit_in_flight_returns_same_job() {
        let h = harness(vec![], vec![]);
        let first = h.enqueue(VALID_SCENE, true).await;

        let second = h.pipeline.submit(VALID_SCENE, Quality::High, true).await.unwrap();
        match second {
            Submission::InFlight(job) => assert_eq!(job.job_id, first.job_id),
            other => panic!("expected in-flight hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_reuses_finished_render() {
        let h = harness(vec![Step::Succeed], vec![]);
        let first = h.enqueue(VALID_SCENE, true).await;
        h.pipeline.process(&first).await.unwrap();

        let second = h.pipeline.submit(VALID_SCENE, Quality::High, true).await.unwrap();
        let Submission::Cached(job) = second else {
            panic!("expected cache hit");
        };
        assert_ne!(job.job_id, first.job_id);
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.progress, 100);
        let video = job.video_path.unwrap();
        assert!(video.ends_with(&format!("{}.mp4", job.job_id)));
        assert!(std::path::Path::new(&video).exists());
        assert_eq!(h.renderer.calls(), 1);
    }

    #[tokio::test]
    async fn test_submit_different_quality_is_a_miss() {
        let h = harness(vec![Step::Succeed], vec![]);
        let first = h.enqueue(VALID_SCENE, true).await;
        h.pipeline.process(&first).await.unwrap();

        let second = h.pipeline.submit(VALID_SCENE, Quality::Low, true).await.unwrap();
        assert!(matches!(second, Submission::Enqueued(..)));
    }

    #[tokio::test]
    async fn test_submit_after_failure_is_a_miss() {
        let h = harness(vec![], vec![]);
        let first = h.enqueue(&invalid_scene(), false).await;
        h.pipeline.process(&first).await.unwrap();

        let second = h.pipeline.submit(&invalid_scene(), Quality::High, false).await.unwrap();
        let Submission::Enqueued(job, _) = second else {
            panic!("expected a fresh job");
        };
        assert_ne!(job.job_id, first.job_id);
    }

    #[tokio::test]
    async fn test_submit_with_deleted_video_is_a_miss() {
        let h = harness(vec![Step::Succeed], vec![]);
        let first = h.enqueue(VALID_SCENE, true).await;
        h.pipeline.process(&first).await.unwrap();
        h.pipeline.storage().delete(&first.job_id).await.unwrap();

        let second = h.pipeline.submit(VALID_SCENE, Quality::High, true).await.unwrap();
        assert!(matches!(second, Submission::Enqueued(..)));
        assert!(h.dir.path().exists());
    }

    /// Pipeline on a shared SQLite file, as a separate server process would build it.
    fn sqlite_pipeline(root: &std::path::Path, renderer: Arc<ScriptedRenderer>) -> RenderPipeline {
        use crate::render::cache::SqliteKeyValueStore;
        use crate::render::db;
        use crate::render::jobs::SqliteJobStore;

        let handle = db::probe(&root.join("renderforge.db")).unwrap();
        RenderPipeline::new(
            Arc::new(SqliteJobStore::new(handle.clone())),
            ResultCache::new(Arc::new(SqliteKeyValueStore::new(handle))),
            ArtifactStore::new(root.join("videos")),
            renderer,
            Arc::new(ScriptedRepair::new(vec![])),
            2,
        )
    }

    #[tokio::test]
    async fn test_unowned_in_flight_job_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(ScriptedRenderer::new(dir.path().join("spool"), vec![]));

        // Submitted, then the process went away before processing it.
        let crashed = sqlite_pipeline(dir.path(), renderer.clone());
        let Submission::Enqueued(stale, _) = crashed.submit(VALID_SCENE, Quality::High, true).await.unwrap() else {
            panic!("expected a fresh job");
        };
        drop(crashed);

        let restarted = sqlite_pipeline(dir.path(), renderer.clone());
        let Submission::Enqueued(job, task) = restarted.submit(VALID_SCENE, Quality::High, true).await.unwrap() else {
            panic!("stale job must not be reported as in flight");
        };
        assert_ne!(job.job_id, stale.job_id);

        // The new job owns the fingerprint now.
        let again = restarted.submit(VALID_SCENE, Quality::High, true).await.unwrap();
        assert!(matches!(&again, Submission::InFlight(j) if j.job_id == job.job_id));

        assert_eq!(restarted.process(&task).await.unwrap(), JobStatus::Done);
        assert!(matches!(
            restarted.submit(VALID_SCENE, Quality::High, true).await.unwrap(),
            Submission::Cached(_)
        ));
        // Another process's job is never rewritten.
        let untouched = restarted.jobs().get(&stale.job_id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Queued);
    }

    /// Fails every write that moves a job to `rendering`.
    struct FailingRenderUpdates(crate::render::jobs::MemoryJobStore);

    #[async_trait::async_trait]
    impl JobStore for FailingRenderUpdates {
        async fn create(&self) -> anyhow::Result<Job> {
            self.0.create().await
        }

        async fn get(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
            self.0.get(job_id).await
        }

        async fn update(&self, job_id: &str, update: JobUpdate) -> anyhow::Result<Option<Job>> {
            if update.status == Some(JobStatus::Rendering) {
                anyhow::bail!("disk I/O error");
            }
            self.0.update(job_id, update).await
        }

        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_store_error_mid_process_leaves_job_failed() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = RenderPipeline::new(
            Arc::new(FailingRenderUpdates(crate::render::jobs::MemoryJobStore::new())),
            ResultCache::in_memory(),
            ArtifactStore::new(dir.path().join("videos")),
            Arc::new(ScriptedRenderer::new(dir.path().join("spool"), vec![])),
            Arc::new(ScriptedRepair::new(vec![])),
            2,
        );
        let Submission::Enqueued(_, task) = pipeline.submit(VALID_SCENE, Quality::High, true).await.unwrap() else {
            panic!("expected a fresh job");
        };

        assert!(matches!(pipeline.process(&task).await, Err(PipelineError::JobStore(_))));
        let job = pipeline.jobs().get(&task.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("disk I/O error"));

        // Identical input can be submitted again.
        let retry = pipeline.submit(VALID_SCENE, Quality::High, true).await.unwrap();
        assert!(matches!(&retry, Submission::Enqueued(j, _) if j.job_id != task.job_id));
    }

    #[tokio::test]
    async fn test_abandoned_job_is_failed_and_released() {
        let h = harness(vec![], vec![]);
        let task = h.enqueue(VALID_SCENE, true).await;

        h.pipeline.abandon(&task.job_id, "Render queue is closed").await.unwrap();
        let job = h.job(&task.job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Render queue is closed"));

        let next = h.pipeline.submit(VALID_SCENE, Quality::High, true).await.unwrap();
        assert!(matches!(next, Submission::Enqueued(..)));
    }

    #[tokio::test]
    async fn test_huge_retry_budget_does_not_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = RenderPipeline::new(
            Arc::new(crate::render::jobs::MemoryJobStore::new()),
            ResultCache::in_memory(),
            ArtifactStore::new(dir.path().join("videos")),
            Arc::new(ScriptedRenderer::new(dir.path().join("spool"), vec![Step::Fail("boom")])),
            Arc::new(ScriptedRepair::new(vec![])),
            u32::MAX,
        );
        let Submission::Enqueued(_, task) = pipeline.submit(VALID_SCENE, Quality::High, true).await.unwrap() else {
            panic!("expected a fresh job");
        };
        assert_eq!(pipeline.process(&task).await.unwrap(), JobStatus::Done);
    }

    #[tokio::test]
    async fn test_concurrent_identical_submissions_render_once() {
        let h = harness(vec![Step::Succeed], vec![]);
        let (a, b) = tokio::join!(
            h.pipeline.submit(VALID_SCENE, Quality::High, true),
            h.pipeline.submit(VALID_SCENE, Quality::High, true),
        );
        let fresh = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(|s| matches!(s, Submission::Enqueued(..)))
            .count();
        assert_eq!(fresh, 1);
    }
}
