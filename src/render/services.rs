use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Settings;
use crate::render::cache::{KeyValueStore, MemoryKeyValueStore, ResultCache, SqliteKeyValueStore};
use crate::render::db;
use crate::render::jobs::{JobStore, MemoryJobStore, SqliteJobStore};
use crate::render::llm::{self, CodeAssistant};
use crate::render::pipeline::RenderPipeline;
use crate::render::sandbox;
use crate::render::storage::ArtifactStore;

/// Long-lived components shared by the HTTP server and the CLI.
pub struct Services {
    pub pipeline: Arc<RenderPipeline>,
    pub assistant: CodeAssistant,
    pub cache: ResultCache,
}

/// Wire every component from settings.
///
/// The database is probed once; when it cannot be opened, jobs and cache
/// entries live in process memory for the life of the process.
pub async fn build_services(settings: &Settings) -> Result<Services> {
    let storage = ArtifactStore::new(&settings.render.storage_root);
    storage
        .init()
        .await
        .context("Failed to create video storage root")?;
    tokio::fs::create_dir_all(&settings.render.spool_dir)
        .await
        .with_context(|| format!("Failed to create spool dir {}", settings.render.spool_dir.display()))?;

    if let Some(scratch) = &settings.render.scratch_dir {
        tokio::fs::create_dir_all(scratch)
            .await
            .with_context(|| format!("Failed to create scratch dir {}", scratch.display()))?;
    }

    let (jobs, kv): (Arc<dyn JobStore>, Arc<dyn KeyValueStore>) = match db::probe(&settings.render.database_path) {
        Ok(handle) => {
            info!(path = %settings.render.database_path.display(), "using sqlite job store");
            (
                Arc::new(SqliteJobStore::new(handle.clone())),
                Arc::new(SqliteKeyValueStore::new(handle)),
            )
        }
        Err(e) => {
            warn!(error = %e, "database unavailable; falling back to in-memory job store and cache");
            (Arc::new(MemoryJobStore::new()), Arc::new(MemoryKeyValueStore::new()))
        }
    };
    let cache = ResultCache::new(kv);

    let backend = llm::build_backend(&settings.llm)?;
    let assistant = CodeAssistant::new(backend);
    let renderer = sandbox::build_renderer(&settings.render, &settings.sandbox)?;
    info!(
        renderer = renderer.name(),
        llm = assistant.provider(),
        model = assistant.model(),
        "render services ready"
    );

    let pipeline = Arc::new(RenderPipeline::new(
        jobs,
        cache.clone(),
        storage,
        renderer,
        Arc::new(assistant.clone()),
        settings.render.max_retries,
    ));
    Ok(Services {
        pipeline,
        assistant,
        cache,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::llm::LlmProvider;
    use crate::render::sandbox::RenderMode;

    fn settings(root: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.llm.provider = LlmProvider::Template;
        settings.render.mode = RenderMode::Local;
        settings.render.storage_root = root.join("videos");
        settings.render.spool_dir = root.join("spool");
        settings.render.scratch_dir = Some(root.join("scratch"));
        settings.render.database_path = root.join("db").join("renderforge.db");
        settings
    }

    #[tokio::test]
    async fn test_build_services_with_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let services = build_services(&settings(dir.path())).await.unwrap();
        assert_eq!(services.pipeline.jobs().backend_name(), "sqlite");
        assert_eq!(services.cache.backend_name(), "sqlite");
        assert_eq!(services.assistant.provider(), "template");
        assert!(dir.path().join("videos").is_dir());
        assert!(dir.path().join("spool").is_dir());
        assert!(dir.path().join("scratch").is_dir());
    }

    #[tokio::test]
    async fn test_build_services_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let mut settings = settings(dir.path());
        settings.render.database_path = blocker.join("renderforge.db");
        let services = build_services(&settings).await.unwrap();
        assert_eq!(services.pipeline.jobs().backend_name(), "memory");
        assert_eq!(services.cache.backend_name(), "memory");

        let job = services.pipeline.jobs().create().await.unwrap();
        assert!(services.pipeline.jobs().get(&job.job_id).await.unwrap().is_some());
    }
}
