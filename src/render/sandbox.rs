use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::RenderConfig;
use crate::render::models::Quality;

/// Maximum diagnostic length surfaced from a failed render, in bytes.
pub const MAX_DIAGNOSTIC_BYTES: usize = 4000;

const SCENE_FILE: &str = "scene.py";
const SCENE_CLASS: &str = "GeneratedScene";
const ARTIFACT_NAME: &str = "output.mp4";
const MISSING_ARTIFACT: &str = "Sandbox render finished but produced no artifact (output.mp4 missing)";
const FORCE_REMOVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Isolation settings for the renderer container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    pub cpus: String,
    pub memory: String,
    pub pids_limit: u32,
    pub tmpfs_size: String,
    pub read_only: bool,
    pub network_disabled: bool,
    pub no_new_privileges: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "manim-ai-renderer:latest".to_string(),
            cpus: "1.0".to_string(),
            memory: "1g".to_string(),
            pids_limit: 256,
            tmpfs_size: "256m".to_string(),
            read_only: true,
            network_disabled: true,
            no_new_privileges: true,
            seccomp_profile: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    #[default]
    Docker,
    Local,
}

impl RenderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Local => "local",
        }
    }

    fn default_command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Local => "manim",
        }
    }
}

impl FromStr for RenderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(Self::Docker),
            "local" => Ok(Self::Local),
            _ => Err(format!("Invalid render mode '{}'. Valid values: docker, local", s)),
        }
    }
}

/// Result of a single render invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxOutcome {
    /// Stable copy of the rendered video, outside any scratch space.
    Success(PathBuf),
    Timeout,
    Failure(String),
}

/// Abstraction over scene rendering for testability.
/// Real implementations: `DockerRenderer`, `LocalRenderer`.
#[async_trait]
pub trait SceneRenderer: Send + Sync {
    async fn render(&self, job_id: &str, code: &str, quality: Quality) -> SandboxOutcome;

    fn name(&self) -> &'static str;
}

/// Build the renderer selected by `render.mode`.
pub fn build_renderer(render: &RenderConfig, sandbox: &SandboxConfig) -> Result<Arc<dyn SceneRenderer>> {
    let command = render
        .command
        .as_deref()
        .unwrap_or_else(|| render.mode.default_command());
    let command = split_command(command)?;
    let timeout = Duration::from_secs(render.timeout_secs);

    let renderer: Arc<dyn SceneRenderer> = match render.mode {
        RenderMode::Docker => Arc::new(
            DockerRenderer::new(command, sandbox.clone(), timeout, render.spool_dir.clone())
                .with_scratch_root(render.scratch_dir.clone()),
        ),
        RenderMode::Local => {
            warn!("local render mode runs scene code without isolation; use only for development");
            Arc::new(
                LocalRenderer::new(command, timeout, render.spool_dir.clone())
                    .with_scratch_root(render.scratch_dir.clone()),
            )
        }
    };
    Ok(renderer)
}

/// Split a configured command line into words. Leading words act as a
/// wrapper (`sudo docker`, `podman --remote`).
pub fn split_command(command: &str) -> Result<Vec<String>> {
    let words: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if words.is_empty() {
        bail!("renderer command is empty");
    }
    Ok(words)
}

/// Keep the last `max` bytes of `text`, marking the cut with `...`.
pub fn truncate_tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Diagnostic for a non-zero exit: stderr, or stdout when stderr is empty.
fn diagnostic(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let text = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout)
    } else {
        stderr
    };
    let text = text.trim();
    if text.is_empty() {
        return match output.status.code() {
            Some(code) => format!("Renderer exited with status {code}"),
            None => "Renderer terminated by signal".to_string(),
        };
    }
    truncate_tail(text, MAX_DIAGNOSTIC_BYTES)
}

enum RunResult {
    Completed(Output),
    TimedOut,
    SpawnFailed(String),
}

/// Run `cmd` to completion, bounded by `timeout`. The child is killed if the
/// wait is abandoned.
async fn run_bounded(mut cmd: Command, timeout: Duration) -> RunResult {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return RunResult::SpawnFailed(e.to_string()),
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => RunResult::Completed(output),
        Ok(Err(e)) => RunResult::SpawnFailed(e.to_string()),
        Err(_) => RunResult::TimedOut,
    }
}

/// Per-render scratch directory under `root`, or the system temp dir.
fn scratch_dir(root: Option<&Path>, prefix: &str) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    match root {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    }
    .with_context(|| format!("Failed to create scratch directory ({prefix})"))
}

/// Copy a rendered video out of scratch space into the spool directory.
async fn keep_artifact(spool_dir: &Path, job_id: &str, artifact: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(spool_dir)
        .await
        .with_context(|| format!("Failed to create spool dir {}", spool_dir.display()))?;
    let short = Uuid::new_v4().simple().to_string();
    let target = spool_dir.join(format!("{}-{}.mp4", job_id, &short[..8]));
    tokio::fs::copy(artifact, &target)
        .await
        .with_context(|| format!("Failed to copy artifact to {}", target.display()))?;
    Ok(target)
}

async fn finish(spool_dir: &Path, job_id: &str, artifact: Option<PathBuf>) -> SandboxOutcome {
    let Some(artifact) = artifact else {
        return SandboxOutcome::Failure(MISSING_ARTIFACT.to_string());
    };
    match keep_artifact(spool_dir, job_id, &artifact).await {
        Ok(path) => SandboxOutcome::Success(path),
        Err(e) => SandboxOutcome::Failure(format!("{e:#}")),
    }
}

// ── Docker ───────────────────────────────────────────────────────────

/// Renders inside a locked-down, single-use container.
pub struct DockerRenderer {
    command: Vec<String>,
    config: SandboxConfig,
    timeout: Duration,
    spool_dir: PathBuf,
    scratch_root: Option<PathBuf>,
}

impl DockerRenderer {
    pub fn new(command: Vec<String>, config: SandboxConfig, timeout: Duration, spool_dir: PathBuf) -> Self {
        Self {
            command,
            config,
            timeout,
            spool_dir,
            scratch_root: None,
        }
    }

    /// Create mount directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: Option<PathBuf>) -> Self {
        self.scratch_root = root;
        self
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd
    }

    /// `docker rm -f`, for containers abandoned by a timeout.
    async fn force_remove(&self, container: &str) {
        let mut cmd = self.base_command();
        cmd.args(["rm", "-f", container]);
        match run_bounded(cmd, FORCE_REMOVE_TIMEOUT).await {
            RunResult::Completed(output) if output.status.success() => {
                debug!(container, "removed timed-out container");
            }
            RunResult::Completed(output) => {
                warn!(container, stderr = %String::from_utf8_lossy(&output.stderr).trim(), "container removal failed");
            }
            RunResult::TimedOut => warn!(container, "container removal timed out"),
            RunResult::SpawnFailed(e) => warn!(container, error = %e, "container removal failed to start"),
        }
    }
}

/// Arguments for `docker run`. Mounts are scoped to one invocation; every
/// other path in the container is read-only when `read_only` is set.
pub fn docker_args(
    config: &SandboxConfig,
    container: &str,
    workspace: &Path,
    output: &Path,
    quality: Quality,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--name".into(),
        container.into(),
        "--cpus".into(),
        config.cpus.clone(),
        "--memory".into(),
        config.memory.clone(),
        "--pids-limit".into(),
        config.pids_limit.to_string(),
        "--tmpfs".into(),
        format!("/tmp:size={}", config.tmpfs_size),
        "--cap-drop".into(),
        "ALL".into(),
        "-v".into(),
        format!("{}:/workspace:rw", workspace.display()),
        "-v".into(),
        format!("{}:/output:rw", output.display()),
    ];

    if config.network_disabled {
        args.extend(["--network".into(), "none".into()]);
    }
    if config.read_only {
        args.push("--read-only".into());
    }
    if config.no_new_privileges {
        args.extend(["--security-opt".into(), "no-new-privileges".into()]);
    }
    if let Some(profile) = &config.seccomp_profile
        && profile.exists()
    {
        args.extend(["--security-opt".into(), format!("seccomp={}", profile.display())]);
    }

    args.extend([
        config.image.clone(),
        "/entrypoint.sh".into(),
        SCENE_FILE.into(),
        SCENE_CLASS.into(),
        quality.as_str().into(),
    ]);
    args
}

#[async_trait]
impl SceneRenderer for DockerRenderer {
    async fn render(&self, job_id: &str, code: &str, quality: Quality) -> SandboxOutcome {
        // Both guards live until the end of this call and are removed on drop.
        let root = self.scratch_root.as_deref();
        let (workspace, output) = match (scratch_dir(root, "renderforge-ws-"), scratch_dir(root, "renderforge-out-")) {
            (Ok(ws), Ok(out)) => (ws, out),
            (Err(e), _) | (_, Err(e)) => return SandboxOutcome::Failure(format!("{e:#}")),
        };
        if let Err(e) = prepare_mounts(workspace.path(), output.path(), code).await {
            return SandboxOutcome::Failure(format!("{e:#}"));
        }

        let short = Uuid::new_v4().simple().to_string();
        let container = format!("renderforge-{}-{}", job_id, &short[..8]);
        let args = docker_args(&self.config, &container, workspace.path(), output.path(), quality);

        info!(job_id, container = %container, quality = %quality, "starting sandboxed render");
        let mut cmd = self.base_command();
        cmd.args(&args);

        match run_bounded(cmd, self.timeout).await {
            RunResult::TimedOut => {
                warn!(job_id, container = %container, timeout_secs = self.timeout.as_secs(), "render timed out");
                self.force_remove(&container).await;
                SandboxOutcome::Timeout
            }
            RunResult::SpawnFailed(e) => {
                SandboxOutcome::Failure(format!("Failed to start renderer `{}`: {}", self.command[0], e))
            }
            RunResult::Completed(out) if !out.status.success() => {
                debug!(job_id, status = ?out.status.code(), "render exited with failure");
                SandboxOutcome::Failure(diagnostic(&out))
            }
            RunResult::Completed(_) => {
                let artifact = output.path().join(ARTIFACT_NAME);
                let artifact = artifact.is_file().then_some(artifact);
                finish(&self.spool_dir, job_id, artifact).await
            }
        }
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

async fn prepare_mounts(workspace: &Path, output: &Path, code: &str) -> Result<()> {
    tokio::fs::write(workspace.join(SCENE_FILE), code)
        .await
        .context("Failed to write scene file")?;

    // The renderer image runs as an unprivileged user.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(workspace, std::fs::Permissions::from_mode(0o755))
            .await
            .context("Failed to open workspace mount")?;
        tokio::fs::set_permissions(output, std::fs::Permissions::from_mode(0o777))
            .await
            .context("Failed to open output mount")?;
    }
    #[cfg(not(unix))]
    let _ = output;

    Ok(())
}

// ── Local ────────────────────────────────────────────────────────────

/// Runs `manim` directly on the host. No isolation; development only.
pub struct LocalRenderer {
    command: Vec<String>,
    timeout: Duration,
    spool_dir: PathBuf,
    scratch_root: Option<PathBuf>,
}

impl LocalRenderer {
    pub fn new(command: Vec<String>, timeout: Duration, spool_dir: PathBuf) -> Self {
        Self {
            command,
            timeout,
            spool_dir,
            scratch_root: None,
        }
    }

    pub fn with_scratch_root(mut self, root: Option<PathBuf>) -> Self {
        self.scratch_root = root;
        self
    }
}

/// Locate the final video under manim's media tree. Partial movie files are
/// written alongside it, so match on the output name.
fn find_local_artifact(media_dir: &Path) -> Option<PathBuf> {
    WalkDir::new(media_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && entry.file_name() == ARTIFACT_NAME)
        .map(|entry| entry.into_path())
}

#[async_trait]
impl SceneRenderer for LocalRenderer {
    async fn render(&self, job_id: &str, code: &str, quality: Quality) -> SandboxOutcome {
        let workspace = match scratch_dir(self.scratch_root.as_deref(), "renderforge-local-") {
            Ok(dir) => dir,
            Err(e) => return SandboxOutcome::Failure(format!("{e:#}")),
        };
        if let Err(e) = tokio::fs::write(workspace.path().join(SCENE_FILE), code).await {
            return SandboxOutcome::Failure(format!("Failed to write scene file: {e}"));
        }
        let media_dir = workspace.path().join("media");

        info!(job_id, quality = %quality, "starting local render");
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg(quality.manim_flag())
            .arg("--media_dir")
            .arg(&media_dir)
            .args(["-o", "output", SCENE_FILE, SCENE_CLASS])
            .current_dir(workspace.path());

        match run_bounded(cmd, self.timeout).await {
            RunResult::TimedOut => {
                warn!(job_id, timeout_secs = self.timeout.as_secs(), "render timed out");
                SandboxOutcome::Timeout
            }
            RunResult::SpawnFailed(e) => {
                SandboxOutcome::Failure(format!("Failed to start renderer `{}`: {}", self.command[0], e))
            }
            RunResult::Completed(out) if !out.status.success() => SandboxOutcome::Failure(diagnostic(&out)),
            RunResult::Completed(_) => finish(&self.spool_dir, job_id, find_local_artifact(&media_dir)).await,
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
