use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Validating,
    Rendering,
    Retrying,
    Done,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Validating => "validating",
            Self::Rendering => "rendering",
            Self::Retrying => "retrying",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    /// Terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Timeout)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "validating" => Ok(Self::Validating),
            "rendering" => Ok(Self::Rendering),
            "retrying" => Ok(Self::Retrying),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render quality profile handed to the renderer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Quality {
    #[default]
    #[serde(rename = "1080p30")]
    High,
    #[serde(rename = "720p30")]
    Medium,
    #[serde(rename = "480p15")]
    Low,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "1080p30",
            Self::Medium => "720p30",
            Self::Low => "480p15",
        }
    }

    /// Quality flag understood by the `manim` CLI.
    pub fn manim_flag(&self) -> &'static str {
        match self {
            Self::High => "-qh",
            Self::Medium => "-qm",
            Self::Low => "-ql",
        }
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1080p30" => Ok(Self::High),
            "720p30" => Ok(Self::Medium),
            "480p15" => Ok(Self::Low),
            _ => Err(format!(
                "Invalid quality '{}'. Valid values: 1080p30, 720p30, 480p15",
                s
            )),
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub stage: String,
    pub error: Option<String>,
    pub video_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_id: String) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            status: JobStatus::Queued,
            progress: 0,
            stage: "queued".to_string(),
            error: None,
            video_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge the set fields of `update` into this record and refresh `updated_at`.
    pub fn apply(&mut self, update: JobUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(progress) = update.progress {
            self.progress = progress.min(100);
        }
        if let Some(stage) = update.stage {
            self.stage = stage;
        }
        if let Some(error) = update.error {
            self.error = error;
        }
        if let Some(video_path) = update.video_path {
            self.video_path = video_path;
        }
        self.updated_at = Utc::now();
    }
}

/// Partial job update. `None` leaves a field untouched; for the nullable
/// fields `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub stage: Option<String>,
    pub error: Option<Option<String>>,
    pub video_path: Option<Option<String>>,
}

impl JobUpdate {
    pub fn status(status: JobStatus, stage: impl Into<String>, progress: u8) -> Self {
        Self {
            status: Some(status),
            progress: Some(progress),
            stage: Some(stage.into()),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn with_video_path(mut self, path: impl Into<String>) -> Self {
        self.video_path = Some(Some(path.into()));
        self
    }
}
