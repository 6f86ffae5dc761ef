//! Task data model.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::clock::elapsed_between;

/// Lifecycle state of a generation job.
///
/// Moves forward only: `Pending -> Processing -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` goes forward.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A video-generation job tracked by this session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task id assigned by the generation service
    pub id: String,

    /// Owner of the job
    pub user_id: String,

    pub status: TaskStatus,

    /// Last progress reported by the service, 0 until it reports one
    #[serde(default)]
    pub progress: u8,

    /// Human-readable state shown next to the job
    #[serde(default)]
    pub status_text: String,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Task {
    /// Create a freshly submitted job.
    pub fn pending(id: impl Into<String>, user_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            status: TaskStatus::Pending,
            progress: 0,
            status_text: status_text(TaskStatus::Pending, 0, None),
            started_at,
            completed_at: None,
            result_url: None,
            error_message: None,
        }
    }

    /// Not yet completed or failed.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Time since the job was submitted.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.started_at, now)
    }

    /// Move to `Failed`, keeping `message` as the error.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        let message = message.into();
        self.status = TaskStatus::Failed;
        self.completed_at = Some(now);
        self.status_text = status_text(TaskStatus::Failed, self.progress, Some(&message));
        self.error_message = Some(message);
    }

    /// Move to `Completed`.
    pub fn complete(&mut self, result_url: Option<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.completed_at = Some(now);
        self.result_url = result_url;
        self.status_text = status_text(TaskStatus::Completed, 100, None);
    }
}

/// Status text for a task in `status`.
pub fn status_text(status: TaskStatus, progress: u8, error: Option<&str>) -> String {
    match status {
        TaskStatus::Pending => "Waiting in queue".to_string(),
        TaskStatus::Processing if progress > 0 => format!("Generating video ({}%)", progress),
        TaskStatus::Processing => "Generating video".to_string(),
        TaskStatus::Completed => "Video ready".to_string(),
        TaskStatus::Failed => match error {
            Some(error) => format!("Generation failed: {}", error),
            None => "Generation failed".to_string(),
        },
    }
}

/// One answer of the status API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl StatusReport {
    pub fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            progress: None,
            video_url: None,
            error_message: None,
        }
    }

    pub fn processing(progress: Option<u8>) -> Self {
        Self {
            status: TaskStatus::Processing,
            progress,
            ..Self::pending()
        }
    }

    pub fn completed(video_url: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Completed,
            progress: Some(100),
            video_url: Some(video_url.into()),
            error_message: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            progress: None,
            video_url: None,
            error_message: Some(error_message.into()),
        }
    }
}

/// Parameters of a new generation job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Template the video is generated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,

    #[serde(default)]
    pub prompt: String,

    /// Source images uploaded by the user
    #[serde(default)]
    pub image_urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
}

impl GenerationParams {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_moves_forward() {
        assert!(TaskStatus::Pending.can_advance_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_advance_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_advance_to(TaskStatus::Processing));
        assert!(!TaskStatus::Processing.can_advance_to(TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_advance_to(TaskStatus::Failed));
        assert!(!TaskStatus::Failed.can_advance_to(TaskStatus::Processing));
    }

    #[test]
    fn test_status_text() {
        assert_eq!(status_text(TaskStatus::Processing, 40, None), "Generating video (40%)");
        assert_eq!(status_text(TaskStatus::Processing, 0, None), "Generating video");
        assert_eq!(
            status_text(TaskStatus::Failed, 10, Some("quota exceeded")),
            "Generation failed: quota exceeded"
        );
    }

    #[test]
    fn test_fail_and_complete() {
        let now = Utc::now();
        let mut task = Task::pending("t1", "u1", now);
        assert!(task.is_active());

        task.fail("timed out", now);
        assert!(!task.is_active());
        assert_eq!(task.error_message.as_deref(), Some("timed out"));
        assert_eq!(task.completed_at, Some(now));

        let mut done = Task::pending("t2", "u1", now);
        done.complete(Some("https://cdn/v.mp4".into()), now);
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
    }

    #[test]
    fn test_task_serde_uses_lowercase_status() {
        let task = Task::pending("t1", "u1", Utc::now());
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("result_url").is_none());

        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
