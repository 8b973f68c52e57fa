//! Deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one build attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Running,
    Succeeded,
    Failed,
}

impl DeploymentStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, DeploymentStatus::Running)
    }
}

/// State of one build attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// Resource that was built
    pub resource_id: String,

    /// Build identifier of the attempt
    pub build_id: String,

    pub status: DeploymentStatus,

    /// Error message when the attempt failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Build step the attempt failed in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// A fresh attempt in the `Running` state
    pub fn start(resource_id: impl Into<String>, build_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            build_id: build_id.into(),
            status: DeploymentStatus::Running,
            error_message: None,
            failed_step: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move to a final status. Finished attempts never change again.
    pub fn finish(&mut self, status: DeploymentStatus, error_message: Option<String>) -> bool {
        if self.status.is_finished() || !status.is_finished() {
            return false;
        }
        self.status = status;
        self.error_message = error_message;
        self.finished_at = Some(Utc::now());
        true
    }
}

/// One build log line published to the build-log topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLogLine {
    pub build_id: String,

    /// Log level: 'info', 'error'
    pub level: String,

    pub message: String,
}
