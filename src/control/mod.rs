mod client;

pub use client::{heartbeat_loop, ControlPlane, DetachedControlPlane, HttpControlPlane};

#[cfg(test)]
pub use client::MockControlPlane;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::crawler::task::{SourceType, TaskType};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("control API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("expected 1 agent, got {0}")]
    AgentCount(usize),

    #[error("invalid control API configuration: {0}")]
    Config(String),
}

fn default_enabled() -> bool {
    true
}

/// A site the agent can crawl, with the credentials its adapter logs in with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Website {
    #[serde(default)]
    pub id: i64,

    #[serde(default)]
    pub name: String,

    /// Site origin, e.g. `https://sangtacviet.app`
    #[serde(rename = "base_url", alias = "url")]
    pub url: String,

    /// Adapter that handles the site; matches a source name
    pub script_name: String,

    /// Minutes between scheduled crawls, managed upstream
    #[serde(default)]
    pub crawl_interval: i64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

/// This agent as registered with the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Outcome of one task, reported upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub task_type: TaskType,
    pub source: SourceType,
    pub status: ResultStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub url: String,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task_id: &str, task_type: TaskType, source: SourceType, url: &str, data: Option<Value>) -> Self {
        Self {
            task_id: task_id.to_string(),
            task_type,
            source,
            status: ResultStatus::Success,
            message: "Task completed successfully".to_string(),
            data,
            url: url.to_string(),
            completed_at: Utc::now(),
        }
    }

    pub fn error(task_id: &str, task_type: TaskType, source: SourceType, url: &str, message: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            task_type,
            source,
            status: ResultStatus::Error,
            message: message.to_string(),
            data: None,
            url: url.to_string(),
            completed_at: Utc::now(),
        }
    }
}
