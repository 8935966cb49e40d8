use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The subset of a GitHub webhook payload needed to spot pause comments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubWebhook {
    pub action: String,
    pub comment: Comment,
    pub issue: Issue,
    pub repository: Repository,
    pub sender: Sender,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Comment {
    pub body: String,
    pub user: Sender,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Issue {
    pub html_url: String,
    pub number: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Repository {
    pub full_name: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Sender {
    pub login: String,
}

/// Notification from a CI system that a new image was built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerBuildWebhook {
    pub url: String,
    pub docker_registry_url: String,
}

/// Events delivered from the control surface to the daemon loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Stop starting new passes for the configured pause duration
    Pause {
        requested_at: DateTime<Utc>,
        requested_by: Option<String>,
    },
    /// Run a pass now instead of waiting for the next tick
    Build(DockerBuildWebhook),
}
