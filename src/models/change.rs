use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Records one tag substitution: what changed, where, and under which pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    pub old: String,
    pub new: String,
    pub time: DateTime<Utc>,
    pub pattern_value: String,
    pub pattern_type: String,
    pub image: String,
    pub file: PathBuf,
}

impl ChangeRequest {
    /// The `image:tag` string being replaced
    pub fn old_reference(&self) -> String {
        format!("{}:{}", self.image, self.old)
    }

    /// The `image:tag` string written in its place
    pub fn new_reference(&self) -> String {
        format!("{}:{}", self.image, self.new)
    }
}
