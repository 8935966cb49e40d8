use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of every tag record key in the cache keyspace
pub const KEY_PREFIX: &str = "TagInfo";

/// A single image tag as reported by a registry scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    /// Registry and repository path, without the tag
    pub image: String,
    /// Content digest without the algorithm prefix
    pub hash: String,
    /// When the image was pushed
    pub created: DateTime<Utc>,
    pub tag: String,
}

impl TagInfo {
    /// Cache key, unique per (image, hash, tag)
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}:{}", KEY_PREFIX, self.image, self.hash, self.tag)
    }

    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}
