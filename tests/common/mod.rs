// Common test utilities for integration tests
//
// Fixtures for building checkouts on disk and tag caches with known
// push times
#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use laminar::TagCache;
use laminar::models::TagInfo;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Writes `content` to `root/relative`, creating parent directories
pub fn write_file(root: &Path, relative: &str, content: &str) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    fs::write(&path, content).expect("Failed to write fixture");
    path
}

/// A tag pushed at `created`
pub fn tag_info(image: &str, tag: &str, created: DateTime<Utc>) -> TagInfo {
    TagInfo {
        image: image.to_string(),
        hash: format!("{:x}", fake_digest(tag)),
        created,
        tag: tag.to_string(),
    }
}

/// An in-memory cache holding `(image, tag, seconds after a fixed base)`
pub fn cache_with(tags: &[(&str, &str, i64)]) -> Arc<TagCache> {
    let base = Utc::now() - Duration::hours(1);
    let cache = TagCache::in_memory();
    for (image, tag, offset) in tags {
        cache
            .put(&tag_info(image, tag, base + Duration::seconds(*offset)))
            .expect("Failed to seed cache");
    }
    Arc::new(cache)
}

pub fn prefixes(list: &[&str]) -> Vec<String> {
    list.iter().map(|p| p.to_string()).collect()
}

/// A complete daemon configuration tracking one repository
pub fn sample_config(url: &str) -> String {
    format!(
        r#"---
global:
  gitUser: Laminar
  gitEmail: laminar@example.org
  gitMessage: automated promotion
  gitHubToken: somethingrandom

dockerRegistries:
- reg: gcr.io/acme
  name: gcr

git:
- name: deploy
  url: {url}
  branch: master
  updates:
  - pattern: "glob:develop-*"
    files:
    - path: environments/dev
  - pattern: "semver:~1.2"
    files:
    - path: environments/prod/values.yaml
"#
    )
}

// FNV-1a, stable across runs
fn fake_digest(value: &str) -> u64 {
    value
        .bytes()
        .fold(0xcbf29ce484222325, |hash, byte| {
            (hash ^ byte as u64).wrapping_mul(0x100000001b3)
        })
}
