//! Candidate extraction: find `image:tag` shaped tokens in tracked files.
//!
//! A line containing a registry prefix is split on whitespace and every field
//! that contains the prefix becomes a candidate. The heuristic is tuned for
//! YAML manifests. It does not understand JSON quoting or registry prefixes
//! that carry a port.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Extract the de-duplicated candidates of every prefix from a file
pub fn extract_candidates(path: &Path, prefixes: &[String]) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let candidates = extract_from_str(&content, prefixes);
    debug!(
        "Found {} candidates in {}",
        candidates.len(),
        path.display()
    );
    Ok(candidates)
}

/// Extract candidates from text, in order of first occurrence
pub fn extract_from_str(content: &str, prefixes: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for prefix in prefixes.iter().filter(|p| !p.is_empty()) {
        for line in content.lines().filter(|line| line.contains(prefix.as_str())) {
            for field in line.split_whitespace() {
                if field.contains(prefix.as_str()) && seen.insert(field) {
                    candidates.push(field.to_string());
                }
            }
        }
    }

    candidates
}

/// A candidate split into image and tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub image: String,
    pub tag: String,
}

impl ImageRef {
    /// Split a candidate token on its last `:`.
    ///
    /// Surrounding quotes and any `@digest` suffix are dropped first. Tokens
    /// without a usable tag are logged and rejected.
    pub fn parse(candidate: &str) -> Option<Self> {
        let token = candidate.trim_matches(|c| c == '"' || c == '\'');
        let token = match token.split_once('@') {
            Some((name, _digest)) => name,
            None => token,
        };

        let Some((image, tag)) = token.rsplit_once(':') else {
            warn!("Unable to find a tag in candidate '{}'", candidate);
            return None;
        };

        if image.is_empty() || tag.is_empty() || tag.contains('/') {
            warn!("Candidate '{}' is not an image:tag pair", candidate);
            return None;
        }

        Some(ImageRef {
            image: image.to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Images under `prefix` referenced by any of `files`, sorted and unique.
///
/// Used to decide which repositories to scan in a registry. Unreadable files
/// are skipped.
pub fn referenced_images(files: &[impl AsRef<Path>], prefix: &str) -> Vec<String> {
    let prefixes = [prefix.to_string()];
    let mut images: Vec<String> = files
        .iter()
        .filter_map(|file| match extract_candidates(file.as_ref(), &prefixes) {
            Ok(candidates) => Some(candidates),
            Err(e) => {
                warn!("{:#}", e);
                None
            },
        })
        .flatten()
        .filter_map(|candidate| ImageRef::parse(&candidate))
        .map(|image_ref| image_ref.image)
        .filter(|image| image.starts_with(prefix))
        .collect();

    images.sort();
    images.dedup();
    images
}
