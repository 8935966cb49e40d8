mod matcher;

pub use matcher::{Matcher, parse_version};

use crate::models::{ChangeRequest, TagInfo};
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::debug;

/// Never promoted to: it carries no ordering information
pub const FORBIDDEN_TAG: &str = "latest";

/// Outcome of evaluating one candidate tag against the cached tags of its image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// A newer matching tag exists
    Promote(ChangeRequest),
    /// The newest matching tag is already the current one
    UpToDate,
    /// Nothing in the cache matches the pattern
    NoCandidate,
    /// The current tag itself does not satisfy the pattern
    CurrentTagRejected,
}

impl Decision {
    pub fn should_change(&self) -> bool {
        matches!(self, Decision::Promote(_))
    }

    pub fn into_change(self) -> Option<ChangeRequest> {
        match self {
            Decision::Promote(change) => Some(change),
            _ => None,
        }
    }
}

pub struct PolicyEngine;

impl PolicyEngine {
    /// Decide whether `current_tag` should be replaced.
    ///
    /// `cached` must be ordered newest first: the first matching entry wins.
    pub fn evaluate(
        &self,
        current_tag: &str,
        cached: &[TagInfo],
        matcher: &Matcher,
        image: &str,
        file: &Path,
    ) -> Decision {
        self.evaluate_at(current_tag, cached, matcher, image, file, Utc::now())
    }

    /// Same as [`PolicyEngine::evaluate`] with an explicit decision time
    pub fn evaluate_at(
        &self,
        current_tag: &str,
        cached: &[TagInfo],
        matcher: &Matcher,
        image: &str,
        file: &Path,
        now: DateTime<Utc>,
    ) -> Decision {
        if !matcher.matches(current_tag) {
            debug!(
                "Current tag '{}' of {} doesn't match {} pattern '{}'",
                current_tag,
                image,
                matcher.pattern_type(),
                matcher.pattern_value()
            );
            return Decision::CurrentTagRejected;
        }

        let newest = cached
            .iter()
            .find(|info| info.tag != FORBIDDEN_TAG && matcher.matches(&info.tag));

        match newest {
            Some(info) if info.tag != current_tag => Decision::Promote(ChangeRequest {
                old: current_tag.to_string(),
                new: info.tag.clone(),
                time: now,
                pattern_value: matcher.pattern_value().to_string(),
                pattern_type: matcher.pattern_type().to_string(),
                image: image.to_string(),
                file: file.to_path_buf(),
            }),
            Some(_) => {
                debug!("{}:{} is already the newest match", image, current_tag);
                Decision::UpToDate
            },
            None => {
                debug!(
                    "No cached tag of {} matches {} pattern '{}' ({} cached)",
                    image,
                    matcher.pattern_type(),
                    matcher.pattern_value(),
                    cached.len()
                );
                Decision::NoCandidate
            },
        }
    }
}
