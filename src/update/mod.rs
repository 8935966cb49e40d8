use crate::cache::TagCache;
use crate::extract::{ImageRef, extract_candidates};
use crate::metrics::{CANDIDATES_FOUND, CHANGES_APPLIED, FILES_SCANNED};
use crate::models::policy::{PolicyError, UpdatePolicy};
use crate::models::ChangeRequest;
use crate::mutate::apply_change;
use crate::policy::{Matcher, PolicyEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A policy compiled once per evaluation
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub matcher: Matcher,
    pub blacklist: Vec<glob::Pattern>,
}

impl CompiledPolicy {
    pub fn compile(policy: &UpdatePolicy) -> Result<Self, PolicyError> {
        let matcher = Matcher::compile(&policy.pattern_spec()?)?;
        let blacklist = policy
            .blacklist
            .iter()
            .map(|entry| {
                glob::Pattern::new(&entry.pattern).map_err(|source| {
                    PolicyError::InvalidBlacklist {
                        pattern: entry.pattern.clone(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { matcher, blacklist })
    }

    pub fn is_blacklisted(&self, candidate: &str) -> bool {
        self.blacklist.iter().any(|pattern| pattern.matches(candidate))
    }

    /// The parsed candidate, if this policy is allowed to promote it.
    ///
    /// Blacklisted tokens, unusable tokens and tags outside the pattern are
    /// dropped here, before any cache lookup.
    pub fn eligible(&self, candidate: &str) -> Option<ImageRef> {
        if self.is_blacklisted(candidate) {
            debug!("Candidate {} is blacklisted", candidate);
            return None;
        }
        let image_ref = ImageRef::parse(candidate)?;
        if !self.matcher.matches(&image_ref.tag) {
            debug!(
                "Tag '{}' of {} doesn't match {} pattern '{}'",
                image_ref.tag,
                image_ref.image,
                self.matcher.pattern_type(),
                self.matcher.pattern_value()
            );
            return None;
        }
        Some(image_ref)
    }
}

/// A policy together with the files it was expanded to
#[derive(Debug, Clone)]
pub struct PolicyTarget {
    pub policy: UpdatePolicy,
    pub files: Vec<PathBuf>,
}

/// Runs update policies over files: extract, evaluate, mutate
pub struct Updater {
    cache: Arc<TagCache>,
    registry_prefixes: Vec<String>,
    engine: PolicyEngine,
}

impl Updater {
    pub fn new(cache: Arc<TagCache>, registry_prefixes: Vec<String>) -> Self {
        Self {
            cache,
            registry_prefixes,
            engine: PolicyEngine,
        }
    }

    /// Apply one policy to `files`, in order.
    ///
    /// A malformed policy is returned as an error before any file is touched.
    /// Unreadable or unwritable files are logged and skipped.
    pub fn run_policy(
        &self,
        files: &[PathBuf],
        policy: &UpdatePolicy,
    ) -> Result<Vec<ChangeRequest>, PolicyError> {
        let compiled = CompiledPolicy::compile(policy)?;
        Ok(self.apply_compiled(files, &compiled))
    }

    /// Apply every policy of a repository in configuration order.
    ///
    /// All policies are compiled first, so a configuration error aborts the
    /// pass before any file is modified.
    pub fn run_repository(
        &self,
        targets: &[PolicyTarget],
    ) -> Result<Vec<ChangeRequest>, PolicyError> {
        let compiled = targets
            .iter()
            .map(|target| {
                CompiledPolicy::compile(&target.policy).inspect_err(|e| {
                    error!("Policy '{}' is misconfigured: {}", target.policy.pattern, e)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut changes = Vec::new();
        for (target, policy) in targets.iter().zip(&compiled) {
            changes.extend(self.apply_compiled(&target.files, policy));
        }
        Ok(changes)
    }

    fn apply_compiled(&self, files: &[PathBuf], policy: &CompiledPolicy) -> Vec<ChangeRequest> {
        let mut changes = Vec::new();
        for file in files {
            FILES_SCANNED.inc();
            changes.extend(self.update_file(file, policy));
        }
        changes
    }

    fn update_file(&self, file: &Path, policy: &CompiledPolicy) -> Vec<ChangeRequest> {
        let candidates = match extract_candidates(file, &self.registry_prefixes) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Skipping file: {:#}", e);
                return Vec::new();
            },
        };
        CANDIDATES_FOUND.inc_by(candidates.len() as u64);

        let mut changes = Vec::new();
        for candidate in candidates {
            let Some(image_ref) = policy.eligible(&candidate) else {
                continue;
            };

            let cached = self.cache.query_by_image(&image_ref.image);
            let decision = self.engine.evaluate(
                &image_ref.tag,
                &cached,
                &policy.matcher,
                &image_ref.image,
                file,
            );
            let Some(change) = decision.into_change() else {
                continue;
            };

            match apply_change(file, &change.image, &change.old, &change.new) {
                Ok(true) => {
                    info!(
                        "Promoted {} to {} in {}",
                        change.old_reference(),
                        change.new_reference(),
                        file.display()
                    );
                    CHANGES_APPLIED.inc();
                    changes.push(change);
                },
                Ok(false) => {},
                Err(e) => warn!("Failed to apply change to {}: {:#}", file.display(), e),
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::BlacklistEntry;
    use crate::models::TagInfo;
    use chrono::{Duration, Utc};
    use std::fs;

    fn cache_with(tags: &[(&str, &str, i64)]) -> Arc<TagCache> {
        let cache = TagCache::in_memory();
        for (image, tag, minutes_ago) in tags {
            cache
                .put(&TagInfo {
                    image: image.to_string(),
                    hash: format!("hash-{}", tag),
                    created: Utc::now() - Duration::minutes(*minutes_ago),
                    tag: tag.to_string(),
                })
                .unwrap();
        }
        Arc::new(cache)
    }

    #[test]
    fn test_blacklist_compiles_and_matches() {
        let mut policy = UpdatePolicy::new("glob:develop-*");
        policy.blacklist.push(BlacklistEntry {
            pattern: "gcr.io/acme/legacy:*".to_string(),
        });
        let compiled = CompiledPolicy::compile(&policy).unwrap();

        assert!(compiled.is_blacklisted("gcr.io/acme/legacy:develop-1"));
        assert!(!compiled.is_blacklisted("gcr.io/acme/app:develop-1"));
    }

    #[test]
    fn test_tags_outside_the_pattern_are_not_eligible() {
        let compiled = CompiledPolicy::compile(&UpdatePolicy::new("glob:develop-*")).unwrap();

        assert_eq!(
            compiled.eligible("gcr.io/acme/app:develop-1"),
            Some(ImageRef {
                image: "gcr.io/acme/app".to_string(),
                tag: "develop-1".to_string(),
            })
        );
        assert_eq!(compiled.eligible("gcr.io/acme/app:master-7"), None);
        assert_eq!(compiled.eligible("gcr.io/acme/app"), None);
    }

    #[test]
    fn test_other_environments_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("values.yaml");
        fs::write(
            &file,
            "dev: gcr.io/acme/app:develop-1\nprod: gcr.io/acme/app:master-7\n",
        )
        .unwrap();

        // master-8 is newer than every develop tag but must never be considered
        let cache = cache_with(&[
            ("gcr.io/acme/app", "develop-2", 10),
            ("gcr.io/acme/app", "master-8", 1),
        ]);
        let updater = Updater::new(cache, vec!["gcr.io/acme".to_string()]);

        let changes = updater
            .run_policy(&[file.clone()], &UpdatePolicy::new("glob:develop-*"))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old, "develop-1");
        assert_eq!(changes[0].new, "develop-2");
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "dev: gcr.io/acme/app:develop-2\nprod: gcr.io/acme/app:master-7\n"
        );
    }

    #[test]
    fn test_invalid_blacklist_is_fatal() {
        let mut policy = UpdatePolicy::new("glob:develop-*");
        policy.blacklist.push(BlacklistEntry {
            pattern: "[".to_string(),
        });
        assert!(matches!(
            CompiledPolicy::compile(&policy),
            Err(PolicyError::InvalidBlacklist { .. })
        ));
    }

    #[test]
    fn test_unreadable_file_does_not_stop_the_policy() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.yaml");
        fs::write(&good, "image: gcr.io/acme/app:develop-100\n").unwrap();
        let missing = dir.path().join("missing.yaml");

        let cache = cache_with(&[("gcr.io/acme/app", "develop-200", 1)]);
        let updater = Updater::new(cache, vec!["gcr.io/acme".to_string()]);

        let changes = updater
            .run_policy(&[missing, good.clone()], &UpdatePolicy::new("glob:develop-*"))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].file, good);
    }

    #[test]
    fn test_bad_policy_aborts_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("values.yaml");
        fs::write(&file, "image: gcr.io/acme/app:develop-100\n").unwrap();

        let cache = cache_with(&[("gcr.io/acme/app", "develop-200", 1)]);
        let updater = Updater::new(cache, vec!["gcr.io/acme".to_string()]);

        let targets = vec![
            PolicyTarget {
                policy: UpdatePolicy::new("glob:develop-*"),
                files: vec![file.clone()],
            },
            PolicyTarget {
                policy: UpdatePolicy::new("develop-*"),
                files: vec![file.clone()],
            },
        ];
        assert!(matches!(
            updater.run_repository(&targets),
            Err(PolicyError::MalformedPattern(_))
        ));
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "image: gcr.io/acme/app:develop-100\n"
        );
    }
}
