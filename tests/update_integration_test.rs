// Integration tests for the update orchestrator
//
// These tests run policies over real files on disk against a seeded tag
// cache and check both the returned change requests and the rewritten files

mod common;

use laminar::extract::extract_candidates;
use laminar::models::policy::BlacklistEntry;
use laminar::mutate::apply_change;
use laminar::update::PolicyTarget;
use laminar::{PolicyError, UpdatePolicy, Updater};
use std::fs;

#[test]
fn test_end_to_end_promotion() {
    let dir = tempfile::tempdir().unwrap();
    let file = common::write_file(
        dir.path(),
        "values.yaml",
        "image: gcr.io/acme/app:develop-100\n",
    );

    let cache = common::cache_with(&[
        ("gcr.io/acme/app", "develop-200", 10),
        ("gcr.io/acme/app", "develop-100", 0),
    ]);
    let updater = Updater::new(cache, common::prefixes(&["gcr.io/acme"]));

    let changes = updater
        .run_policy(&[file.clone()], &UpdatePolicy::new("glob:develop-*"))
        .unwrap();

    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].old, "develop-100");
    assert_eq!(changes[0].new, "develop-200");
    assert_eq!(changes[0].image, "gcr.io/acme/app");
    assert_eq!(changes[0].file, file);
    assert_eq!(
        fs::read_to_string(&file).unwrap(),
        "image: gcr.io/acme/app:develop-200\n"
    );

    // a second run finds nothing left to do
    let again = updater
        .run_policy(&[file], &UpdatePolicy::new("glob:develop-*"))
        .unwrap();
    assert!(again.is_empty());
}

#[test]
fn test_repeated_reference_is_one_candidate_and_one_change() {
    let dir = tempfile::tempdir().unwrap();
    let file = common::write_file(
        dir.path(),
        "values.yaml",
        "\
api:
  image: gcr.io/acme/app:develop-100
worker:
  image: gcr.io/acme/app:develop-100
cron:
  image: gcr.io/acme/app:develop-100
",
    );

    let candidates = extract_candidates(&file, &common::prefixes(&["gcr.io/acme"])).unwrap();
    assert_eq!(candidates, vec!["gcr.io/acme/app:develop-100"]);

    let cache = common::cache_with(&[("gcr.io/acme/app", "develop-200", 10)]);
    let updater = Updater::new(cache, common::prefixes(&["gcr.io/acme"]));
    let changes = updater
        .run_policy(&[file.clone()], &UpdatePolicy::new("glob:develop-*"))
        .unwrap();

    assert_eq!(changes.len(), 1);
    let content = fs::read_to_string(&file).unwrap();
    assert_eq!(content.matches("gcr.io/acme/app:develop-200").count(), 3);
    assert!(!content.contains("develop-100"));
}

#[test]
fn test_untracked_registry_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let file = common::write_file(
        dir.path(),
        "values.yaml",
        "image: quay.io/acme/app:develop-100\n",
    );

    let cache = common::cache_with(&[("quay.io/acme/app", "develop-200", 10)]);
    let updater = Updater::new(cache, common::prefixes(&["gcr.io/acme"]));

    let changes = updater
        .run_policy(&[file], &UpdatePolicy::new("glob:develop-*"))
        .unwrap();
    assert!(changes.is_empty());
}

#[test]
fn test_blacklisted_images_are_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let file = common::write_file(
        dir.path(),
        "values.yaml",
        "\
app: gcr.io/acme/app:develop-100
legacy: gcr.io/acme/legacy:develop-100
",
    );

    let cache = common::cache_with(&[
        ("gcr.io/acme/app", "develop-200", 10),
        ("gcr.io/acme/legacy", "develop-200", 10),
    ]);
    let updater = Updater::new(cache, common::prefixes(&["gcr.io/acme"]));

    let mut policy = UpdatePolicy::new("glob:develop-*");
    policy.blacklist.push(BlacklistEntry {
        pattern: "gcr.io/acme/legacy:*".to_string(),
    });
    let changes = updater.run_policy(&[file.clone()], &policy).unwrap();

    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].image, "gcr.io/acme/app");
    let content = fs::read_to_string(&file).unwrap();
    assert!(content.contains("gcr.io/acme/app:develop-200"));
    assert!(content.contains("gcr.io/acme/legacy:develop-100"));
}

#[test]
fn test_malformed_policy_is_a_configuration_error() {
    let cache = common::cache_with(&[]);
    let updater = Updater::new(cache, common::prefixes(&["gcr.io/acme"]));

    let err = updater
        .run_policy(&[], &UpdatePolicy::new("glob-develop-*"))
        .unwrap_err();
    assert!(matches!(err, PolicyError::MalformedPattern(_)));
    assert!(err.to_string().contains("glob-develop-*"));

    let err = updater
        .run_policy(&[], &UpdatePolicy::new("glob:develop-["))
        .unwrap_err();
    assert!(matches!(err, PolicyError::InvalidGlob { .. }));
}

#[test]
fn test_repository_changes_keep_policy_order() {
    let dir = tempfile::tempdir().unwrap();
    let dev = common::write_file(dir.path(), "dev.yaml", "image: gcr.io/acme/app:develop-1\n");
    let prod = common::write_file(dir.path(), "prod.yaml", "image: gcr.io/acme/app:1.2.0\n");

    let cache = common::cache_with(&[
        ("gcr.io/acme/app", "1.2.1", 20),
        ("gcr.io/acme/app", "develop-2", 10),
    ]);
    let updater = Updater::new(cache, common::prefixes(&["gcr.io/acme"]));

    let targets = vec![
        PolicyTarget {
            policy: UpdatePolicy::new("glob:develop-*"),
            files: vec![dev.clone(), prod.clone()],
        },
        PolicyTarget {
            policy: UpdatePolicy::new("semver:~1.2"),
            files: vec![dev.clone(), prod.clone()],
        },
    ];
    let changes = updater.run_repository(&targets).unwrap();

    let summary: Vec<(String, String)> = changes
        .iter()
        .map(|c| (c.old.clone(), c.new.clone()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("develop-1".to_string(), "develop-2".to_string()),
            ("1.2.0".to_string(), "1.2.1".to_string()),
        ]
    );
    assert_eq!(changes[0].file, dev);
    assert_eq!(changes[1].file, prod);
}

#[test]
fn test_mutation_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let file = common::write_file(dir.path(), "values.yaml", "a: img:old\nb: [img:old]\n");

    assert!(apply_change(&file, "img", "old", "new").unwrap());
    let content = fs::read_to_string(&file).unwrap();
    assert_eq!(content.matches("img:old").count(), 0);
    assert_eq!(content.matches("img:new").count(), 2);

    assert!(!apply_change(&file, "img", "old", "new").unwrap());
}
