// Library exports for the daemon binary and integration tests
//
// The binary entrypoint in main.rs only wires these modules together

pub mod cache;
pub mod commit;
pub mod config;
pub mod daemon;
pub mod extract;
pub mod files;
pub mod git;
pub mod metrics;
pub mod models;
pub mod mutate;
pub mod policy;
pub mod registry;
pub mod update;
pub mod webhook;

// Re-export commonly used types
pub use cache::TagCache;
pub use models::policy::{PatternSpec, PatternType, PolicyError, UpdatePolicy};
pub use models::{ChangeRequest, TagInfo};
pub use policy::{Decision, Matcher, PolicyEngine};
pub use update::Updater;

/// Convenience function for testing pattern matching
pub fn test_matches(tag: &str, pattern: &str) -> bool {
    pattern
        .parse::<PatternSpec>()
        .and_then(|spec| Matcher::compile(&spec))
        .map(|matcher| matcher.matches(tag))
        .unwrap_or(false)
}
