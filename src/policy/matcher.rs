use crate::models::policy::{PatternSpec, PatternType, PolicyError};
use glob::Pattern;
use regex::Regex;
use semver::{Version, VersionReq};
use tracing::{debug, warn};

/// A tag predicate compiled from a pattern spec.
///
/// Glob and regex patterns are compiled up front and fail loudly when they are
/// invalid. A semver constraint that does not parse is kept around and simply
/// never matches, since version strings are expected to be noisy.
#[derive(Debug, Clone)]
pub enum Matcher {
    Glob(Pattern),
    Regex(Regex),
    Semver {
        constraint: String,
        req: Option<VersionReq>,
    },
}

impl Matcher {
    pub fn compile(spec: &PatternSpec) -> Result<Self, PolicyError> {
        match spec.pattern_type {
            PatternType::Glob => Pattern::new(&spec.value).map(Matcher::Glob).map_err(|source| {
                PolicyError::InvalidGlob {
                    pattern: spec.value.clone(),
                    source,
                }
            }),
            PatternType::Regex => Regex::new(&spec.value).map(Matcher::Regex).map_err(|source| {
                PolicyError::InvalidRegex {
                    pattern: spec.value.clone(),
                    source,
                }
            }),
            PatternType::Semver => {
                let req = match VersionReq::parse(spec.value.trim()) {
                    Ok(req) => Some(req),
                    Err(e) => {
                        warn!(
                            "Bad semver constraint '{}' supplied, nothing will match: {}",
                            spec.value, e
                        );
                        None
                    },
                };
                Ok(Matcher::Semver {
                    constraint: spec.value.clone(),
                    req,
                })
            },
        }
    }

    pub fn matches(&self, tag: &str) -> bool {
        match self {
            Matcher::Glob(pattern) => pattern.matches(tag),
            Matcher::Regex(regex) => {
                let matched = regex.is_match(tag);
                debug!(
                    "Comparing regex '{}' with '{}': {}",
                    regex.as_str(),
                    tag,
                    matched
                );
                matched
            },
            Matcher::Semver { constraint, req } => {
                let Some(req) = req else {
                    debug!("Semver constraint '{}' is unusable", constraint);
                    return false;
                };
                let Some(version) = parse_version(tag) else {
                    debug!("Version '{}' is not a valid semver version", tag);
                    return false;
                };
                let matched = req.matches(&version);
                debug!(
                    "Comparing semver '{}' with '{}': {}",
                    constraint, tag, matched
                );
                matched
            },
        }
    }

    pub fn pattern_type(&self) -> PatternType {
        match self {
            Matcher::Glob(_) => PatternType::Glob,
            Matcher::Regex(_) => PatternType::Regex,
            Matcher::Semver { .. } => PatternType::Semver,
        }
    }

    pub fn pattern_value(&self) -> &str {
        match self {
            Matcher::Glob(pattern) => pattern.as_str(),
            Matcher::Regex(regex) => regex.as_str(),
            Matcher::Semver { constraint, .. } => constraint,
        }
    }
}

/// Parse a tag as a semantic version.
///
/// Accepts a leading `v` and partial versions (`1.2` becomes `1.2.0`).
pub fn parse_version(tag: &str) -> Option<Version> {
    let clean = tag.trim();
    let clean = clean
        .strip_prefix('v')
        .or_else(|| clean.strip_prefix('V'))
        .unwrap_or(clean);

    if let Ok(version) = Version::parse(clean) {
        return Some(version);
    }

    // Pad missing minor/patch components
    let split_at = clean.find(['-', '+']).unwrap_or(clean.len());
    let (core, rest) = clean.split_at(split_at);
    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 2
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(rest);

    Version::parse(&padded).ok()
}
