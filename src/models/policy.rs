use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Separator between the pattern type and its value, e.g. `glob:develop-*`
pub const PATTERN_SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// Shell glob (`develop-*`)
    Glob,
    /// Regular expression, unanchored
    Regex,
    /// Semantic version constraint (`>=1.0.0`, `~1.2`)
    Semver,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Glob => "glob",
            Self::Regex => "regex",
            Self::Semver => "semver",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration errors raised while compiling an update policy.
///
/// These are operator mistakes: they abort the evaluation of the policy
/// (and the repository pass that contains it) instead of being skipped.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(
        "pattern string misconfigured: got '{0}', expected '<type>:<value>' such as 'glob:develop-*' or 'semver:~1.1'"
    )]
    MalformedPattern(String),

    #[error("support for pattern type '{0}' does not exist (expected glob, regex or semver)")]
    UnsupportedPatternType(String),

    #[error("invalid glob pattern '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("invalid regex pattern '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid blacklist pattern '{pattern}': {source}")]
    InvalidBlacklist {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

impl FromStr for PatternType {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "glob" => Ok(PatternType::Glob),
            "regex" => Ok(PatternType::Regex),
            "semver" => Ok(PatternType::Semver),
            _ => Err(PolicyError::UnsupportedPatternType(s.to_string())),
        }
    }
}

/// A parsed `type:value` pattern string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSpec {
    pub pattern_type: PatternType,
    pub value: String,
}

impl FromStr for PatternSpec {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(PATTERN_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(value), None) => Ok(PatternSpec {
                pattern_type: kind.parse()?,
                value: value.to_string(),
            }),
            _ => Err(PolicyError::MalformedPattern(s.to_string())),
        }
    }
}

impl fmt::Display for PatternSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.pattern_type, PATTERN_SEPARATOR, self.value)
    }
}

/// A path inside the repository checkout; directories expand to their files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTarget {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub pattern: String,
}

/// Which files to scan and which tags are acceptable for them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePolicy {
    /// Pattern string such as `glob:develop-*`
    pub pattern: String,

    #[serde(default)]
    pub files: Vec<FileTarget>,

    /// Glob patterns; matching `image:tag` candidates are never touched
    #[serde(default)]
    pub blacklist: Vec<BlacklistEntry>,
}

impl UpdatePolicy {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            files: Vec::new(),
            blacklist: Vec::new(),
        }
    }

    pub fn pattern_spec(&self) -> Result<PatternSpec, PolicyError> {
        self.pattern.parse()
    }
}
