use crate::models::policy::UpdatePolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Per-repository file that contributes extra update policies
pub const REMOTE_CONFIG_FILE: &str = ".laminar.yaml";

const DEFAULT_GIT_MESSAGE: &str = "automated promotion";
const DEFAULT_PAUSE_SECONDS: u64 = 900;
const DEFAULT_REGISTRY_TIMEOUT: u64 = 30;
const DEFAULT_POLL_FREQ: u64 = 60;
const DEFAULT_BRANCH: &str = "master";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no data was loaded")]
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub global: Global,
    pub docker_registries: Vec<DockerRegistry>,
    #[serde(rename = "git")]
    pub git_repos: Vec<GitRepo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Global {
    pub git_user: String,
    pub git_email: String,
    pub git_message: String,
    #[serde(rename = "gitHubToken")]
    pub github_token: String,
    /// Where repositories are checked out
    pub work_dir: PathBuf,
    /// Seconds a pause request holds off new passes
    pub pause_duration: u64,
}

impl Default for Global {
    fn default() -> Self {
        Self {
            git_user: String::new(),
            git_email: String::new(),
            git_message: DEFAULT_GIT_MESSAGE.to_string(),
            github_token: String::new(),
            work_dir: std::env::temp_dir().join("laminar"),
            pause_duration: DEFAULT_PAUSE_SECONDS,
        }
    }
}

impl Global {
    pub fn pause_duration(&self) -> Duration {
        Duration::from_secs(self.pause_duration)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerRegistry {
    /// Registry prefix as it appears in files, e.g. `gcr.io/acme`
    pub reg: String,
    #[serde(default)]
    pub name: String,
    /// Seconds allowed for one scan of this registry
    #[serde(default = "default_registry_timeout")]
    pub time_out: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Talk plain HTTP to this registry
    #[serde(default)]
    pub insecure: bool,
}

impl DockerRegistry {
    pub fn new(reg: impl Into<String>) -> Self {
        Self {
            reg: reg.into(),
            name: String::new(),
            time_out: DEFAULT_REGISTRY_TIMEOUT,
            username: None,
            password: None,
            insecure: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.time_out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepo {
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// SSH private key used for clone and push
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_poll_freq")]
    pub poll_freq: u64,
    /// Merge the updates of the repository's own `.laminar.yaml`
    #[serde(default)]
    pub remote_config: bool,
    #[serde(default)]
    pub updates: Vec<UpdatePolicy>,
    #[serde(default)]
    pub pre_commit_commands: Vec<String>,
}

impl GitRepo {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            url: url.into(),
            branch: default_branch(),
            key: None,
            poll_freq: DEFAULT_POLL_FREQ,
            remote_config: false,
            updates: Vec::new(),
            pre_commit_commands: Vec::new(),
        }
    }

    /// Name for logs: the configured name, or the url
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.url
        } else {
            &self.name
        }
    }
}

/// Contents of a repository's `.laminar.yaml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUpdates {
    #[serde(default)]
    pub updates: Vec<UpdatePolicy>,
}

fn default_registry_timeout() -> u64 {
    DEFAULT_REGISTRY_TIMEOUT
}

fn default_poll_freq() -> u64 {
    DEFAULT_POLL_FREQ
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

impl Config {
    /// Registry prefixes searched for in tracked files, in configuration order
    pub fn registry_prefixes(&self) -> Vec<String> {
        self.docker_registries
            .iter()
            .map(|registry| registry.reg.clone())
            .collect()
    }
}

pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    debug!("Reading configuration from {}", path.display());
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&raw)
}

/// Parse a configuration document, filling in defaults.
///
/// A document that carries no settings at all is rejected with
/// [`ConfigError::Empty`].
pub fn parse_config(raw: &str) -> Result<Config, ConfigError> {
    if raw.trim().is_empty() {
        return Err(ConfigError::Empty);
    }

    let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
    if !value.is_mapping() {
        return Err(ConfigError::Empty);
    }

    let config: Config = serde_yaml::from_value(value)?;
    if config == Config::default() {
        return Err(ConfigError::Empty);
    }
    Ok(config)
}

/// Read the extra update policies of a checked out repository.
///
/// A missing file contributes nothing.
pub fn load_remote_updates(checkout: &Path) -> Result<Vec<UpdatePolicy>, ConfigError> {
    let path = checkout.join(REMOTE_CONFIG_FILE);
    if !path.exists() {
        warn!("{} does not exist", path.display());
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let remote: RemoteUpdates = serde_yaml::from_str(&raw)?;
    debug!(
        "Loaded {} updates from {}",
        remote.updates.len(),
        path.display()
    );
    Ok(remote.updates)
}
