use crate::config::GitRepo;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Repository operations the daemon needs
#[async_trait]
pub trait GitOperations: Send + Sync {
    /// Make sure an up to date checkout of `repo` exists and return its path
    async fn sync(&self, repo: &GitRepo) -> Result<PathBuf>;

    /// Commit every change in the checkout and push it
    async fn commit_and_push(&self, repo: &GitRepo, message: &str) -> Result<()>;

    /// Number of local commits the remote branch doesn't have yet
    async fn unpushed(&self, repo: &GitRepo) -> Result<usize>;

    /// Push the checkout's branch to its remote
    async fn push(&self, repo: &GitRepo) -> Result<()>;
}

/// [`GitOperations`] backed by the `git` command line
pub struct GitCli {
    work_dir: PathBuf,
    user: String,
    email: String,
}

impl GitCli {
    pub fn new(work_dir: impl Into<PathBuf>, user: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            user: user.into(),
            email: email.into(),
        }
    }

    pub fn checkout_path(&self, repo: &GitRepo) -> PathBuf {
        repo_path(&self.work_dir, repo)
    }

    async fn git(&self, repo: &GitRepo, dir: &Path, args: &[&str]) -> Result<String> {
        debug!("git {} (in {})", args.join(" "), dir.display());

        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0");
        if let Some(key) = &repo.key {
            command.env(
                "GIT_SSH_COMMAND",
                format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                    expand_home(key).display()
                ),
            );
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
        check_output(args, output)
    }

    async fn clone(&self, repo: &GitRepo, path: &Path) -> Result<()> {
        if path.exists() {
            debug!("Purging previous checkout {}", path.display());
            tokio::fs::remove_dir_all(path)
                .await
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.work_dir.display()))?;

        let target = path.to_string_lossy();
        self.git(
            repo,
            &self.work_dir,
            &[
                "clone",
                "--branch",
                &repo.branch,
                "--single-branch",
                &repo.url,
                &target,
            ],
        )
        .await?;

        info!(
            "Cloned {} ({}) into {}",
            repo.display_name(),
            repo.branch,
            path.display()
        );
        Ok(())
    }

    async fn reset_to_remote(&self, repo: &GitRepo, path: &Path) -> Result<()> {
        let remote = format!("origin/{}", repo.branch);
        self.git(repo, path, &["fetch", "origin", &repo.branch])
            .await?;
        self.git(repo, path, &["reset", "--hard", &remote]).await?;
        Ok(())
    }

    async fn run_pre_commit_commands(&self, repo: &GitRepo, path: &Path) {
        for command in &repo.pre_commit_commands {
            info!("Running pre-commit command: {}", command);
            match Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(path)
                .output()
                .await
            {
                Ok(output) if output.status.success() => {
                    debug!("{}", String::from_utf8_lossy(&output.stdout).trim_end());
                },
                Ok(output) => warn!(
                    "Pre-commit command '{}' failed ({}): {}",
                    command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim_end()
                ),
                Err(e) => warn!("Failed to start pre-commit command '{}': {}", command, e),
            }
        }
    }
}

#[async_trait]
impl GitOperations for GitCli {
    async fn sync(&self, repo: &GitRepo) -> Result<PathBuf> {
        let path = self.checkout_path(repo);

        if path.join(".git").is_dir() {
            debug!("Pulling {} ({})", repo.display_name(), repo.branch);
            if let Err(e) = self
                .git(repo, &path, &["pull", "--ff-only", "origin", &repo.branch])
                .await
            {
                // drops local commits the remote never took; the pass re-applies them
                warn!(
                    "Fast-forward of {} failed, resetting to origin/{}: {:#}",
                    repo.display_name(),
                    repo.branch,
                    e
                );
                self.reset_to_remote(repo, &path).await?;
            }
        } else {
            self.clone(repo, &path).await?;
        }

        let head = self.git(repo, &path, &["rev-parse", "HEAD"]).await?;
        debug!("{} is at {}", repo.display_name(), head.trim());
        Ok(path)
    }

    async fn commit_and_push(&self, repo: &GitRepo, message: &str) -> Result<()> {
        let path = self.checkout_path(repo);

        self.run_pre_commit_commands(repo, &path).await;

        self.git(repo, &path, &["add", "--all"]).await?;
        let status = self.git(repo, &path, &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            info!("Nothing to commit in {}", repo.display_name());
            return Ok(());
        }

        let user = format!("user.name={}", self.user);
        let email = format!("user.email={}", self.email);
        self.git(
            repo,
            &path,
            &["-c", &user, "-c", &email, "commit", "-m", message],
        )
        .await?;
        info!(
            "Committed to {} ({}): {}",
            repo.display_name(),
            repo.branch,
            message.lines().next().unwrap_or_default()
        );
        self.push(repo).await
    }

    async fn unpushed(&self, repo: &GitRepo) -> Result<usize> {
        let path = self.checkout_path(repo);
        let range = format!("origin/{}..HEAD", repo.branch);
        let count = self
            .git(repo, &path, &["rev-list", "--count", &range])
            .await?;
        parse_count(&count)
    }

    async fn push(&self, repo: &GitRepo) -> Result<()> {
        let path = self.checkout_path(repo);
        self.git(repo, &path, &["push", "origin", &repo.branch])
            .await?;
        info!("Pushed {} ({})", repo.display_name(), repo.branch);
        Ok(())
    }
}

fn parse_count(output: &str) -> Result<usize> {
    output
        .trim()
        .parse()
        .with_context(|| format!("Unexpected rev-list output '{}'", output.trim()))
}

fn check_output(args: &[&str], output: Output) -> Result<String> {
    if !output.status.success() {
        bail!(
            "git {} failed ({}): {}",
            args.first().copied().unwrap_or_default(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Checkout directory of a repository: `<work_dir>/<name or url>-<branch>`
pub fn repo_path(work_dir: &Path, repo: &GitRepo) -> PathBuf {
    let name = if repo.name.is_empty() {
        &repo.url
    } else {
        &repo.name
    };
    work_dir.join(format!("{}-{}", sanitize(name), sanitize(&repo.branch)))
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}
