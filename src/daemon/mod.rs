use crate::cache::TagCache;
use crate::commit::commit_message;
use crate::config::{Config, GitRepo, load_remote_updates};
use crate::extract::referenced_images;
use crate::files::find_files;
use crate::metrics::{
    COMMIT_FAILURES, COMMITS_TOTAL, GIT_SYNC_FAILURES, PASS_DURATION, PASSES_SKIPPED,
    PASSES_TOTAL, POLICY_ERRORS, REGISTRY_ERRORS,
};
use crate::git::GitOperations;
use crate::models::ChangeRequest;
use crate::models::webhook::ControlEvent;
use crate::registry::TagSource;
use crate::update::{PolicyTarget, Updater};
use crate::webhook::ControlReceiver;
use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// A repository that was synced and is ready for a pass
struct RepoPlan {
    repo: GitRepo,
    targets: Vec<PolicyTarget>,
}

impl RepoPlan {
    fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.targets.iter().flat_map(|target| target.files.iter())
    }
}

/// What one pass did
#[derive(Debug, Default)]
pub struct PassReport {
    pub repositories: usize,
    pub changes: Vec<ChangeRequest>,
    pub commits: usize,
}

/// Runs update passes on a timer and on control events
pub struct Daemon {
    config: Config,
    cache: Arc<TagCache>,
    git: Arc<dyn GitOperations>,
    tags: Arc<dyn TagSource>,
    paused_until: Option<DateTime<Utc>>,
}

impl Daemon {
    pub fn new(
        config: Config,
        cache: Arc<TagCache>,
        git: Arc<dyn GitOperations>,
        tags: Arc<dyn TagSource>,
    ) -> Self {
        Self {
            config,
            cache,
            git,
            tags,
            paused_until: None,
        }
    }

    /// Hold off new passes for the configured pause duration from `at`
    pub fn pause(&mut self, at: DateTime<Utc>) {
        let duration = TimeDelta::from_std(self.config.global.pause_duration())
            .unwrap_or(TimeDelta::MAX);
        let until = at.checked_add_signed(duration).unwrap_or(DateTime::<Utc>::MAX_UTC);
        info!("Pausing promotions until {}", until);
        self.paused_until = Some(until);
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.paused_until.is_some_and(|until| now < until)
    }

    /// Apply a control event; returns whether a pass should start now
    pub fn handle_event(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Pause {
                requested_at,
                requested_by,
            } => {
                debug!("Pause requested by {:?}", requested_by);
                self.pause(requested_at);
                false
            },
            ControlEvent::Build(build) => {
                info!("New build of {}, starting a pass", build.docker_registry_url);
                true
            },
        }
    }

    /// Run until the process stops, or once with `one_shot`
    pub async fn run(
        &mut self,
        mut control_rx: ControlReceiver,
        interval: Duration,
        one_shot: bool,
    ) -> Result<()> {
        if one_shot {
            self.run_pass().await;
            return Ok(());
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Daemon started, running a pass every {:?}", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.maybe_run_pass().await,
                Some(event) = control_rx.recv() => {
                    if self.handle_event(event) {
                        self.maybe_run_pass().await;
                    }
                },
            }
        }
    }

    async fn maybe_run_pass(&mut self) {
        if self.is_paused(Utc::now()) {
            info!("Paused, skipping pass");
            PASSES_SKIPPED.inc();
            return;
        }
        if self.paused_until.take().is_some() {
            info!("Pause expired, resuming promotions");
        }
        self.run_pass().await;
    }

    /// One full pass over every repository
    pub async fn run_pass(&self) -> PassReport {
        PASSES_TOTAL.inc();
        let _timer = PASS_DURATION.start_timer();

        let plans = self.plan_repositories().await;
        self.scan_registries(&plans).await;
        if let Err(e) = self.cache.save() {
            warn!("Failed to save tag cache: {:#}", e);
        }

        let prefixes = self.config.registry_prefixes();
        let passes = plans.into_iter().map(|plan| {
            let updater = Updater::new(self.cache.clone(), prefixes.clone());
            async move {
                let RepoPlan { repo, targets } = plan;
                let result =
                    tokio::task::spawn_blocking(move || updater.run_repository(&targets)).await;
                (repo, result)
            }
        });
        let results = join_all(passes).await;

        let mut report = PassReport {
            repositories: results.len(),
            ..Default::default()
        };
        for (repo, result) in results {
            let changes = match result {
                Ok(Ok(changes)) => changes,
                Ok(Err(e)) => {
                    error!("Skipping {}: {}", repo.display_name(), e);
                    POLICY_ERRORS.inc();
                    continue;
                },
                Err(e) => {
                    error!("Update of {} panicked: {}", repo.display_name(), e);
                    continue;
                },
            };

            if self.commit(&repo, &changes).await {
                report.commits += 1;
            }
            report.changes.extend(changes);
        }

        info!(
            "Pass complete: {} repositories, {} changes, {} commits",
            report.repositories,
            report.changes.len(),
            report.commits
        );
        report
    }

    async fn plan_repositories(&self) -> Vec<RepoPlan> {
        let mut plans = Vec::new();
        for repo in &self.config.git_repos {
            let checkout = match self.git.sync(repo).await {
                Ok(checkout) => checkout,
                Err(e) => {
                    warn!("Failed to sync {}: {:#}", repo.display_name(), e);
                    GIT_SYNC_FAILURES.inc();
                    continue;
                },
            };
            self.push_pending(repo).await;

            let mut policies = repo.updates.clone();
            if repo.remote_config {
                match load_remote_updates(&checkout) {
                    Ok(remote) => policies.extend(remote),
                    Err(e) => warn!(
                        "Ignoring remote config of {}: {}",
                        repo.display_name(),
                        e
                    ),
                }
            }

            let targets = policies
                .into_iter()
                .map(|policy| {
                    let files = policy
                        .files
                        .iter()
                        .flat_map(|target| find_files(&checkout.join(&target.path)))
                        .collect();
                    PolicyTarget { policy, files }
                })
                .collect();

            plans.push(RepoPlan {
                repo: repo.clone(),
                targets,
            });
        }
        plans
    }

    /// Push commits left behind by an earlier failed push
    async fn push_pending(&self, repo: &GitRepo) {
        match self.git.unpushed(repo).await {
            Ok(0) => {},
            Ok(ahead) => {
                info!(
                    "{} has {} unpushed commits, pushing",
                    repo.display_name(),
                    ahead
                );
                if let Err(e) = self.git.push(repo).await {
                    error!("Failed to push {}: {:#}", repo.display_name(), e);
                    COMMIT_FAILURES.inc();
                }
            },
            Err(e) => warn!(
                "Failed to count unpushed commits of {}: {:#}",
                repo.display_name(),
                e
            ),
        }
    }

    async fn scan_registries(&self, plans: &[RepoPlan]) {
        let files: Vec<PathBuf> = plans.iter().flat_map(|plan| plan.files()).cloned().collect();
        let prefixes = self.config.registry_prefixes();

        let referenced = tokio::task::spawn_blocking(move || {
            prefixes
                .iter()
                .map(|prefix| referenced_images(&files, prefix))
                .collect::<Vec<_>>()
        })
        .await;
        let referenced = match referenced {
            Ok(referenced) => referenced,
            Err(e) => {
                error!("Collecting referenced images panicked: {}", e);
                return;
            },
        };

        for (registry, images) in self.config.docker_registries.iter().zip(referenced) {
            if images.is_empty() {
                debug!("No images of {} referenced", registry.reg);
                continue;
            }
            if let Err(e) = self.tags.scan(registry, &images, &self.cache).await {
                warn!("Registry scan of {} failed: {:#}", registry.reg, e);
                REGISTRY_ERRORS.inc();
            }
        }
    }

    async fn commit(&self, repo: &GitRepo, changes: &[ChangeRequest]) -> bool {
        let Some(message) = commit_message(changes, &self.config.global.git_message) else {
            debug!("No changes in {}", repo.display_name());
            return false;
        };

        match self.git.commit_and_push(repo, &message).await {
            Ok(()) => {
                COMMITS_TOTAL.inc();
                true
            },
            Err(e) => {
                error!("Failed to commit to {}: {:#}", repo.display_name(), e);
                COMMIT_FAILURES.inc();
                false
            },
        }
    }
}
