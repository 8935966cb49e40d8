use anyhow::{Context, Result};
use clap::Parser;
use laminar::cache::TagCache;
use laminar::config;
use laminar::daemon::Daemon;
use laminar::git::GitCli;
use laminar::metrics;
use laminar::registry::OciScanner;
use laminar::webhook;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Promote container image tags in git repositories
#[derive(Debug, Parser)]
#[command(name = "laminar", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "LAMINAR_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Tag cache location: ":memory:" or a snapshot file
    #[arg(long, env = "LAMINAR_CACHE", default_value = ":memory:")]
    cache: String,

    /// Seconds between passes
    #[arg(short, long, env = "LAMINAR_INTERVAL", default_value_t = 60)]
    interval: u64,

    /// Address of the control server
    #[arg(long, env = "LAMINAR_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Human readable debug logging
    #[arg(long, env = "LAMINAR_DEBUG")]
    debug: bool,

    /// Run a single pass and exit
    #[arg(long)]
    one_shot: bool,
}

fn init_tracing(debug: bool) {
    let registry = tracing_subscriber::registry();
    if debug {
        registry
            .with(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| "laminar=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "laminar=info".into()))
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    info!("Starting Laminar");

    let config = config::load_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    info!(
        "Loaded {} registries and {} repositories",
        config.docker_registries.len(),
        config.git_repos.len()
    );

    metrics::register_metrics();

    let cache = Arc::new(TagCache::open(&args.cache)?);
    let git = Arc::new(GitCli::new(
        config.global.work_dir.clone(),
        config.global.git_user.clone(),
        config.global.git_email.clone(),
    ));
    let tags = Arc::new(OciScanner::new());

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let github_token = config.global.github_token.clone();
    let mut daemon = Daemon::new(config, cache, git, tags);
    let interval = Duration::from_secs(args.interval.max(1));

    if args.one_shot {
        return daemon.run(event_rx, interval, true).await;
    }

    let server_handle = webhook::start_control_server(args.listen, event_tx, &github_token).await?;

    info!("Laminar is running");

    tokio::select! {
        _ = server_handle => info!("Control server stopped"),
        result = daemon.run(event_rx, interval, false) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
