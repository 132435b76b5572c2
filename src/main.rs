use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use foundry::config::Config;
use foundry::generator::AgentGenerator;
use foundry::github::{GitHubClient, PullSource, RepoHost};
use foundry::mail::{Mailer, SmtpMailer};
use foundry::notify::Reconciler;
use foundry::queue::{JobQueue, PostgrestQueue};
use foundry::worker::Worker;

/// Feature-request worker: claims queued requests, runs the code-generation
/// agent against the configured repository, and reconciles merge
/// notifications.
#[derive(Parser)]
#[command(name = "foundry", version)]
struct Cli {
    /// Run a single poll cycle and exit instead of looping.
    #[arg(long)]
    once: bool,

    /// Override the poll interval in seconds.
    #[arg(long)]
    poll_seconds: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::from_env()?;
    if let Some(seconds) = cli.poll_seconds {
        config.poll_interval = Duration::from_secs(seconds);
    }

    let queue: Arc<dyn JobQueue> = Arc::new(
        PostgrestQueue::new(&config.queue_url, &config.queue_service_key)
            .context("Failed to build queue client")?,
    );
    let github = Arc::new(GitHubClient::new(config.github_token.clone())?);
    let host: Arc<dyn RepoHost> = github.clone();
    let pulls: Arc<dyn PullSource> = github;

    let mailer: Option<Arc<dyn Mailer>> = SmtpMailer::from_config(&config.mail)
        .context("Failed to build SMTP mailer")?
        .map(|m| Arc::new(m) as Arc<dyn Mailer>);
    if mailer.is_none() {
        info!("SMTP not configured; merge notifications will be skipped");
    }

    let generator = Arc::new(AgentGenerator::new(&config.agent_cmd, host));
    let reconciler = Reconciler::new(queue.clone(), pulls, mailer);
    let worker = Worker::new(
        queue,
        generator,
        reconciler,
        &config.repo_url,
        &config.worker_id,
        config.poll_interval,
    );

    if cli.once {
        worker.process_one().await;
        return Ok(());
    }
    worker.run().await;
    Ok(())
}
