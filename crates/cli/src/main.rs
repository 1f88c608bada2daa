use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use jobwatch_client::config::ENV_BASE_URL;
use jobwatch_client::{JobId, JobSnapshot, JobStatus, JobWatcher, TrackOptions, WatchConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jobwatch", version, about = "Follow long-running server jobs")]
struct Cli {
    /// Backend base URL. Falls back to JOBWATCH_BASE_URL.
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Track a job until it finishes.
    Watch {
        job_id: String,
        #[arg(long, value_enum, default_value_t = Mode::Hybrid)]
        mode: Mode,
        /// Poll interval in milliseconds.
        #[arg(long)]
        interval_ms: Option<u64>,
        /// POST /jobs/{id}/start before tracking.
        #[arg(long)]
        start: bool,
        /// Print every snapshot as a JSON line instead of a progress bar.
        #[arg(long)]
        json: bool,
    },
    /// Fetch the current status once.
    Status {
        job_id: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Stream,
    Poll,
    Hybrid,
}

impl Mode {
    fn options(self) -> TrackOptions {
        match self {
            Self::Stream => TrackOptions::stream_only(),
            Self::Poll => TrackOptions::poll_only(),
            Self::Hybrid => TrackOptions::hybrid(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Quiet by default: the progress bar is the UX.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .compact()
        .init();
    jobwatch_client::install_crypto_provider();

    let cli = Cli::parse();
    let config = load_config(cli.base_url)?;

    let ok = match cli.command {
        Command::Watch {
            job_id,
            mode,
            interval_ms,
            start,
            json,
        } => {
            let config = match interval_ms {
                Some(ms) => config.with_poll_interval(Duration::from_millis(ms)),
                None => config,
            };
            if start {
                trigger_start(&config, &job_id).await?;
            }
            watch(config, job_id, mode, json).await?
        }
        Command::Status { job_id, json } => status(config, job_id, json).await?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn load_config(base_url: Option<String>) -> Result<WatchConfig> {
    let config = WatchConfig::from_lookup(|key| match (key, &base_url) {
        (ENV_BASE_URL, Some(url)) => Some(url.clone()),
        _ => std::env::var(key).ok(),
    })
    .context("pass --base-url or set JOBWATCH_BASE_URL")?;
    Ok(config)
}

const START_PATH: &str = "/jobs/{id}/start";

fn start_url(config: &WatchConfig, job_id: &str) -> String {
    config.job_url(START_PATH, &JobId::from(job_id))
}

async fn trigger_start(config: &WatchConfig, job_id: &str) -> Result<()> {
    let url = start_url(config, job_id);
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("POST {url}"))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("POST {url} returned {status}: {body}");
    }
    eprintln!("  \u{2713} Started {job_id}");
    Ok(())
}

fn progress_bar(job_id: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner} {prefix} [{bar:40}] {pos:>3}% {msg}")
            .context("valid progress template")?
            .progress_chars("=> "),
    );
    pb.set_prefix(job_id.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn describe(snapshot: &JobSnapshot) -> String {
    let mut parts = vec![snapshot.status.to_string()];
    if snapshot.total_count > 0 {
        parts.push(format!("{}/{}", snapshot.processed_count, snapshot.total_count));
    }
    if !snapshot.stage.is_empty() {
        parts.push(snapshot.stage.clone());
    }
    if !snapshot.message.is_empty() {
        parts.push(snapshot.message.clone());
    }
    parts.join(" \u{00b7} ")
}

async fn watch(config: WatchConfig, job_id: String, mode: Mode, json: bool) -> Result<bool> {
    let watcher = JobWatcher::new(config)?;
    let handle = watcher.start(job_id.as_str(), mode.options())?;
    let mut updates = handle.subscribe();
    let bar = if json { None } else { Some(progress_bar(&job_id)?) };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                handle.cancel();
            }
            next = updates.next() => {
                let Some(snapshot) = next else { break };
                match &bar {
                    Some(pb) => {
                        pb.set_position((snapshot.progress * 100.0).round() as u64);
                        pb.set_message(describe(&snapshot));
                    }
                    None => println!("{}", serde_json::to_string(&snapshot)?),
                }
            }
        }
    }

    let last = handle.current();
    if let Some(pb) = bar {
        pb.finish_and_clear();
        match last.status {
            JobStatus::Completed => eprintln!("  \u{2713} {job_id} completed"),
            JobStatus::Cancelled => eprintln!("  \u{2717} {job_id} cancelled at {:.0}%", last.progress * 100.0),
            _ => {
                let reason = last
                    .failure
                    .as_ref()
                    .map(|f| f.message.as_str())
                    .unwrap_or("unknown error");
                eprintln!("  \u{2717} {job_id} failed at {:.0}%: {reason}", last.progress * 100.0);
            }
        }
    }
    Ok(last.status == JobStatus::Completed)
}

async fn status(config: WatchConfig, job_id: String, json: bool) -> Result<bool> {
    let watcher = JobWatcher::new(config)?;
    let update = watcher.fetch_once(&JobId::from(job_id.as_str())).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&update)?);
    } else {
        println!(
            "{job_id}: {} {:.0}% {} {}",
            update.status.as_str(),
            update.progress * 100.0,
            update.stage,
            update.message
        );
    }
    Ok(!matches!(
        update.status,
        jobwatch_client::RemoteStatus::Failed | jobwatch_client::RemoteStatus::Cancelled
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_joins_non_empty_parts() {
        let mut snapshot = JobSnapshot::pending("job-1");
        assert_eq!(describe(&snapshot), snapshot.status.to_string());

        snapshot.status = JobStatus::Running;
        snapshot.processed_count = 3;
        snapshot.total_count = 10;
        snapshot.stage = "processing".into();
        snapshot.message = "Processing item 3/10".into();
        assert_eq!(
            describe(&snapshot),
            format!("{} \u{00b7} 3/10 \u{00b7} processing \u{00b7} Processing item 3/10", JobStatus::Running)
        );
    }

    #[test]
    fn base_url_flag_overrides_env() {
        let config = load_config(Some("http://127.0.0.1:47900".into())).unwrap();
        assert_eq!(config.base_url, "http://127.0.0.1:47900");
    }

    #[test]
    fn start_url_encodes_job_id() {
        let config = WatchConfig::new("http://127.0.0.1:47900/api");
        assert_eq!(
            start_url(&config, "survey 7/a"),
            "http://127.0.0.1:47900/api/jobs/survey%207%2Fa/start"
        );
    }

    #[test]
    fn cli_parses_watch_mode() {
        let cli = Cli::try_parse_from(["jobwatch", "watch", "job-1", "--mode", "poll", "--json"]).unwrap();
        match cli.command {
            Command::Watch { job_id, mode, json, .. } => {
                assert_eq!(job_id, "job-1");
                assert!(matches!(mode, Mode::Poll));
                assert!(json);
            }
            Command::Status { .. } => panic!("expected watch"),
        }
    }
}
