//! Client configuration.
//!
//! The base URL is owned by the embedding application; everything else has
//! a default tuned for jobs that run for minutes.

use std::str::FromStr;
use std::time::Duration;

use jobwatch_types::JobId;

use crate::error::{Result, TrackError};
use crate::reconnect::ReconnectPolicy;

pub const ENV_BASE_URL: &str = "JOBWATCH_BASE_URL";
pub const ENV_STATUS_PATH: &str = "JOBWATCH_STATUS_PATH";
pub const ENV_STREAM_PATH: &str = "JOBWATCH_STREAM_PATH";
pub const ENV_POLL_INTERVAL_MS: &str = "JOBWATCH_POLL_INTERVAL_MS";
pub const ENV_POLL_MAX_FAILURES: &str = "JOBWATCH_POLL_MAX_FAILURES";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "JOBWATCH_REQUEST_TIMEOUT_MS";
pub const ENV_STREAM_IDLE_TIMEOUT_MS: &str = "JOBWATCH_STREAM_IDLE_TIMEOUT_MS";
pub const ENV_RECONNECT_BASE_MS: &str = "JOBWATCH_RECONNECT_BASE_MS";
pub const ENV_RECONNECT_CAP_MS: &str = "JOBWATCH_RECONNECT_CAP_MS";
pub const ENV_RECONNECT_MAX_ATTEMPTS: &str = "JOBWATCH_RECONNECT_MAX_ATTEMPTS";
pub const ENV_POLL_PROGRESS_SCALE: &str = "JOBWATCH_POLL_PROGRESS_SCALE";
pub const ENV_STREAM_PROGRESS_SCALE: &str = "JOBWATCH_STREAM_PROGRESS_SCALE";

/// Placeholder replaced by the URL-encoded job id in path templates.
const ID_PLACEHOLDER: &str = "{id}";

/// Unit an endpoint reports `progress` in.
///
/// When a body also carries processed/total counts, the reading that agrees
/// with the counts wins over the configured scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressScale {
    /// `0.0..=1.0`
    Fraction,
    /// `0..=100`
    Percent,
}

impl FromStr for ProgressScale {
    type Err = TrackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fraction" => Ok(Self::Fraction),
            "percent" => Ok(Self::Percent),
            other => Err(TrackError::Config(format!(
                "unknown progress scale {other:?} (expected fraction or percent)"
            ))),
        }
    }
}

/// Polling cadence and failure tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Consecutive failed requests tolerated before polling gives up.
    pub max_consecutive_failures: u32,
    pub request_timeout: Duration,
    /// Status endpoints report a fraction.
    pub progress_scale: ProgressScale,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_consecutive_failures: 5,
            request_timeout: Duration::from_secs(10),
            progress_scale: ProgressScale::Fraction,
        }
    }
}

/// Push channel timeouts and keepalive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub connect_timeout: Duration,
    /// A socket with no inbound frame for this long is treated as dropped.
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Push frames report percent.
    pub progress_scale: ProgressScale,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            progress_scale: ProgressScale::Percent,
        }
    }
}

/// Full configuration for a [`crate::JobWatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// e.g. `http://localhost:8000/api`. Supplied by the embedding app.
    pub base_url: String,
    pub status_path: String,
    pub stream_path: String,
    pub poll: PollConfig,
    pub stream: StreamConfig,
    pub reconnect: ReconnectPolicy,
}

impl WatchConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            status_path: "/jobs/{id}/status".to_string(),
            stream_path: "/ws/jobs/{id}".to_string(),
            poll: PollConfig::default(),
            stream: StreamConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Build from `JOBWATCH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup(ENV_BASE_URL)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| TrackError::Config(format!("{ENV_BASE_URL} is not set")))?;
        let mut config = Self::new(base_url);

        if let Some(path) = lookup(ENV_STATUS_PATH) {
            config.status_path = path;
        }
        if let Some(path) = lookup(ENV_STREAM_PATH) {
            config.stream_path = path;
        }
        if let Some(ms) = parse_var(&lookup, ENV_POLL_INTERVAL_MS)? {
            config.poll.interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, ENV_POLL_MAX_FAILURES)? {
            config.poll.max_consecutive_failures = n;
        }
        if let Some(ms) = parse_var(&lookup, ENV_REQUEST_TIMEOUT_MS)? {
            config.poll.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, ENV_STREAM_IDLE_TIMEOUT_MS)? {
            config.stream.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, ENV_RECONNECT_BASE_MS)? {
            config.reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, ENV_RECONNECT_CAP_MS)? {
            config.reconnect.cap_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, ENV_RECONNECT_MAX_ATTEMPTS)? {
            config.reconnect.max_attempts = n;
        }
        if let Some(raw) = lookup(ENV_POLL_PROGRESS_SCALE) {
            config.poll.progress_scale = raw.parse()?;
        }
        if let Some(raw) = lookup(ENV_STREAM_PROGRESS_SCALE) {
            config.stream.progress_scale = raw.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_status_path(mut self, path: impl Into<String>) -> Self {
        self.status_path = path.into();
        self
    }

    pub fn with_stream_path(mut self, path: impl Into<String>) -> Self {
        self.stream_path = path.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll.interval = interval;
        self
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Reject configurations that would spin or never connect.
    pub fn validate(&self) -> Result<()> {
        http_scheme(&self.base_url)?;
        if self.poll.interval.is_zero() {
            return Err(TrackError::Config("poll interval must be non-zero".into()));
        }
        if self.reconnect.base_delay > self.reconnect.cap_delay {
            return Err(TrackError::Config(format!(
                "reconnect base delay {:?} exceeds cap {:?}",
                self.reconnect.base_delay, self.reconnect.cap_delay
            )));
        }
        for path in [&self.status_path, &self.stream_path] {
            if !path.contains(ID_PLACEHOLDER) {
                return Err(TrackError::Config(format!(
                    "path template {path:?} has no {ID_PLACEHOLDER} placeholder"
                )));
            }
        }
        Ok(())
    }

    /// `base_url` joined with `template`, `{id}` replaced by the encoded id.
    pub fn job_url(&self, template: &str, job_id: &JobId) -> String {
        format!("{}{}", self.base_url, expand(template, job_id))
    }

    /// `GET` endpoint for one job's status.
    pub fn status_url(&self, job_id: &JobId) -> String {
        self.job_url(&self.status_path, job_id)
    }

    /// Push channel endpoint, with the scheme switched to `ws`/`wss`.
    pub fn stream_url(&self, job_id: &JobId) -> Result<String> {
        let (scheme, rest) = http_scheme(&self.base_url)?;
        let ws_scheme = match scheme {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        Ok(format!(
            "{ws_scheme}://{rest}{}",
            expand(&self.stream_path, job_id)
        ))
    }
}

fn expand(template: &str, job_id: &JobId) -> String {
    template.replace(ID_PLACEHOLDER, &urlencoding::encode(job_id.as_str()))
}

fn http_scheme(url: &str) -> Result<(&str, &str)> {
    match url.split_once("://") {
        Some((scheme @ ("http" | "https" | "ws" | "wss"), rest)) if !rest.is_empty() => {
            Ok((scheme, rest))
        }
        _ => Err(TrackError::Config(format!(
            "base URL {url:?} must start with http://, https://, ws:// or wss://"
        ))),
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TrackError::Config(format!("{key}={raw:?} is not a valid number"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = WatchConfig::new("http://localhost:8000/api/");
        assert_eq!(cfg.base_url, "http://localhost:8000/api");
        assert_eq!(cfg.poll.interval, Duration::from_secs(2));
        assert_eq!(cfg.poll.max_consecutive_failures, 5);
        assert_eq!(cfg.stream.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.poll.progress_scale, ProgressScale::Fraction);
        assert_eq!(cfg.stream.progress_scale, ProgressScale::Percent);
        assert_eq!(cfg.reconnect, ReconnectPolicy::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_urls() {
        let cfg = WatchConfig::new("https://example.test/api");
        let id = JobId::from("gen 1/2");
        assert_eq!(
            cfg.status_url(&id),
            "https://example.test/api/jobs/gen%201%2F2/status"
        );
        assert_eq!(
            cfg.stream_url(&id).unwrap(),
            "wss://example.test/api/ws/jobs/gen%201%2F2"
        );

        let cfg = WatchConfig::new("http://127.0.0.1:47900")
            .with_stream_path("/ws/workflows/{id}/progress");
        assert_eq!(
            cfg.stream_url(&JobId::from("wf-9")).unwrap(),
            "ws://127.0.0.1:47900/ws/workflows/wf-9/progress"
        );
    }

    #[test]
    fn test_from_lookup_requires_base_url() {
        let err = WatchConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, TrackError::Config(msg) if msg.contains(ENV_BASE_URL)));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let cfg = WatchConfig::from_lookup(lookup(&[
            (ENV_BASE_URL, "http://jobs.internal"),
            (ENV_POLL_INTERVAL_MS, "500"),
            (ENV_POLL_MAX_FAILURES, "3"),
            (ENV_RECONNECT_BASE_MS, "250"),
            (ENV_RECONNECT_CAP_MS, "4000"),
            (ENV_RECONNECT_MAX_ATTEMPTS, "8"),
            (ENV_STREAM_PROGRESS_SCALE, "Fraction"),
        ]))
        .unwrap();
        assert_eq!(cfg.poll.progress_scale, ProgressScale::Fraction);
        assert_eq!(cfg.stream.progress_scale, ProgressScale::Fraction);
        assert_eq!(cfg.poll.interval, Duration::from_millis(500));
        assert_eq!(cfg.poll.max_consecutive_failures, 3);
        assert_eq!(cfg.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(cfg.reconnect.cap_delay, Duration::from_millis(4000));
        assert_eq!(cfg.reconnect.max_attempts, 8);
    }

    #[test]
    fn test_from_lookup_rejects_garbage_numbers() {
        let err = WatchConfig::from_lookup(lookup(&[
            (ENV_BASE_URL, "http://jobs.internal"),
            (ENV_POLL_INTERVAL_MS, "fast"),
        ]))
        .unwrap_err();
        assert!(matches!(err, TrackError::Config(msg) if msg.contains(ENV_POLL_INTERVAL_MS)));
    }

    #[test]
    fn test_from_lookup_rejects_unknown_scale() {
        let err = WatchConfig::from_lookup(lookup(&[
            (ENV_BASE_URL, "http://jobs.internal"),
            (ENV_POLL_PROGRESS_SCALE, "permille"),
        ]))
        .unwrap_err();
        assert!(matches!(err, TrackError::Config(msg) if msg.contains("permille")));
    }

    #[test]
    fn test_job_url_encodes_id() {
        let cfg = WatchConfig::new("http://127.0.0.1:47900");
        assert_eq!(
            cfg.job_url("/jobs/{id}/start", &JobId::from("a b/c")),
            "http://127.0.0.1:47900/jobs/a%20b%2Fc/start"
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(WatchConfig::new("localhost:8000").validate().is_err());
        assert!(WatchConfig::new("http://x")
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(WatchConfig::new("http://x")
            .with_status_path("/status")
            .validate()
            .is_err());
        assert!(WatchConfig::new("http://x")
            .with_reconnect(ReconnectPolicy::new(
                Duration::from_secs(10),
                Duration::from_secs(1),
                3
            ))
            .validate()
            .is_err());
    }
}
