//! Runner configuration
//!
//! Polling, heartbeat and log streaming intervals, plus the labels the runner
//! advertises when it asks for work.

use std::path::PathBuf;
use std::time::Duration;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this runner instance
    pub runner_id: String,

    /// Orchestrator base URL (e.g., "http://localhost:8080")
    pub orchestrator_url: String,

    /// How long one poll may wait server-side for a stage
    pub poll_timeout: Duration,

    /// How often buffered step output is sent to the orchestrator
    pub log_send_interval: Duration,

    /// How often the lease on a running stage is renewed
    pub heartbeat_interval: Duration,

    /// Maximum time one step may run
    pub step_timeout: Duration,

    /// Labels matched against stage requirements (e.g. `linux`, `gpu`)
    pub labels: Vec<String>,

    /// Stages executed at the same time
    pub max_parallel_stages: usize,

    /// Parent directory of per-stage workspaces
    pub workspace_base: PathBuf,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(runner_id: String, orchestrator_url: String) -> Self {
        Self {
            runner_id,
            orchestrator_url,
            poll_timeout: Duration::from_secs(30),
            log_send_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
            step_timeout: Duration::from_secs(3600),
            labels: Vec::new(),
            max_parallel_stages: 2,
            workspace_base: std::env::temp_dir().join("gantry"),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - RUNNER_ID (required)
    /// - ORCHESTRATOR_URL (required)
    /// - POLL_TIMEOUT (optional, seconds, default: 30)
    /// - LOG_SEND_INTERVAL (optional, milliseconds, default: 2000)
    /// - HEARTBEAT_INTERVAL (optional, seconds, default: 10)
    /// - STEP_TIMEOUT (optional, seconds, default: 3600)
    /// - MAX_PARALLEL_STAGES (optional, default: 2)
    /// - RUNNER_LABELS (optional, comma separated)
    /// - WORKSPACE_DIR (optional, default: $TMPDIR/gantry)
    pub fn from_env() -> anyhow::Result<Self> {
        let runner_id = std::env::var("RUNNER_ID")
            .map_err(|_| anyhow::anyhow!("RUNNER_ID environment variable not set"))?;

        let orchestrator_url = std::env::var("ORCHESTRATOR_URL")
            .map_err(|_| anyhow::anyhow!("ORCHESTRATOR_URL environment variable not set"))?;

        let mut config = Self::new(runner_id, orchestrator_url);

        if let Some(secs) = env_parse::<u64>("POLL_TIMEOUT") {
            config.poll_timeout = Duration::from_secs(secs);
        }
        if let Some(millis) = env_parse::<u64>("LOG_SEND_INTERVAL") {
            config.log_send_interval = Duration::from_millis(millis);
        }
        if let Some(secs) = env_parse::<u64>("HEARTBEAT_INTERVAL") {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("STEP_TIMEOUT") {
            config.step_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("MAX_PARALLEL_STAGES") {
            config.max_parallel_stages = n;
        }
        if let Ok(labels) = std::env::var("RUNNER_LABELS") {
            config.labels = parse_labels(&labels);
        }
        if let Ok(dir) = std::env::var("WORKSPACE_DIR") {
            config.workspace_base = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Adds a label for stage matching
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runner_id.is_empty() {
            anyhow::bail!("runner_id cannot be empty");
        }

        if self.runner_id.len() > 255 {
            anyhow::bail!("runner_id cannot exceed 255 characters");
        }

        if !self.orchestrator_url.starts_with("http://")
            && !self.orchestrator_url.starts_with("https://")
        {
            anyhow::bail!("orchestrator_url must start with http:// or https://");
        }

        if self.log_send_interval.is_zero() {
            anyhow::bail!("log_send_interval must be greater than 0");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        if self.step_timeout.is_zero() {
            anyhow::bail!("step_timeout must be greater than 0");
        }

        if self.max_parallel_stages == 0 {
            anyhow::bail!("max_parallel_stages must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "http://localhost:8080".to_string(),
        )
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_labels(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_timeout, Duration::from_secs(30));
        assert_eq!(config.max_parallel_stages, 2);
        assert!(config.labels.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.runner_id = String::new();
        assert!(config.validate().is_err());
        config.runner_id = "test".to_string();

        config.orchestrator_url = "not-a-url".to_string();
        assert!(config.validate().is_err());
        config.orchestrator_url = "http://localhost:8080".to_string();

        config.max_parallel_stages = 0;
        assert!(config.validate().is_err());
        config.max_parallel_stages = 1;

        // Zero poll timeout means short polling, which is allowed
        config.poll_timeout = Duration::ZERO;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_labels() {
        assert_eq!(parse_labels(" linux, gpu,,arm64 "), vec!["linux", "gpu", "arm64"]);
        assert!(parse_labels("").is_empty());

        let config = Config::default().with_label("linux").with_label("env=prod");
        assert_eq!(config.labels, vec!["linux", "env=prod"]);
    }
}
