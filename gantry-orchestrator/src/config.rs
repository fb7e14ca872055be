//! Orchestrator configuration
//!
//! Command-line flags (with environment fallbacks) are parsed by [`Cli`] and
//! turned into an [`OrchestratorConfig`], which carries one nested config per
//! component. Every component config has sensible defaults and a `validate`.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Parser, Debug)]
#[command(name = "gantry-orchestrator")]
#[command(about = "Gantry pipeline orchestrator", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Address the HTTP server binds to
    #[arg(long, env = "GANTRY_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Storage backend
    #[arg(long, env = "GANTRY_STORE", value_enum, default_value_t = StoreKind::Postgres)]
    pub store: StoreKind,

    /// PostgreSQL connection string (required with --store postgres)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Directory holding bare repositories, one per repository id
    #[arg(long, env = "GANTRY_GIT_ROOT", default_value = "/var/lib/gantry/repos")]
    pub git_root: PathBuf,

    /// Externally reachable base URL, used for commit check links
    #[arg(long, env = "GANTRY_PUBLIC_URL", default_value = "http://localhost:8080")]
    pub public_url: String,

    /// Identity of this process in lock and lease records
    #[arg(long, env = "GANTRY_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Stage lease granted to runners, in seconds
    #[arg(long, env = "GANTRY_STAGE_LEASE_SECONDS", default_value_t = 60)]
    pub stage_lease_seconds: u64,

    /// Lease expiries tolerated before a stage is forced to error
    #[arg(long, env = "GANTRY_MAX_RECLAIMS", default_value_t = 3)]
    pub max_reclaims: u32,

    /// Upper bound on runner long-poll waits, in seconds
    #[arg(long, env = "GANTRY_MAX_POLL_SECONDS", default_value_t = 30)]
    pub max_poll_seconds: u64,

    /// Interval between lease sweeps, in seconds
    #[arg(long, env = "GANTRY_SWEEP_INTERVAL_SECONDS", default_value_t = 15)]
    pub sweep_interval_seconds: u64,

    /// How long a running stage may take to acknowledge cancellation
    #[arg(long, env = "GANTRY_CANCEL_GRACE_SECONDS", default_value_t = 30)]
    pub cancel_grace_seconds: u64,

    /// Supersede pending executions of the same ref created within this window
    #[arg(long, env = "GANTRY_DEBOUNCE_SECONDS")]
    pub debounce_seconds: Option<u64>,

    #[arg(long, env = "GANTRY_WEBHOOK_MAX_ATTEMPTS", default_value_t = 3)]
    pub webhook_max_attempts: u32,

    #[arg(long, env = "GANTRY_WEBHOOK_TIMEOUT_SECONDS", default_value_t = 10)]
    pub webhook_timeout_seconds: u64,

    /// Allow webhooks targeting loopback addresses
    #[arg(long, env = "GANTRY_WEBHOOK_ALLOW_LOOPBACK")]
    pub webhook_allow_loopback: bool,

    /// Allow webhooks targeting private network addresses
    #[arg(long, env = "GANTRY_WEBHOOK_ALLOW_PRIVATE_NETWORK")]
    pub webhook_allow_private_network: bool,

    #[arg(long, env = "GANTRY_JOB_MAX_ATTEMPTS", default_value_t = 5)]
    pub job_max_attempts: u32,

    #[arg(long, env = "GANTRY_LOG_RETENTION_DAYS", default_value_t = 30)]
    pub log_retention_days: u64,

    #[arg(long, env = "GANTRY_WEBHOOK_RETENTION_DAYS", default_value_t = 14)]
    pub webhook_retention_days: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    /// Process-local state, lost on restart
    Memory,
    Postgres,
}

impl Cli {
    pub fn into_config(self) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();
        let instance_id = self
            .instance_id
            .unwrap_or_else(|| format!("orchestrator-{}", uuid::Uuid::new_v4().simple()));

        OrchestratorConfig {
            bind_addr: self.bind_addr,
            store: self.store,
            database_url: self.database_url,
            git_root: self.git_root,
            public_url: self.public_url,
            instance_id,
            execution: ExecutionConfig {
                stage_lease: Duration::from_secs(self.stage_lease_seconds),
                max_reclaims: self.max_reclaims,
                max_poll_wait: Duration::from_secs(self.max_poll_seconds),
                ..defaults.execution
            },
            trigger: TriggerConfig {
                debounce: match self.debounce_seconds {
                    Some(secs) => DebouncePolicy::SupersedePending {
                        window: Duration::from_secs(secs),
                    },
                    None => DebouncePolicy::Queue,
                },
            },
            canceler: CancelerConfig {
                grace: Duration::from_secs(self.cancel_grace_seconds),
                ..defaults.canceler
            },
            webhook: WebhookConfig {
                max_attempts: self.webhook_max_attempts,
                timeout: Duration::from_secs(self.webhook_timeout_seconds),
                allow_loopback: self.webhook_allow_loopback,
                allow_private_network: self.webhook_allow_private_network,
                ..defaults.webhook
            },
            scheduler: SchedulerConfig {
                max_attempts: self.job_max_attempts,
                ..defaults.scheduler
            },
            maintenance: MaintenanceConfig {
                sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
                log_retention: Duration::from_secs(self.log_retention_days * 86_400),
                webhook_retention: Duration::from_secs(self.webhook_retention_days * 86_400),
                ..defaults.maintenance
            },
            bus: defaults.bus,
        }
    }
}

/// Complete orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub bind_addr: String,
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub git_root: PathBuf,
    pub public_url: String,
    pub instance_id: String,
    pub bus: BusConfig,
    pub scheduler: SchedulerConfig,
    pub execution: ExecutionConfig,
    pub trigger: TriggerConfig,
    pub canceler: CancelerConfig,
    pub webhook: WebhookConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            store: StoreKind::Memory,
            database_url: None,
            git_root: PathBuf::from("/var/lib/gantry/repos"),
            public_url: "http://localhost:8080".to_string(),
            instance_id: "orchestrator".to_string(),
            bus: BusConfig::default(),
            scheduler: SchedulerConfig::default(),
            execution: ExecutionConfig::default(),
            trigger: TriggerConfig::default(),
            canceler: CancelerConfig::default(),
            webhook: WebhookConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.is_empty() {
            return Err(Error::Validation("instance_id cannot be empty".to_string()));
        }
        if self.store == StoreKind::Postgres && self.database_url.is_none() {
            return Err(Error::Validation(
                "DATABASE_URL is required with the postgres store".to_string(),
            ));
        }
        if !self.public_url.starts_with("http://") && !self.public_url.starts_with("https://") {
            return Err(Error::Validation(
                "public_url must start with http:// or https://".to_string(),
            ));
        }

        self.bus.validate()?;
        self.scheduler.validate()?;
        self.execution.validate()?;
        self.trigger.validate()?;
        self.canceler.validate()?;
        self.webhook.validate()?;
        self.maintenance.validate()
    }
}

fn require_positive(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(Error::Validation(format!("{} must be greater than 0", name)));
    }
    Ok(())
}

// =============================================================================
// Component configs
// =============================================================================

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// How often an idle subscription re-reads its stream
    pub poll_interval: Duration,
    /// Events fetched per read
    pub batch_size: u32,
    /// Backoff for handlers failing with transient errors
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Lease a consumer holds on its `(stream, group)` pair
    pub consumer_lease: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            retry_base: Duration::from_millis(200),
            retry_max: Duration::from_secs(30),
            consumer_lease: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("bus.poll_interval", self.poll_interval)?;
        require_positive("bus.consumer_lease", self.consumer_lease)?;
        if self.batch_size == 0 {
            return Err(Error::Validation("bus.batch_size must be greater than 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// How long a worker owns a claimed job before others may take it over
    pub job_lease: Duration,
    pub batch_size: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Lease held on `jobs:recurring:{id}` while a recurring job runs
    pub recurring_lock_lease: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            job_lease: Duration::from_secs(300),
            batch_size: 16,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(600),
            recurring_lock_lease: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("scheduler.tick_interval", self.tick_interval)?;
        require_positive("scheduler.job_lease", self.job_lease)?;
        require_positive("scheduler.recurring_lock_lease", self.recurring_lock_lease)?;
        if self.max_attempts == 0 {
            return Err(Error::Validation(
                "scheduler.max_attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Lease granted with each stage claim and heartbeat
    pub stage_lease: Duration,
    pub max_reclaims: u32,
    pub max_poll_wait: Duration,
    /// Lease held on per-pipeline and per-execution locks
    pub lock_lease: Duration,
    /// A busy lock is retried this many times before giving up with `Conflict`
    pub lock_retry_attempts: u32,
    pub lock_retry_delay: Duration,
    /// Pending stages inspected per claim attempt
    pub claim_scan_limit: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            stage_lease: Duration::from_secs(60),
            max_reclaims: 3,
            max_poll_wait: Duration::from_secs(30),
            lock_lease: Duration::from_secs(30),
            lock_retry_attempts: 200,
            lock_retry_delay: Duration::from_millis(25),
            claim_scan_limit: 100,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("execution.stage_lease", self.stage_lease)?;
        require_positive("execution.lock_lease", self.lock_lease)?;
        if self.claim_scan_limit == 0 {
            return Err(Error::Validation(
                "execution.claim_scan_limit must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// What happens to a still-pending execution when the same ref is pushed again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebouncePolicy {
    /// Keep both executions
    #[default]
    Queue,
    /// Cancel pending executions for the ref created within `window`
    SupersedePending { window: Duration },
}

#[derive(Debug, Clone, Default)]
pub struct TriggerConfig {
    pub debounce: DebouncePolicy,
}

impl TriggerConfig {
    pub fn validate(&self) -> Result<()> {
        if let DebouncePolicy::SupersedePending { window } = self.debounce {
            require_positive("trigger.debounce window", window)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CancelerConfig {
    /// Hard deadline for running stages to acknowledge cancellation
    pub grace: Duration,
    pub check_interval: Duration,
}

impl Default for CancelerConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            check_interval: Duration::from_millis(250),
        }
    }
}

impl CancelerConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("canceler.check_interval", self.check_interval)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Attempts per logical delivery, the first one included
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub timeout: Duration,
    pub allow_loopback: bool,
    pub allow_private_network: bool,
    /// Bytes of response body kept in the delivery record
    pub max_response_body: usize,
    /// How often planned retries and queued deliveries are picked up
    pub retry_interval: Duration,
    /// Open delivery chains looked at per retry pass
    pub retry_batch: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            allow_loopback: false,
            allow_private_network: false,
            max_response_body: 1024,
            retry_interval: Duration::from_secs(1),
            retry_batch: 100,
        }
    }
}

impl WebhookConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("webhook.timeout", self.timeout)?;
        require_positive("webhook.retry_interval", self.retry_interval)?;
        if self.retry_batch == 0 {
            return Err(Error::Validation(
                "webhook.retry_batch must be greater than 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(Error::Validation(
                "webhook.max_attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Intervals and retention windows of the built-in recurring jobs
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub sweep_interval: Duration,
    pub metrics_interval: Duration,
    pub cleanup_interval: Duration,
    pub log_retention: Duration,
    pub webhook_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(15),
            metrics_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            log_retention: Duration::from_secs(30 * 86_400),
            webhook_retention: Duration::from_secs(14 * 86_400),
        }
    }
}

impl MaintenanceConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("maintenance.sweep_interval", self.sweep_interval)?;
        require_positive("maintenance.metrics_interval", self.metrics_interval)?;
        require_positive("maintenance.cleanup_interval", self.cleanup_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.execution.max_reclaims, 3);
        assert_eq!(config.webhook.max_attempts, 3);
        assert_eq!(config.trigger.debounce, DebouncePolicy::Queue);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = OrchestratorConfig::default();

        config.store = StoreKind::Postgres;
        assert!(config.validate().is_err());

        config.database_url = Some("postgres://localhost/gantry".to_string());
        assert!(config.validate().is_ok());

        config.webhook.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_maps_debounce_flag() {
        let cli = Cli::parse_from([
            "gantry-orchestrator",
            "--store",
            "memory",
            "--debounce-seconds",
            "20",
            "--instance-id",
            "node-a",
        ]);
        let config = cli.into_config();

        assert_eq!(config.instance_id, "node-a");
        assert_eq!(
            config.trigger.debounce,
            DebouncePolicy::SupersedePending {
                window: Duration::from_secs(20)
            }
        );
        assert!(config.validate().is_ok());
    }
}
