//! Worker configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use vest_models::QueueName;

/// Queues served when `WORKER_QUEUES` is not set: every queue with a processor.
pub const DEFAULT_QUEUES: [QueueName; 4] = [
    QueueName::Email,
    QueueName::RoiDistribution,
    QueueName::ReportGeneration,
    QueueName::Notification,
];

/// SMTP relay settings.
#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Use STARTTLS; plain connections are only meant for local relays
    pub starttls: bool,
    pub timeout: Duration,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("starttls", &self.starttls)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SmtpConfig {
    /// Read SMTP settings; `None` when `SMTP_HOST` is unset.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok().filter(|h| !h.trim().is_empty())?;
        Some(Self {
            host,
            port: env_parse("SMTP_PORT").unwrap_or(587),
            username: std::env::var("SMTP_USERNAME").ok(),
            password: std::env::var("SMTP_PASSWORD").ok(),
            starttls: env_parse("SMTP_STARTTLS").unwrap_or(true),
            timeout: Duration::from_secs(env_parse("SMTP_TIMEOUT_SECS").unwrap_or(30)),
        })
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent jobs per queue
    pub concurrency: usize,
    /// How long a claimed job stays locked without renewal
    pub lock_duration: Duration,
    /// Interval between lock renewals while a job runs
    pub lock_renew_interval: Duration,
    /// How often to sweep for jobs with expired locks
    pub stalled_interval: Duration,
    /// Stalls tolerated before a job is dead-lettered
    pub max_stalled_count: u32,
    /// Idle wait between claims when the queue is empty
    pub poll_interval: Duration,
    /// How often delayed jobs are promoted
    pub promote_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Random jitter added to retry delays, as a fraction of the delay
    pub backoff_jitter: f64,
    /// Queues this process serves
    pub queues: Vec<QueueName>,
    /// Directory for generated report artifacts
    pub report_output_dir: PathBuf,
    /// Upper bound for collecting and rendering one report
    pub report_timeout: Duration,
    /// JSON file with the properties and investments to load at startup
    pub investments_seed: Option<PathBuf>,
    /// Sender of outgoing email
    pub mail_from: String,
    /// SMTP relay; email is logged instead of sent when absent
    pub smtp: Option<SmtpConfig>,
    /// Prometheus listener address
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lock_duration: Duration::from_secs(30),
            lock_renew_interval: Duration::from_secs(15),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
            poll_interval: Duration::from_millis(1000),
            promote_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
            backoff_jitter: 0.2,
            queues: DEFAULT_QUEUES.to_vec(),
            report_output_dir: PathBuf::from("/tmp/vest/reports"),
            report_timeout: Duration::from_secs(300),
            investments_seed: None,
            mail_from: "Vest <no-reply@vest.local>".to_string(),
            smtp: None,
            metrics_addr: None,
        }
    }
}

/// Available cores, capped at 4.
pub fn default_concurrency() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_queues(raw: &str) -> Vec<QueueName> {
    let mut queues = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match name.parse::<QueueName>() {
            Ok(queue) if !queues.contains(&queue) => queues.push(queue),
            Ok(_) => {}
            Err(e) => tracing::warn!("Ignoring WORKER_QUEUES entry: {}", e),
        }
    }
    queues
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            concurrency: env_parse::<usize>("WORKER_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.concurrency),
            lock_duration: Duration::from_secs(
                env_parse("WORKER_LOCK_DURATION_SECS").unwrap_or(30),
            ),
            lock_renew_interval: Duration::from_secs(
                env_parse("WORKER_LOCK_RENEW_SECS").unwrap_or(15),
            ),
            stalled_interval: Duration::from_secs(
                env_parse("WORKER_STALLED_INTERVAL_SECS").unwrap_or(30),
            ),
            max_stalled_count: env_parse("WORKER_MAX_STALLED_COUNT").unwrap_or(1),
            poll_interval: Duration::from_millis(
                env_parse("WORKER_POLL_INTERVAL_MS").unwrap_or(1000),
            ),
            promote_interval: Duration::from_millis(
                env_parse("WORKER_PROMOTE_INTERVAL_MS").unwrap_or(500),
            ),
            shutdown_timeout: Duration::from_secs(
                env_parse("WORKER_SHUTDOWN_TIMEOUT_SECS").unwrap_or(30),
            ),
            backoff_jitter: env_parse("WORKER_BACKOFF_JITTER").unwrap_or(defaults.backoff_jitter),
            queues: std::env::var("WORKER_QUEUES")
                .map(|raw| parse_queues(&raw))
                .ok()
                .filter(|q| !q.is_empty())
                .unwrap_or(defaults.queues),
            report_output_dir: std::env::var("REPORT_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.report_output_dir),
            report_timeout: Duration::from_secs(env_parse("REPORT_TIMEOUT_SECS").unwrap_or(300)),
            investments_seed: std::env::var("INVESTMENTS_SEED_FILE").ok().map(PathBuf::from),
            mail_from: std::env::var("MAIL_FROM").unwrap_or(defaults.mail_from),
            smtp: SmtpConfig::from_env(),
            metrics_addr: env_parse("WORKER_METRICS_ADDR"),
        }
    }

    /// Whether this process serves `queue`.
    pub fn serves(&self, queue: QueueName) -> bool {
        self.queues.contains(&queue)
    }
}
