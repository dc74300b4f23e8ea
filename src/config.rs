use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ExamSaveError, Result};

/// Tunables for the whole pipeline. Built once at startup and handed to each
/// component's constructor.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// File holding the serialized pending-write map.
    pub queue_file: PathBuf,
    /// Quiet period after the last edit of a question before it is saved.
    pub debounce_delay: Duration,
    /// Interval of the periodic batch flush.
    pub flush_interval: Duration,
    /// Failed attempts tolerated before an answer is dropped and reported.
    pub max_retry_attempts: u32,
    /// Maximum entries drained per flush.
    pub batch_size: usize,
    /// Interval between health probes.
    pub probe_interval: Duration,
    /// Upper bound on a single health probe.
    pub probe_timeout: Duration,
    /// Wait after a recovery flush before counting what is left.
    pub settle_delay: Duration,
    /// How long shutdown waits for in-flight work before aborting it.
    pub shutdown_timeout: Duration,
    /// Upper bound on a single submission request.
    pub request_timeout: Duration,
    /// Identifies this install in dropped-answer reports.
    pub client_id: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_file: PathBuf::from("./exam_answer_queue.json"),
            debounce_delay: Duration::from_secs(3),
            flush_interval: Duration::from_secs(30),
            max_retry_attempts: 3,
            batch_size: 10,
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            client_id: default_client_id(),
        }
    }
}

impl PipelineConfig {
    /// Load config from `EXAMSAVE_*` environment variables, falling back to
    /// the defaults. Durations are read in milliseconds.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            queue_file: std::env::var("EXAMSAVE_QUEUE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.queue_file),
            debounce_delay: env_millis("EXAMSAVE_DEBOUNCE_MS").unwrap_or(defaults.debounce_delay),
            flush_interval: env_millis("EXAMSAVE_FLUSH_INTERVAL_MS")
                .unwrap_or(defaults.flush_interval),
            max_retry_attempts: std::env::var("EXAMSAVE_MAX_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retry_attempts),
            batch_size: std::env::var("EXAMSAVE_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            probe_interval: env_millis("EXAMSAVE_PROBE_INTERVAL_MS")
                .unwrap_or(defaults.probe_interval),
            probe_timeout: env_millis("EXAMSAVE_PROBE_TIMEOUT_MS").unwrap_or(defaults.probe_timeout),
            settle_delay: env_millis("EXAMSAVE_SETTLE_DELAY_MS").unwrap_or(defaults.settle_delay),
            shutdown_timeout: env_millis("EXAMSAVE_SHUTDOWN_TIMEOUT_MS")
                .unwrap_or(defaults.shutdown_timeout),
            request_timeout: env_millis("EXAMSAVE_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout),
            client_id: std::env::var("EXAMSAVE_CLIENT_ID").unwrap_or(defaults.client_id),
        }
    }

    /// Reject values that would stall or spin the background workers.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ExamSaveError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(ExamSaveError::Config(
                "flush_interval must be non-zero".to_string(),
            ));
        }
        if self.probe_interval.is_zero() || self.probe_timeout.is_zero() {
            return Err(ExamSaveError::Config(
                "probe_interval and probe_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn default_client_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
