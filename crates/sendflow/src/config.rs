use std::time::Duration;

use crate::assign::SchedulerConfig;
use crate::queue::backoff::BackoffSchedule;
use crate::queue::error_codes::ErrorClassifier;
use crate::queue::processor::ProcessorConfig;

pub const DEFAULT_PROVIDER_BASE_URL: &str = "https://graph.facebook.com/v19.0";

// Config is the one place runtime settings are read from the environment.
// Everything downstream receives typed values.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,

    pub queue_batch_size: i64,
    pub max_retries: i32,
    pub backoff_secs: Vec<i64>,
    pub stale_processing_secs: i64,

    pub provider_base_url: String,
    pub provider_timeout_secs: u64,
    pub rate_limit_codes: Vec<String>,
    pub permanent_template_codes: Vec<String>,

    pub db_timeout_secs: u64,
    pub assign_chunk_size: i64,
    pub assign_lock_key: i64,
    pub max_failure_details: usize,

    pub queue_interval_ms: u64,
    pub assign_interval_ms: u64,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("SENDFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "sendflow-1".to_string());

        let queue_batch_size = env_parse("SENDFLOW_QUEUE_BATCH_SIZE")
            .unwrap_or(20_i64)
            .clamp(1, 500);

        let max_retries = env_parse("SENDFLOW_MAX_RETRIES").unwrap_or(3_i32).max(0);

        let backoff_secs = match env_or_fallback("SENDFLOW_BACKOFF_SECS", "BACKOFF_SECS") {
            Some(raw) => parse_backoff(&raw)?,
            None => BackoffSchedule::default().table_secs().to_vec(),
        };

        let provider_base_url = env_or_fallback("SENDFLOW_PROVIDER_BASE_URL", "WHATSAPP_API_URL")
            .unwrap_or_else(|| DEFAULT_PROVIDER_BASE_URL.to_string());

        let provider_timeout_secs = env_parse("SENDFLOW_PROVIDER_TIMEOUT_SECS")
            .unwrap_or(25_u64)
            .clamp(1, 300);

        let stale_processing_secs = effective_stale_secs(
            env_parse("SENDFLOW_STALE_PROCESSING_SECS").unwrap_or(600_i64),
            provider_timeout_secs,
            queue_batch_size,
        );

        let defaults = ErrorClassifier::default();
        let rate_limit_codes = env_list("SENDFLOW_RATE_LIMIT_CODES")
            .unwrap_or_else(|| defaults.rate_limit_codes().to_vec());
        let permanent_template_codes = env_list("SENDFLOW_PERMANENT_TEMPLATE_CODES")
            .unwrap_or_else(|| defaults.permanent_codes().to_vec());

        let db_timeout_secs = env_parse("SENDFLOW_DB_TIMEOUT_SECS")
            .unwrap_or(25_u64)
            .clamp(1, 300);

        let assign_chunk_size = env_parse("SENDFLOW_ASSIGN_CHUNK_SIZE")
            .unwrap_or(200_i64)
            .clamp(1, 5_000);

        let assign_lock_key =
            env_parse("SENDFLOW_ASSIGN_LOCK_KEY").unwrap_or(crate::assign::DEFAULT_LOCK_KEY);

        let max_failure_details = env_parse("SENDFLOW_MAX_FAILURE_DETAILS").unwrap_or(1_000_usize);

        let queue_interval_ms = env_parse("SENDFLOW_QUEUE_INTERVAL_MS").unwrap_or(5_000_u64);
        let assign_interval_ms = env_parse("SENDFLOW_ASSIGN_INTERVAL_MS").unwrap_or(30_000_u64);

        let admin_addr = env_or_fallback("SENDFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("SENDFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        Ok(Self {
            database_url,
            worker_id,
            queue_batch_size,
            max_retries,
            backoff_secs,
            stale_processing_secs,
            provider_base_url,
            provider_timeout_secs,
            rate_limit_codes,
            permanent_template_codes,
            db_timeout_secs,
            assign_chunk_size,
            assign_lock_key,
            max_failure_details,
            queue_interval_ms,
            assign_interval_ms,
            admin_addr,
            migrate_on_startup,
        })
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            batch_size: self.queue_batch_size,
            max_retries: self.max_retries,
            backoff: BackoffSchedule::new(self.backoff_secs.clone()),
            classifier: ErrorClassifier::new(
                self.rate_limit_codes.clone(),
                self.permanent_template_codes.clone(),
            ),
            delivery_timeout: Duration::from_secs(self.provider_timeout_secs),
            stale_processing_after: chrono::Duration::seconds(self.stale_processing_secs),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            actor_id: self.worker_id.clone(),
            chunk_size: self.assign_chunk_size,
            lock_key: self.assign_lock_key,
            max_failure_details: self.max_failure_details,
            db_timeout: Duration::from_secs(self.db_timeout_secs),
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items = split_list(&raw);
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_backoff(raw: &str) -> anyhow::Result<Vec<i64>> {
    let table = split_list(raw)
        .iter()
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| anyhow::anyhow!("SENDFLOW_BACKOFF_SECS: `{s}` is not a number"))
        })
        .collect::<anyhow::Result<Vec<i64>>>()?;

    if table.is_empty() {
        anyhow::bail!("SENDFLOW_BACKOFF_SECS must list at least one delay");
    }
    // the schedule must never shrink between attempts
    if table.windows(2).any(|w| w[1] < w[0]) || table[0] < 0 {
        anyhow::bail!("SENDFLOW_BACKOFF_SECS must be non-negative and non-decreasing");
    }
    Ok(table)
}

/// A live run can keep items in `processing` for up to one provider timeout
/// per item in its batch; reclaiming sooner would race that run.
fn effective_stale_secs(requested: i64, provider_timeout_secs: u64, batch_size: i64) -> i64 {
    let floor = provider_timeout_secs as i64 * batch_size.max(1);
    requested.max(floor)
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
