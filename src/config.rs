//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::Duration;

use crate::campaigns::SchedulerConfig;
use crate::campaigns::scheduler::DEFAULT_BATCH_SIZE;
use crate::error::ConfigError;
use crate::routing::eligibility::DEFAULT_ACTIVITY_WINDOW_DAYS;
use crate::routing::rotator::DEFAULT_CLAIM_WINDOW_MINUTES;

/// Router configuration, built from `LEAD_ROUTER_*` environment variables.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    pub claim_window: Duration,
    pub activity_window_days: u32,
    /// Lookup key for the escalation owner. Unset means repeat misses are stranded.
    pub fallback_owner_email: Option<String>,
    pub claim_sweep_cron: String,
    pub campaign_cron: String,
    pub campaign_batch_size: usize,
    pub max_stalled_attempts: Option<u32>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/lead-router.db"),
            http_port: 8080,
            claim_window: Duration::minutes(DEFAULT_CLAIM_WINDOW_MINUTES),
            activity_window_days: DEFAULT_ACTIVITY_WINDOW_DAYS,
            fallback_owner_email: None,
            claim_sweep_cron: "0 */5 * * * *".to_string(),
            campaign_cron: "0 */10 * * * *".to_string(),
            campaign_batch_size: DEFAULT_BATCH_SIZE,
            max_stalled_attempts: None,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or empty keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let claim_window_min: i64 = parse_or(
            "LEAD_ROUTER_CLAIM_WINDOW_MIN",
            get("LEAD_ROUTER_CLAIM_WINDOW_MIN"),
            DEFAULT_CLAIM_WINDOW_MINUTES,
        )?;
        if claim_window_min <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_ROUTER_CLAIM_WINDOW_MIN".into(),
                message: "must be positive".into(),
            });
        }

        let campaign_batch_size: usize = parse_or(
            "LEAD_ROUTER_CAMPAIGN_BATCH",
            get("LEAD_ROUTER_CAMPAIGN_BATCH"),
            defaults.campaign_batch_size,
        )?;
        if campaign_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_ROUTER_CAMPAIGN_BATCH".into(),
                message: "must be at least 1".into(),
            });
        }

        let max_stalled_attempts = match get("LEAD_ROUTER_MAX_STALLED_ATTEMPTS") {
            Some(raw) => Some(parse_value::<u32>("LEAD_ROUTER_MAX_STALLED_ATTEMPTS", &raw)?),
            None => None,
        };

        let claim_sweep_cron = get("LEAD_ROUTER_CLAIM_SWEEP_CRON").unwrap_or(defaults.claim_sweep_cron);
        validate_cron("LEAD_ROUTER_CLAIM_SWEEP_CRON", &claim_sweep_cron)?;
        let campaign_cron = get("LEAD_ROUTER_CAMPAIGN_CRON").unwrap_or(defaults.campaign_cron);
        validate_cron("LEAD_ROUTER_CAMPAIGN_CRON", &campaign_cron)?;

        Ok(Self {
            db_path: get("LEAD_ROUTER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http_port: parse_or(
                "LEAD_ROUTER_HTTP_PORT",
                get("LEAD_ROUTER_HTTP_PORT"),
                defaults.http_port,
            )?,
            claim_window: Duration::minutes(claim_window_min),
            activity_window_days: parse_or(
                "LEAD_ROUTER_ACTIVITY_WINDOW_DAYS",
                get("LEAD_ROUTER_ACTIVITY_WINDOW_DAYS"),
                defaults.activity_window_days,
            )?,
            fallback_owner_email: get("LEAD_ROUTER_FALLBACK_OWNER_EMAIL"),
            claim_sweep_cron,
            campaign_cron,
            campaign_batch_size,
            max_stalled_attempts,
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            batch_size: self.campaign_batch_size,
            max_stalled_attempts: self.max_stalled_attempts,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn validate_cron(key: &str, expr: &str) -> Result<(), ConfigError> {
    crate::schedule::parse_schedule(key, expr).map(|_| ())
}
