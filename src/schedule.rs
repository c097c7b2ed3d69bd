//! Cron-driven periodic jobs.
//!
//! Each job runs in its own tokio task: sleep until the next cron fire, run
//! one tick to completion, repeat. A slow tick delays the next one instead of
//! overlapping it.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::campaigns::CampaignScheduler;
use crate::error::ConfigError;
use crate::leads::ClaimSweeper;

/// A unit of periodic work.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one tick. Errors are the job's own to log.
    async fn run(&self, now: DateTime<Utc>);
}

#[async_trait]
impl ScheduledJob for ClaimSweeper {
    fn name(&self) -> &'static str {
        "claim_sweep"
    }

    async fn run(&self, now: DateTime<Utc>) {
        if let Err(e) = self.sweep(now).await {
            error!(error = %e, "Claim sweep failed");
        }
    }
}

#[async_trait]
impl ScheduledJob for CampaignScheduler {
    fn name(&self) -> &'static str {
        "campaign_tick"
    }

    async fn run(&self, now: DateTime<Utc>) {
        if let Err(e) = self.tick(now).await {
            error!(error = %e, "Campaign tick failed");
        }
    }
}

/// Parse a cron expression read from the config key `key`.
pub fn parse_schedule(key: &str, expr: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("invalid cron {expr:?}: {e}"),
    })
}

/// Next fire time of `schedule` strictly after `after`.
pub fn next_fire(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Spawn a background task that runs `job` on every fire of `schedule`.
pub fn spawn_cron_ticker(job: Arc<dyn ScheduledJob>, schedule: cron::Schedule) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(job = job.name(), "Cron ticker started");
        loop {
            let now = Utc::now();
            let Some(fire) = next_fire(&schedule, now) else {
                warn!(job = job.name(), "Schedule has no future fire times, stopping");
                return;
            };
            let wait = (fire - now).to_std().unwrap_or_default();
            debug!(job = job.name(), next = %fire, "Sleeping until next fire");
            tokio::time::sleep(wait).await;

            job.run(Utc::now()).await;
        }
    })
}
