//! Eligibility & ranking resolver.
//!
//! An agent may receive a new lead when it is active and tier 1, holds a
//! positive-score rank for the current month, and completed at least one
//! gamified task inside the trailing activity window.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::routing::model::{Agent, AgentRanking, Period, RankedAgent};
use crate::store::Database;

/// Default trailing activity window in days.
pub const DEFAULT_ACTIVITY_WINDOW_DAYS: u32 = 3;

/// Resolves the ranked list of agents eligible for a new lead.
pub struct EligibilityResolver {
    db: Arc<dyn Database>,
    activity_window_days: u32,
}

impl EligibilityResolver {
    pub fn new(db: Arc<dyn Database>, activity_window_days: u32) -> Self {
        Self {
            db,
            activity_window_days,
        }
    }

    /// Eligible agents at `now`, best rank first. Empty means nobody is eligible.
    pub async fn resolve(&self, now: DateTime<Utc>) -> Result<Vec<RankedAgent>, DatabaseError> {
        let period = Period::of(now);
        let agents = self.db.list_rotating_agents().await?;
        let rankings = self.db.rankings_for_period(period).await?;
        let since = activity_cutoff(now, self.activity_window_days);
        let active: HashSet<Uuid> = self.db.agents_active_since(since).await?.into_iter().collect();

        let eligible = resolve_eligible(&agents, &rankings, &active);
        debug!(
            period = %period,
            candidates = agents.len(),
            eligible = eligible.len(),
            "Resolved eligible agents"
        );
        Ok(eligible)
    }
}

/// Start of the UTC day `days` before `now`.
pub fn activity_cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    (now - Duration::days(days as i64))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|ndt| ndt.and_utc())
        .unwrap_or(now)
}

/// Intersect agents, rankings and recent activity, sorted by rank.
pub fn resolve_eligible(
    agents: &[Agent],
    rankings: &[AgentRanking],
    active: &HashSet<Uuid>,
) -> Vec<RankedAgent> {
    let rotating: HashSet<Uuid> = agents.iter().filter(|a| a.rotates()).map(|a| a.id).collect();

    let mut ranked: Vec<RankedAgent> = rankings
        .iter()
        .filter(|r| r.score > 0.0)
        .filter(|r| rotating.contains(&r.agent_id) && active.contains(&r.agent_id))
        .map(|r| RankedAgent {
            agent_id: r.agent_id,
            rank: r.rank,
        })
        .collect();

    // Ties on rank are an aggregator bug; agent id keeps the order stable anyway.
    ranked.sort_by(|a, b| a.rank.cmp(&b.rank).then(a.agent_id.cmp(&b.agent_id)));
    ranked
}
