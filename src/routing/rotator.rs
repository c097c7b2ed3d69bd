//! Assignment rotator — round-robin over the ranked eligible list.
//!
//! The cursor remembers the last rank handed a lead this month. The next pick
//! is the first eligible agent ranked strictly after it, wrapping to the top
//! when the end of the list is reached.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, Result};
use crate::leads::audit;
use crate::leads::model::{ActivityKind, LeadActivity, LeadTransition};
use crate::routing::eligibility::EligibilityResolver;
use crate::routing::model::{AssignmentCursor, Period, RankedAgent};
use crate::store::Database;

/// Default claim window in minutes.
pub const DEFAULT_CLAIM_WINDOW_MINUTES: i64 = 30;

/// Result of routing a single lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouteOutcome {
    Assigned {
        agent_id: Uuid,
        claim_expires_at: DateTime<Utc>,
    },
    /// Nobody eligible. The lead was not touched.
    NoEligibleAgent,
    /// The lead moved out of a routable state before the write landed.
    LostRace,
}

pub struct AssignmentRotator {
    db: Arc<dyn Database>,
    resolver: EligibilityResolver,
    claim_window: Duration,
}

impl AssignmentRotator {
    pub fn new(db: Arc<dyn Database>, resolver: EligibilityResolver, claim_window: Duration) -> Self {
        Self {
            db,
            resolver,
            claim_window,
        }
    }

    /// Advance the cursor and return the next agent, or `None` if nobody is eligible.
    pub async fn pick_next_agent(&self, now: DateTime<Utc>) -> Result<Option<RankedAgent>> {
        let period = Period::of(now);
        let cursor = self.current_cursor(period).await?;

        let ranked = self.resolver.resolve(now).await?;
        let Some(picked) = select_next(&ranked, cursor.last_rank_assigned) else {
            debug!(period = %period, "No eligible agent for rotation");
            return Ok(None);
        };

        // Losing this write only skews fairness for one pick.
        if !self.db.store_cursor(cursor.version, period, picked.rank).await? {
            debug!(rank = picked.rank, "Cursor moved concurrently, keeping pick");
        }

        Ok(Some(picked))
    }

    /// Pick an agent and assign `lead_id` to it with a fresh claim window.
    pub async fn route_lead(&self, lead_id: Uuid, now: DateTime<Utc>) -> Result<RouteOutcome> {
        let lead = self
            .db
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "lead".into(),
                id: lead_id.to_string(),
            })?;

        if lead.status.apply(LeadTransition::Assign).is_err() {
            debug!(lead_id = %lead_id, status = %lead.status, "Lead not routable");
            return Ok(RouteOutcome::LostRace);
        }

        let Some(picked) = self.pick_next_agent(now).await? else {
            return Ok(RouteOutcome::NoEligibleAgent);
        };

        let claim_expires_at = now + self.claim_window;
        if !self
            .db
            .assign_lead(lead_id, picked.agent_id, now, claim_expires_at)
            .await?
        {
            debug!(lead_id = %lead_id, "Lead changed before assignment");
            return Ok(RouteOutcome::LostRace);
        }

        audit::record(
            self.db.as_ref(),
            LeadActivity::new(
                lead_id,
                Some(picked.agent_id),
                ActivityKind::Assigned,
                format!("Assigned to rank {} agent", picked.rank),
                now,
            ),
        )
        .await;

        info!(
            lead_id = %lead_id,
            agent_id = %picked.agent_id,
            rank = picked.rank,
            claim_expires_at = %claim_expires_at,
            "Lead assigned"
        );

        Ok(RouteOutcome::Assigned {
            agent_id: picked.agent_id,
            claim_expires_at,
        })
    }

    /// Load the cursor, creating it and rolling it into `period` as needed.
    async fn current_cursor(&self, period: Period) -> Result<AssignmentCursor> {
        self.db.init_cursor(period).await?;
        let cursor = self.load().await?;
        if cursor.period == period {
            return Ok(cursor);
        }

        if self.db.store_cursor(cursor.version, period, 0).await? {
            info!(from = %cursor.period, to = %period, "Rotation cursor reset for new period");
        }
        // Either we reset it or someone else did; re-read what landed.
        let cursor = self.load().await?;
        if cursor.period == period {
            Ok(cursor)
        } else {
            Ok(AssignmentCursor {
                period,
                last_rank_assigned: 0,
                version: cursor.version,
            })
        }
    }

    async fn load(&self) -> Result<AssignmentCursor> {
        Ok(self
            .db
            .load_cursor()
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "assignment_cursor".into(),
                id: "1".into(),
            })?)
    }
}

/// First entry ranked after `last_rank`, wrapping to the head of the list.
pub fn select_next(ranked: &[RankedAgent], last_rank: u32) -> Option<RankedAgent> {
    ranked
        .iter()
        .find(|r| r.rank > last_rank)
        .or_else(|| ranked.first())
        .copied()
}
