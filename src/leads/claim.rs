//! The agent-facing claim action.

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ClaimError;
use crate::leads::audit;
use crate::leads::model::{ActivityKind, Lead, LeadActivity, LeadStatus};
use crate::store::Database;

/// Accept an assigned lead on behalf of `agent_id`.
///
/// The write is attempted first; only when it does not land is the lead
/// re-read to explain why.
pub async fn claim_lead(
    db: &dyn Database,
    lead_id: Uuid,
    agent_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Lead, ClaimError> {
    if !db.claim_lead(lead_id, agent_id, now).await? {
        let lead = db.get_lead(lead_id).await?;
        let err = rejection(lead.as_ref(), lead_id, agent_id, now);
        debug!(lead_id = %lead_id, agent_id = %agent_id, reason = %err, "Claim rejected");
        return Err(err);
    }

    audit::record(
        db,
        LeadActivity::new(
            lead_id,
            Some(agent_id),
            ActivityKind::Claimed,
            "Claimed by assigned agent",
            now,
        ),
    )
    .await;

    info!(lead_id = %lead_id, agent_id = %agent_id, "Lead claimed");

    db.get_lead(lead_id).await?.ok_or(ClaimError::NotFound(lead_id))
}

/// Why a claim on `lead` did not apply.
fn rejection(lead: Option<&Lead>, lead_id: Uuid, agent_id: Uuid, now: DateTime<Utc>) -> ClaimError {
    let Some(lead) = lead else {
        return ClaimError::NotFound(lead_id);
    };
    if lead.status != LeadStatus::Assigned {
        return ClaimError::NotAssigned {
            lead_id,
            status: lead.status,
        };
    }
    if lead.assigned_agent_id != Some(agent_id) {
        return ClaimError::WrongAgent { lead_id };
    }
    if !lead.claim_window_open(now) {
        return ClaimError::WindowExpired { lead_id };
    }
    ClaimError::LostRace { lead_id }
}
