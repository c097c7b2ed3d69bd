//! Enrolling leads into campaigns, and pausing / resuming them.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::campaigns::model::{CampaignEnrollment, EnrollmentStatus};
use crate::error::{DatabaseError, Result};
use crate::store::Database;

/// Enroll `lead_id` in `campaign_id`. Re-enrolling returns the existing enrollment.
///
/// The first step becomes due `delay_hours` after `now`. A campaign without
/// steps yields an enrollment that is already completed.
pub async fn enroll(
    db: &dyn Database,
    campaign_id: Uuid,
    lead_id: Uuid,
    now: DateTime<Utc>,
) -> Result<CampaignEnrollment> {
    if db.get_campaign(campaign_id).await?.is_none() {
        return Err(DatabaseError::NotFound {
            entity: "campaign".into(),
            id: campaign_id.to_string(),
        }
        .into());
    }
    if db.get_lead(lead_id).await?.is_none() {
        return Err(DatabaseError::NotFound {
            entity: "lead".into(),
            id: lead_id.to_string(),
        }
        .into());
    }

    let (status, next_run_at) = match db.get_step(campaign_id, 1).await? {
        Some(first) => (
            EnrollmentStatus::Active,
            Some(now + Duration::hours(first.delay_hours as i64)),
        ),
        None => (EnrollmentStatus::Completed, None),
    };

    let enrollment = CampaignEnrollment {
        id: Uuid::new_v4(),
        campaign_id,
        lead_id,
        current_step: 0,
        status,
        next_run_at,
        stalled_attempts: 0,
        created_at: now,
        updated_at: now,
    };

    if db.insert_enrollment(&enrollment).await? {
        info!(
            enrollment_id = %enrollment.id,
            campaign_id = %campaign_id,
            lead_id = %lead_id,
            status = %enrollment.status,
            "Lead enrolled in campaign"
        );
        return Ok(enrollment);
    }

    debug!(campaign_id = %campaign_id, lead_id = %lead_id, "Lead already enrolled");
    db.find_enrollment(campaign_id, lead_id)
        .await?
        .ok_or_else(|| {
            DatabaseError::NotFound {
                entity: "campaign_enrollment".into(),
                id: format!("{campaign_id}/{lead_id}"),
            }
            .into()
        })
}

/// `active → paused`. Returns false if the enrollment was not active.
pub async fn pause(db: &dyn Database, enrollment_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
    let paused = db.pause_enrollment(enrollment_id, now).await?;
    if paused {
        info!(enrollment_id = %enrollment_id, "Enrollment paused");
    } else {
        debug!(enrollment_id = %enrollment_id, "Enrollment not active, pause skipped");
    }
    Ok(paused)
}

/// `paused → active`, due immediately. Returns false if the enrollment was not paused.
pub async fn resume(db: &dyn Database, enrollment_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
    let resumed = db.resume_enrollment(enrollment_id, now).await?;
    if resumed {
        info!(enrollment_id = %enrollment_id, "Enrollment resumed");
    } else {
        debug!(enrollment_id = %enrollment_id, "Enrollment not paused, resume skipped");
    }
    Ok(resumed)
}
