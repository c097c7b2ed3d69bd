//! Audit trail writes that follow a committed lead transition.

use tracing::warn;

use crate::leads::model::LeadActivity;
use crate::store::Database;

/// Append `activity` to the lead's audit trail.
///
/// The status change it describes has already landed, so a failed write is
/// logged and dropped instead of aborting the caller half-way.
pub async fn record(db: &dyn Database, activity: LeadActivity) {
    if let Err(e) = db.record_activity(&activity).await {
        warn!(
            lead_id = %activity.lead_id,
            kind = activity.kind.as_str(),
            error = %e,
            "Failed to record lead activity"
        );
    }
}
