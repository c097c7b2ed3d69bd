//! Claim-expiration sweeper.
//!
//! Finds assigned leads whose claim window closed without a claim. A first
//! miss re-routes the lead through the rotator. A repeat miss stops rotation
//! and hands the lead to the fallback owner, or strands it for operators when
//! no owner can be resolved.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::leads::audit;
use crate::leads::model::{ActivityKind, Lead, LeadActivity};
use crate::notify::MessageSender;
use crate::routing::model::Agent;
use crate::routing::{AssignmentRotator, RouteOutcome};
use crate::store::Database;

/// Attempt count recorded once a lead has left rotation.
const MAX_CLAIM_ATTEMPTS: u32 = 2;

/// Totals for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired leads found.
    pub processed: usize,
    /// First misses handed to a new agent.
    pub rerouted: usize,
    /// First misses with nobody eligible to take them.
    pub stranded: usize,
    /// Repeat misses given to the fallback owner.
    pub escalated: usize,
    /// Repeat misses with no fallback owner available.
    pub degraded: usize,
    pub lost_races: usize,
    pub failures: usize,
}

enum Outcome {
    Rerouted,
    Stranded,
    Escalated,
    Degraded,
    LostRace,
}

pub struct ClaimSweeper {
    db: Arc<dyn Database>,
    rotator: Arc<AssignmentRotator>,
    sender: Arc<dyn MessageSender>,
    fallback_owner_email: Option<String>,
}

impl ClaimSweeper {
    pub fn new(
        db: Arc<dyn Database>,
        rotator: Arc<AssignmentRotator>,
        sender: Arc<dyn MessageSender>,
        fallback_owner_email: Option<String>,
    ) -> Self {
        Self {
            db,
            rotator,
            sender,
            fallback_owner_email,
        }
    }

    /// Run one sweep at `now`. Only failing to list expired leads is an error;
    /// per-lead failures are counted and logged.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let expired = self.db.list_expired_claims(now).await?;
        let mut report = SweepReport {
            processed: expired.len(),
            ..Default::default()
        };

        if expired.is_empty() {
            debug!("No expired claims");
            return Ok(report);
        }

        for lead in &expired {
            match self.process(lead, now).await {
                Ok(Outcome::Rerouted) => report.rerouted += 1,
                Ok(Outcome::Stranded) => report.stranded += 1,
                Ok(Outcome::Escalated) => report.escalated += 1,
                Ok(Outcome::Degraded) => report.degraded += 1,
                Ok(Outcome::LostRace) => report.lost_races += 1,
                Err(e) => {
                    error!(lead_id = %lead.id, error = %e, "Failed to process expired claim");
                    report.failures += 1;
                }
            }
        }

        info!(
            processed = report.processed,
            rerouted = report.rerouted,
            stranded = report.stranded,
            escalated = report.escalated,
            degraded = report.degraded,
            lost_races = report.lost_races,
            failures = report.failures,
            "Claim sweep complete"
        );
        Ok(report)
    }

    async fn process(&self, lead: &Lead, now: DateTime<Utc>) -> Result<Outcome> {
        if lead.failed_claim_attempts == 0 {
            self.reroute(lead, now).await
        } else {
            self.escalate(lead, now).await
        }
    }

    async fn reroute(&self, lead: &Lead, now: DateTime<Utc>) -> Result<Outcome> {
        if !self.db.expire_lead(lead.id, 0, 1, now).await? {
            debug!(lead_id = %lead.id, "Lead changed before expiry");
            return Ok(Outcome::LostRace);
        }

        audit::record(
            self.db.as_ref(),
            LeadActivity::new(
                lead.id,
                lead.assigned_agent_id,
                ActivityKind::ClaimMissed,
                "Claim window lapsed",
                now,
            ),
        )
        .await;

        // The lead is no longer `assigned`; later sweeps will not select it again.
        let outcome = match self.rotator.route_lead(lead.id, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.strand(lead.id, "Re-route failed; needs manual assignment", now)
                    .await;
                return Err(e);
            }
        };

        match outcome {
            RouteOutcome::Assigned { agent_id, .. } => {
                info!(lead_id = %lead.id, agent_id = %agent_id, "Expired lead re-routed");
                Ok(Outcome::Rerouted)
            }
            RouteOutcome::NoEligibleAgent => {
                self.strand(lead.id, "No eligible agent to re-route to", now)
                    .await;
                warn!(lead_id = %lead.id, "Expired lead left unassigned, no eligible agent");
                Ok(Outcome::Stranded)
            }
            RouteOutcome::LostRace => Ok(Outcome::LostRace),
        }
    }

    async fn escalate(&self, lead: &Lead, now: DateTime<Utc>) -> Result<Outcome> {
        let attempts = lead.failed_claim_attempts;

        let Some(owner) = self.fallback_owner().await? else {
            if !self
                .db
                .expire_lead(lead.id, attempts, MAX_CLAIM_ATTEMPTS, now)
                .await?
            {
                return Ok(Outcome::LostRace);
            }
            self.strand(lead.id, "Fallback owner unavailable; needs manual assignment", now)
                .await;
            error!(
                lead_id = %lead.id,
                fallback = self.fallback_owner_email.as_deref().unwrap_or("<unset>"),
                "Lead missed repeated claims and no fallback owner could be resolved"
            );
            return Ok(Outcome::Degraded);
        };

        if !self
            .db
            .escalate_lead(lead.id, owner.id, attempts, MAX_CLAIM_ATTEMPTS, now)
            .await?
        {
            debug!(lead_id = %lead.id, "Lead changed before escalation");
            return Ok(Outcome::LostRace);
        }

        audit::record(
            self.db.as_ref(),
            LeadActivity::new(
                lead.id,
                Some(owner.id),
                ActivityKind::Escalated,
                format!("Escalated to {}", owner.email),
                now,
            ),
        )
        .await;
        info!(lead_id = %lead.id, owner_id = %owner.id, "Lead escalated to fallback owner");

        let subject = format!("Lead escalated to you: {}", lead.name);
        let body = format!(
            "{} was not claimed in time by the assigned agents and is now yours.\n\nEmail: {}\nPhone: {}",
            lead.name,
            lead.email.as_deref().unwrap_or("-"),
            lead.phone.as_deref().unwrap_or("-"),
        );
        if let Err(e) = self.sender.send_email(&owner.email, &subject, &body).await {
            warn!(lead_id = %lead.id, error = %e, "Escalation notice not delivered");
        }

        Ok(Outcome::Escalated)
    }

    /// Flag a lead that was left out of rotation for operators.
    async fn strand(&self, lead_id: Uuid, note: &str, now: DateTime<Utc>) {
        audit::record(
            self.db.as_ref(),
            LeadActivity::new(lead_id, None, ActivityKind::Stranded, note, now),
        )
        .await;
    }

    async fn fallback_owner(&self) -> Result<Option<Agent>> {
        match self.fallback_owner_email.as_deref() {
            Some(email) => Ok(self.db.find_agent_by_email(email).await?),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::leads::model::LeadStatus;
    use crate::notify::testing::{RecordingSender, Sent};
    use crate::routing::EligibilityResolver;
    use crate::routing::model::{AgentRanking, Period};
    use crate::store::LibSqlBackend;

    struct Harness {
        store: Arc<LibSqlBackend>,
        db: Arc<dyn Database>,
        sender: Arc<RecordingSender>,
        sweeper: ClaimSweeper,
    }

    async fn harness(eligible: &[Agent], owner: Option<&Agent>, sender: RecordingSender) -> Harness {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let db: Arc<dyn Database> = Arc::clone(&store) as Arc<dyn Database>;
        let now = Utc::now();
        for (i, agent) in eligible.iter().enumerate() {
            db.upsert_agent(agent).await.unwrap();
            db.upsert_ranking(&AgentRanking {
                agent_id: agent.id,
                rank: i as u32 + 1,
                score: 5.0,
                period: Period::of(now),
            })
            .await
            .unwrap();
            db.record_task_completion(agent.id, now).await.unwrap();
        }
        if let Some(owner) = owner {
            db.upsert_agent(owner).await.unwrap();
        }

        let resolver = EligibilityResolver::new(Arc::clone(&db), 3);
        let rotator = Arc::new(AssignmentRotator::new(
            Arc::clone(&db),
            resolver,
            Duration::minutes(30),
        ));
        let sender = Arc::new(sender);
        let sweeper = ClaimSweeper::new(
            Arc::clone(&db),
            rotator,
            Arc::clone(&sender) as Arc<dyn MessageSender>,
            Some("broker@example.com".into()),
        );
        Harness {
            store,
            db,
            sender,
            sweeper,
        }
    }

    /// Insert a lead whose claim window closed ten minutes ago.
    async fn expired_lead(db: &Arc<dyn Database>, agent: Uuid, attempts: u32) -> Lead {
        let now = Utc::now();
        let lead = Lead::new("Casey").with_phone("+15550100");
        db.insert_lead(&lead).await.unwrap();
        db.assign_lead(lead.id, agent, now - Duration::minutes(40), now - Duration::minutes(10))
            .await
            .unwrap();
        if attempts > 0 {
            // Walk the lead through one real miss so the counter reads 1.
            db.expire_lead(lead.id, 0, attempts, now).await.unwrap();
            db.assign_lead(lead.id, agent, now - Duration::minutes(40), now - Duration::minutes(10))
                .await
                .unwrap();
        }
        lead
    }

    #[tokio::test]
    async fn empty_sweep_is_success() {
        let h = harness(&[], None, RecordingSender::default()).await;
        let report = h.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn first_miss_reroutes() {
        let a = Agent::new("A", "a@example.com");
        let b = Agent::new("B", "b@example.com");
        let h = harness(&[a.clone(), b.clone()], None, RecordingSender::default()).await;
        let lead = expired_lead(&h.db, a.id, 0).await;

        let report = h.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.rerouted, 1);

        let stored = h.db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Assigned);
        assert_eq!(stored.failed_claim_attempts, 1);
        assert!(stored.claim_expires_at.unwrap() > Utc::now());

        let kinds: Vec<_> = h
            .db
            .list_activity(lead.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![ActivityKind::ClaimMissed, ActivityKind::Assigned]
        );
    }

    #[tokio::test]
    async fn first_miss_without_agents_is_stranded() {
        let h = harness(&[], None, RecordingSender::default()).await;
        let lead = expired_lead(&h.db, Uuid::new_v4(), 0).await;

        let report = h.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.stranded, 1);

        let stored = h.db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::UnclaimedExpired);
        assert_eq!(stored.failed_claim_attempts, 1);
        assert!(stored.claim_expires_at.is_none());
    }

    #[tokio::test]
    async fn repeat_miss_escalates_to_owner() {
        let a = Agent::new("A", "a@example.com");
        let owner = Agent::new("Broker", "broker@example.com").with_tier(2);
        let h = harness(&[a.clone()], Some(&owner), RecordingSender::default()).await;
        let lead = expired_lead(&h.db, a.id, 1).await;

        let report = h.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.escalated, 1);
        assert_eq!(report.rerouted, 0);

        let stored = h.db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Claimed);
        assert_eq!(stored.assigned_agent_id, Some(owner.id));
        assert_eq!(stored.failed_claim_attempts, 2);
        assert!(stored.claimed_at.is_some());
        assert!(stored.claim_expires_at.is_none());

        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Sent::Email { to, .. } if to == "broker@example.com"));
    }

    #[tokio::test]
    async fn escalation_survives_failed_notice() {
        let a = Agent::new("A", "a@example.com");
        let owner = Agent::new("Broker", "broker@example.com");
        let h = harness(&[a.clone()], Some(&owner), RecordingSender::failing()).await;
        let lead = expired_lead(&h.db, a.id, 1).await;

        let report = h.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.escalated, 1);
        let stored = h.db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Claimed);
    }

    #[tokio::test]
    async fn repeat_miss_without_owner_degrades() {
        let a = Agent::new("A", "a@example.com");
        let h = harness(&[a.clone()], None, RecordingSender::default()).await;
        let lead = expired_lead(&h.db, a.id, 1).await;

        let report = h.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.degraded, 1);

        let stored = h.db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::UnclaimedExpired);
        assert_eq!(stored.failed_claim_attempts, 2);
        let activity = h.db.list_activity(lead.id).await.unwrap();
        assert_eq!(activity.last().unwrap().kind, ActivityKind::Stranded);

        // Nothing left to sweep.
        let again = h.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(again.processed, 0);
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let a = Agent::new("A", "a@example.com");
        let h = harness(&[a.clone()], None, RecordingSender::default()).await;
        expired_lead(&h.db, a.id, 0).await;

        let now = Utc::now();
        let first = h.sweeper.sweep(now).await.unwrap();
        let second = h.sweeper.sweep(now).await.unwrap();
        assert_eq!(first.rerouted, 1);
        assert_eq!(second.processed, 0);
    }

    #[tokio::test]
    async fn claim_after_sweep_is_rejected() {
        let a = Agent::new("A", "a@example.com");
        let h = harness(&[], None, RecordingSender::default()).await;
        let lead = expired_lead(&h.db, a.id, 0).await;

        h.sweeper.sweep(Utc::now()).await.unwrap();
        let claimed = h.db.claim_lead(lead.id, a.id, Utc::now()).await.unwrap();
        assert!(!claimed);
    }

    #[tokio::test]
    async fn first_miss_reroutes_when_audit_trail_is_unavailable() {
        let a = Agent::new("A", "a@example.com");
        let b = Agent::new("B", "b@example.com");
        let h = harness(&[a.clone(), b.clone()], None, RecordingSender::default()).await;
        let lead = expired_lead(&h.db, a.id, 0).await;
        h.store.execute_raw("DROP TABLE lead_activities").await.unwrap();

        let report = h.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.rerouted, 1);
        assert_eq!(report.failures, 0);

        let stored = h.db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Assigned);
        assert_eq!(stored.failed_claim_attempts, 1);
        assert!(stored.assigned_agent_id.is_some());
        assert!(stored.claim_expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn repeat_miss_escalates_when_audit_trail_is_unavailable() {
        let a = Agent::new("A", "a@example.com");
        let owner = Agent::new("Broker", "broker@example.com").with_tier(2);
        let h = harness(&[a.clone()], Some(&owner), RecordingSender::default()).await;
        let lead = expired_lead(&h.db, a.id, 1).await;
        h.store.execute_raw("DROP TABLE lead_activities").await.unwrap();

        let report = h.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.escalated, 1);
        assert_eq!(report.failures, 0);

        let stored = h.db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Claimed);
        assert_eq!(stored.assigned_agent_id, Some(owner.id));
        assert_eq!(h.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_reroute_strands_the_lead() {
        let a = Agent::new("A", "a@example.com");
        let h = harness(&[a.clone()], None, RecordingSender::default()).await;
        let lead = expired_lead(&h.db, a.id, 0).await;
        h.store.execute_raw("DROP TABLE assignment_cursor").await.unwrap();

        let report = h.sweeper.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failures, 1);

        let stored = h.db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::UnclaimedExpired);
        let kinds: Vec<_> = h
            .db
            .list_activity(lead.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.kind)
            .collect();
        assert_eq!(kinds, vec![ActivityKind::ClaimMissed, ActivityKind::Stranded]);
    }
}
