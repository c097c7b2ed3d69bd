//! Unified `Database` trait — single async interface for all persistence.
//!
//! Every method that changes a lead's or enrollment's status is a conditional
//! write: it returns `Ok(false)` when the guard no longer holds (someone else
//! already moved the row), never a read-then-write pair.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::campaigns::model::{
    Advance, Campaign, CampaignEnrollment, CampaignLog, CampaignStep, FollowUpTask,
};
use crate::error::DatabaseError;
use crate::leads::model::{Lead, LeadActivity};
use crate::routing::model::{Agent, AgentRanking, AssignmentCursor, Period};

/// Backend-agnostic database trait covering agents, leads, and campaigns.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Agents & rankings ───────────────────────────────────────────

    /// Insert or replace an agent record.
    async fn upsert_agent(&self, agent: &Agent) -> Result<(), DatabaseError>;

    /// Directory lookup used to resolve the fallback owner.
    async fn find_agent_by_email(&self, email: &str) -> Result<Option<Agent>, DatabaseError>;

    /// Active tier-1 agents.
    async fn list_rotating_agents(&self) -> Result<Vec<Agent>, DatabaseError>;

    /// Record a completed gamified task for an agent.
    async fn record_task_completion(
        &self,
        agent_id: Uuid,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Agents with at least one completed gamified task at or after `since`.
    async fn agents_active_since(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>, DatabaseError>;

    /// Insert or replace one agent's ranking for a period.
    async fn upsert_ranking(&self, ranking: &AgentRanking) -> Result<(), DatabaseError>;

    /// Rankings for a period. Rows with a NULL rank are omitted.
    async fn rankings_for_period(&self, period: Period) -> Result<Vec<AgentRanking>, DatabaseError>;

    // ── Rotation cursor ─────────────────────────────────────────────

    async fn load_cursor(&self) -> Result<Option<AssignmentCursor>, DatabaseError>;

    /// Create the cursor row for `period` if it doesn't exist yet.
    async fn init_cursor(&self, period: Period) -> Result<(), DatabaseError>;

    /// Write the cursor if its version is still `expected_version`.
    async fn store_cursor(
        &self,
        expected_version: i64,
        period: Period,
        last_rank_assigned: u32,
    ) -> Result<bool, DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// `new | unclaimed_expired → assigned`.
    async fn assign_lead(
        &self,
        id: Uuid,
        agent_id: Uuid,
        now: DateTime<Utc>,
        claim_expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `assigned → claimed` by the assigned agent while the window is open.
    async fn claim_lead(
        &self,
        id: Uuid,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `assigned → unclaimed_expired` once the window lapsed, if the attempt
    /// counter still reads `expected_attempts`.
    async fn expire_lead(
        &self,
        id: Uuid,
        expected_attempts: u32,
        new_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `assigned → claimed` by the fallback owner once the window lapsed.
    async fn escalate_lead(
        &self,
        id: Uuid,
        owner_id: Uuid,
        expected_attempts: u32,
        new_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Assigned, unclaimed leads whose window closed at or before `now`.
    async fn list_expired_claims(&self, now: DateTime<Utc>) -> Result<Vec<Lead>, DatabaseError>;

    async fn record_activity(&self, activity: &LeadActivity) -> Result<(), DatabaseError>;

    /// Audit trail for a lead, oldest first.
    async fn list_activity(&self, lead_id: Uuid) -> Result<Vec<LeadActivity>, DatabaseError>;

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError>;

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError>;

    async fn insert_step(&self, step: &CampaignStep) -> Result<(), DatabaseError>;

    async fn get_step(
        &self,
        campaign_id: Uuid,
        step_number: u32,
    ) -> Result<Option<CampaignStep>, DatabaseError>;

    /// Insert an enrollment. Returns false if the lead is already enrolled in the campaign.
    async fn insert_enrollment(&self, enrollment: &CampaignEnrollment)
    -> Result<bool, DatabaseError>;

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<CampaignEnrollment>, DatabaseError>;

    async fn find_enrollment(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<CampaignEnrollment>, DatabaseError>;

    /// Active enrollments with `next_run_at <= now`, earliest first, at most `limit`.
    async fn list_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CampaignEnrollment>, DatabaseError>;

    /// Move an active enrollment still at `expected_step` to `advance`.
    async fn advance_enrollment(
        &self,
        id: Uuid,
        expected_step: u32,
        advance: &Advance,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Bump the stall counter of an active enrollment still at `expected_step`.
    async fn record_enrollment_stall(
        &self,
        id: Uuid,
        expected_step: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `active → paused`, clearing `next_run_at`.
    async fn pause_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// `paused → active`, due at `now`, stall counter reset.
    async fn resume_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    async fn append_campaign_log(&self, log: &CampaignLog) -> Result<(), DatabaseError>;

    /// Log rows for an enrollment, in step order.
    async fn list_campaign_logs(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Vec<CampaignLog>, DatabaseError>;

    async fn create_follow_up_task(&self, task: &FollowUpTask) -> Result<(), DatabaseError>;

    async fn list_follow_up_tasks(&self, lead_id: Uuid) -> Result<Vec<FollowUpTask>, DatabaseError>;
}
