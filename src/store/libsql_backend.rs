//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! RFC 3339 UTC strings with fixed microsecond precision so that SQL string
//! comparison matches chronological order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::campaigns::model::{
    Advance, Campaign, CampaignEnrollment, CampaignLog, CampaignStep, EnrollmentStatus,
    FollowUpTask, StepType,
};
use crate::error::DatabaseError;
use crate::leads::model::{Lead, LeadActivity, LeadStatus, LeadTransition};
use crate::routing::model::{Agent, AgentRanking, AssignmentCursor, Period};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.conn
            .execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(&self.conn).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a raw statement against the connection.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(sql, ())
            .await
            .map_err(query_err("execute_raw"))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// `status IN ('a', 'b')` for the source states of a transition.
fn status_guard(transition: LeadTransition) -> String {
    let states: Vec<String> = transition
        .allowed_from()
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect();
    format!("status IN ({})", states.join(", "))
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

const AGENT_COLUMNS: &str = "id, name, email, phone, is_active, tier";

const LEAD_COLUMNS: &str = "id, name, email, phone, source, status, assigned_agent_id, assigned_at, claim_expires_at, claimed_at, failed_claim_attempts, created_at, updated_at";

const ENROLLMENT_COLUMNS: &str = "id, campaign_id, lead_id, current_step, status, next_run_at, stalled_attempts, created_at, updated_at";

const STEP_COLUMNS: &str = "campaign_id, step_number, step_type, subject, body, delay_hours";

fn row_to_agent(row: &libsql::Row) -> Result<Agent, DatabaseError> {
    let id: String = row.get(0).map_err(query_err("agent row"))?;
    let is_active: i64 = row.get(4).map_err(query_err("agent row"))?;
    let tier: i64 = row.get(5).map_err(query_err("agent row"))?;
    Ok(Agent {
        id: parse_uuid(&id),
        name: row.get(1).map_err(query_err("agent row"))?,
        email: row.get(2).map_err(query_err("agent row"))?,
        phone: row.get::<String>(3).ok(),
        is_active: is_active != 0,
        tier: tier as u8,
    })
}

/// Map a libsql Row to a Lead. Column order matches LEAD_COLUMNS.
fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let id: String = row.get(0).map_err(query_err("lead row"))?;
    let status_str: String = row.get(5).map_err(query_err("lead row"))?;
    let status: LeadStatus = status_str
        .parse()
        .map_err(|e: crate::error::LifecycleError| DatabaseError::Serialization(e.to_string()))?;
    let attempts: i64 = row.get(10).map_err(query_err("lead row"))?;
    let created_str: String = row.get(11).map_err(query_err("lead row"))?;
    let updated_str: String = row.get(12).map_err(query_err("lead row"))?;

    Ok(Lead {
        id: parse_uuid(&id),
        name: row.get(1).map_err(query_err("lead row"))?,
        email: row.get::<String>(2).ok(),
        phone: row.get::<String>(3).ok(),
        source: row.get::<String>(4).ok(),
        status,
        assigned_agent_id: row.get::<String>(6).ok().map(|s| parse_uuid(&s)),
        assigned_at: parse_optional_datetime(&row.get::<String>(7).ok()),
        claim_expires_at: parse_optional_datetime(&row.get::<String>(8).ok()),
        claimed_at: parse_optional_datetime(&row.get::<String>(9).ok()),
        failed_claim_attempts: attempts as u32,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_step(row: &libsql::Row) -> Result<CampaignStep, DatabaseError> {
    let campaign_id: String = row.get(0).map_err(query_err("step row"))?;
    let step_number: i64 = row.get(1).map_err(query_err("step row"))?;
    let type_str: String = row.get(2).map_err(query_err("step row"))?;
    let step_type: StepType = type_str.parse().map_err(DatabaseError::Serialization)?;
    let delay: i64 = row.get(5).map_err(query_err("step row"))?;
    Ok(CampaignStep {
        campaign_id: parse_uuid(&campaign_id),
        step_number: step_number as u32,
        step_type,
        subject: row.get::<String>(3).ok(),
        body: row.get(4).map_err(query_err("step row"))?,
        delay_hours: delay as u32,
    })
}

fn row_to_enrollment(row: &libsql::Row) -> Result<CampaignEnrollment, DatabaseError> {
    let id: String = row.get(0).map_err(query_err("enrollment row"))?;
    let campaign_id: String = row.get(1).map_err(query_err("enrollment row"))?;
    let lead_id: String = row.get(2).map_err(query_err("enrollment row"))?;
    let current_step: i64 = row.get(3).map_err(query_err("enrollment row"))?;
    let status_str: String = row.get(4).map_err(query_err("enrollment row"))?;
    let status: EnrollmentStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let stalled: i64 = row.get(6).map_err(query_err("enrollment row"))?;
    let created_str: String = row.get(7).map_err(query_err("enrollment row"))?;
    let updated_str: String = row.get(8).map_err(query_err("enrollment row"))?;
    Ok(CampaignEnrollment {
        id: parse_uuid(&id),
        campaign_id: parse_uuid(&campaign_id),
        lead_id: parse_uuid(&lead_id),
        current_step: current_step as u32,
        status,
        next_run_at: parse_optional_datetime(&row.get::<String>(5).ok()),
        stalled_attempts: stalled as u32,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    // ── Agents & rankings ───────────────────────────────────────────

    async fn upsert_agent(&self, agent: &Agent) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO agents (id, name, email, phone, is_active, tier) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email,
                    phone = excluded.phone, is_active = excluded.is_active, tier = excluded.tier",
                params![
                    agent.id.to_string(),
                    agent.name.clone(),
                    agent.email.clone(),
                    opt_text(agent.phone.as_deref()),
                    agent.is_active as i64,
                    agent.tier as i64,
                ],
            )
            .await
            .map_err(query_err("upsert_agent"))?;
        Ok(())
    }

    async fn find_agent_by_email(&self, email: &str) -> Result<Option<Agent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE lower(email) = lower(?1)"),
                params![email],
            )
            .await
            .map_err(query_err("find_agent_by_email"))?;

        match rows.next().await.map_err(query_err("find_agent_by_email"))? {
            Some(row) => Ok(Some(row_to_agent(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_rotating_agents(&self) -> Result<Vec<Agent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE is_active = 1 AND tier = 1"),
                (),
            )
            .await
            .map_err(query_err("list_rotating_agents"))?;

        let mut agents = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_agent(&row) {
                Ok(agent) => agents.push(agent),
                Err(e) => tracing::warn!("Skipping agent row: {e}"),
            }
        }
        Ok(agents)
    }

    async fn record_task_completion(
        &self,
        agent_id: Uuid,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO agent_task_completions (agent_id, completed_at) VALUES (?1, ?2)",
                params![agent_id.to_string(), ts(completed_at)],
            )
            .await
            .map_err(query_err("record_task_completion"))?;
        Ok(())
    }

    async fn agents_active_since(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT agent_id FROM agent_task_completions WHERE completed_at >= ?1",
                params![ts(since)],
            )
            .await
            .map_err(query_err("agents_active_since"))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(id) = row.get::<String>(0) {
                ids.push(parse_uuid(&id));
            }
        }
        Ok(ids)
    }

    async fn upsert_ranking(&self, ranking: &AgentRanking) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO agent_rankings (agent_id, year, month, rank, score) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(agent_id, year, month) DO UPDATE SET rank = excluded.rank, score = excluded.score",
                params![
                    ranking.agent_id.to_string(),
                    ranking.period.year as i64,
                    ranking.period.month as i64,
                    ranking.rank as i64,
                    ranking.score,
                ],
            )
            .await
            .map_err(query_err("upsert_ranking"))?;
        Ok(())
    }

    async fn rankings_for_period(&self, period: Period) -> Result<Vec<AgentRanking>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT agent_id, rank, score FROM agent_rankings
                 WHERE year = ?1 AND month = ?2 AND rank IS NOT NULL ORDER BY rank ASC",
                params![period.year as i64, period.month as i64],
            )
            .await
            .map_err(query_err("rankings_for_period"))?;

        let mut rankings = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let agent_id: String = row.get(0).map_err(query_err("ranking row"))?;
            let rank: i64 = row.get(1).map_err(query_err("ranking row"))?;
            let score: f64 = row.get(2).map_err(query_err("ranking row"))?;
            rankings.push(AgentRanking {
                agent_id: parse_uuid(&agent_id),
                rank: rank as u32,
                score,
                period,
            });
        }
        Ok(rankings)
    }

    // ── Rotation cursor ─────────────────────────────────────────────

    async fn load_cursor(&self) -> Result<Option<AssignmentCursor>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT year, month, last_rank_assigned, version FROM assignment_cursor WHERE id = 1",
                (),
            )
            .await
            .map_err(query_err("load_cursor"))?;

        match rows.next().await.map_err(query_err("load_cursor"))? {
            Some(row) => {
                let year: i64 = row.get(0).map_err(query_err("cursor row"))?;
                let month: i64 = row.get(1).map_err(query_err("cursor row"))?;
                let last: i64 = row.get(2).map_err(query_err("cursor row"))?;
                let version: i64 = row.get(3).map_err(query_err("cursor row"))?;
                Ok(Some(AssignmentCursor {
                    period: Period {
                        year: year as i32,
                        month: month as u32,
                    },
                    last_rank_assigned: last as u32,
                    version,
                }))
            }
            None => Ok(None),
        }
    }

    async fn init_cursor(&self, period: Period) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO assignment_cursor (id, year, month, last_rank_assigned, version)
                 VALUES (1, ?1, ?2, 0, 0)",
                params![period.year as i64, period.month as i64],
            )
            .await
            .map_err(query_err("init_cursor"))?;
        Ok(())
    }

    async fn store_cursor(
        &self,
        expected_version: i64,
        period: Period,
        last_rank_assigned: u32,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE assignment_cursor SET year = ?1, month = ?2, last_rank_assigned = ?3, version = version + 1
                 WHERE id = 1 AND version = ?4",
                params![
                    period.year as i64,
                    period.month as i64,
                    last_rank_assigned as i64,
                    expected_version,
                ],
            )
            .await
            .map_err(query_err("store_cursor"))?;
        Ok(count > 0)
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO leads ({LEAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
                params![
                    lead.id.to_string(),
                    lead.name.clone(),
                    opt_text(lead.email.as_deref()),
                    opt_text(lead.phone.as_deref()),
                    opt_text(lead.source.as_deref()),
                    lead.status.as_str(),
                    opt_text(lead.assigned_agent_id.map(|id| id.to_string()).as_deref()),
                    opt_ts(lead.assigned_at),
                    opt_ts(lead.claim_expires_at),
                    opt_ts(lead.claimed_at),
                    lead.failed_claim_attempts as i64,
                    ts(lead.created_at),
                    ts(lead.updated_at),
                ],
            )
            .await
            .map_err(query_err("insert_lead"))?;

        debug!(lead_id = %lead.id, status = %lead.status, "Lead inserted into DB");
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_lead"))?;

        match rows.next().await.map_err(query_err("get_lead"))? {
            Some(row) => Ok(Some(row_to_lead(&row)?)),
            None => Ok(None),
        }
    }

    async fn assign_lead(
        &self,
        id: Uuid,
        agent_id: Uuid,
        now: DateTime<Utc>,
        claim_expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let t = LeadTransition::Assign;
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE leads SET status = ?1, assigned_agent_id = ?2, assigned_at = ?3,
                        claim_expires_at = ?4, claimed_at = NULL, updated_at = ?3
                     WHERE id = ?5 AND {}",
                    status_guard(t)
                ),
                params![
                    t.target().as_str(),
                    agent_id.to_string(),
                    ts(now),
                    ts(claim_expires_at),
                    id.to_string(),
                ],
            )
            .await
            .map_err(query_err("assign_lead"))?;
        Ok(count > 0)
    }

    async fn claim_lead(
        &self,
        id: Uuid,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let t = LeadTransition::Claim;
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE leads SET status = ?1, claimed_at = ?2, claim_expires_at = NULL, updated_at = ?2
                     WHERE id = ?3 AND {} AND assigned_agent_id = ?4 AND claim_expires_at > ?2",
                    status_guard(t)
                ),
                params![t.target().as_str(), ts(now), id.to_string(), agent_id.to_string()],
            )
            .await
            .map_err(query_err("claim_lead"))?;
        Ok(count > 0)
    }

    async fn expire_lead(
        &self,
        id: Uuid,
        expected_attempts: u32,
        new_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let t = LeadTransition::Expire;
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE leads SET status = ?1, failed_claim_attempts = ?2, claim_expires_at = NULL,
                        assigned_agent_id = NULL, updated_at = ?3
                     WHERE id = ?4 AND {} AND claimed_at IS NULL AND claim_expires_at <= ?3
                        AND failed_claim_attempts = ?5",
                    status_guard(t)
                ),
                params![
                    t.target().as_str(),
                    new_attempts as i64,
                    ts(now),
                    id.to_string(),
                    expected_attempts as i64,
                ],
            )
            .await
            .map_err(query_err("expire_lead"))?;
        Ok(count > 0)
    }

    async fn escalate_lead(
        &self,
        id: Uuid,
        owner_id: Uuid,
        expected_attempts: u32,
        new_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let t = LeadTransition::Escalate;
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE leads SET status = ?1, assigned_agent_id = ?2, claimed_at = ?3,
                        claim_expires_at = NULL, failed_claim_attempts = ?4, updated_at = ?3
                     WHERE id = ?5 AND {} AND claimed_at IS NULL AND claim_expires_at <= ?3
                        AND failed_claim_attempts = ?6",
                    status_guard(t)
                ),
                params![
                    t.target().as_str(),
                    owner_id.to_string(),
                    ts(now),
                    new_attempts as i64,
                    id.to_string(),
                    expected_attempts as i64,
                ],
            )
            .await
            .map_err(query_err("escalate_lead"))?;
        Ok(count > 0)
    }

    async fn list_expired_claims(&self, now: DateTime<Utc>) -> Result<Vec<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LEAD_COLUMNS} FROM leads
                     WHERE status = ?1 AND claimed_at IS NULL AND claim_expires_at <= ?2
                     ORDER BY claim_expires_at ASC"
                ),
                params![LeadStatus::Assigned.as_str(), ts(now)],
            )
            .await
            .map_err(query_err("list_expired_claims"))?;

        let mut leads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_lead(&row) {
                Ok(lead) => leads.push(lead),
                Err(e) => tracing::warn!("Skipping lead row: {e}"),
            }
        }
        Ok(leads)
    }

    async fn record_activity(&self, activity: &LeadActivity) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO lead_activities (id, lead_id, agent_id, kind, note, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    activity.id.to_string(),
                    activity.lead_id.to_string(),
                    opt_text(activity.agent_id.map(|id| id.to_string()).as_deref()),
                    activity.kind.as_str(),
                    activity.note.clone(),
                    ts(activity.created_at),
                ],
            )
            .await
            .map_err(query_err("record_activity"))?;
        Ok(())
    }

    async fn list_activity(&self, lead_id: Uuid) -> Result<Vec<LeadActivity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, lead_id, agent_id, kind, note, created_at FROM lead_activities
                 WHERE lead_id = ?1 ORDER BY created_at ASC, rowid ASC",
                params![lead_id.to_string()],
            )
            .await
            .map_err(query_err("list_activity"))?;

        let mut activity = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row.get(0).map_err(query_err("activity row"))?;
            let lead: String = row.get(1).map_err(query_err("activity row"))?;
            let kind_str: String = row.get(3).map_err(query_err("activity row"))?;
            let created_str: String = row.get(5).map_err(query_err("activity row"))?;
            let kind = match kind_str.parse() {
                Ok(kind) => kind,
                Err(e) => {
                    tracing::warn!("Skipping activity row: {e}");
                    continue;
                }
            };
            activity.push(LeadActivity {
                id: parse_uuid(&id),
                lead_id: parse_uuid(&lead),
                agent_id: row.get::<String>(2).ok().map(|s| parse_uuid(&s)),
                kind,
                note: row.get(4).map_err(query_err("activity row"))?,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(activity)
    }

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO campaigns (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![
                    campaign.id.to_string(),
                    campaign.name.clone(),
                    ts(campaign.created_at),
                ],
            )
            .await
            .map_err(query_err("insert_campaign"))?;
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, created_at FROM campaigns WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_campaign"))?;

        match rows.next().await.map_err(query_err("get_campaign"))? {
            Some(row) => {
                let id: String = row.get(0).map_err(query_err("campaign row"))?;
                let created_at: String = row.get(2).map_err(query_err("campaign row"))?;
                Ok(Some(Campaign {
                    id: parse_uuid(&id),
                    name: row.get(1).map_err(query_err("campaign row"))?,
                    created_at: parse_datetime(&created_at),
                }))
            }
            None => Ok(None),
        }
    }

    async fn insert_step(&self, step: &CampaignStep) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO campaign_steps ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    step.campaign_id.to_string(),
                    step.step_number as i64,
                    step.step_type.as_str(),
                    opt_text(step.subject.as_deref()),
                    step.body.clone(),
                    step.delay_hours as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Constraint(format!("insert_step: {e}")))?;
        Ok(())
    }

    async fn get_step(
        &self,
        campaign_id: Uuid,
        step_number: u32,
    ) -> Result<Option<CampaignStep>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM campaign_steps WHERE campaign_id = ?1 AND step_number = ?2"
                ),
                params![campaign_id.to_string(), step_number as i64],
            )
            .await
            .map_err(query_err("get_step"))?;

        match rows.next().await.map_err(query_err("get_step"))? {
            Some(row) => Ok(Some(row_to_step(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_enrollment(
        &self,
        enrollment: &CampaignEnrollment,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO campaign_enrollments ({ENROLLMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    enrollment.id.to_string(),
                    enrollment.campaign_id.to_string(),
                    enrollment.lead_id.to_string(),
                    enrollment.current_step as i64,
                    enrollment.status.as_str(),
                    opt_ts(enrollment.next_run_at),
                    enrollment.stalled_attempts as i64,
                    ts(enrollment.created_at),
                    ts(enrollment.updated_at),
                ],
            )
            .await
            .map_err(query_err("insert_enrollment"))?;
        Ok(count > 0)
    }

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<CampaignEnrollment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ENROLLMENT_COLUMNS} FROM campaign_enrollments WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_enrollment"))?;

        match rows.next().await.map_err(query_err("get_enrollment"))? {
            Some(row) => Ok(Some(row_to_enrollment(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_enrollment(
        &self,
        campaign_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<CampaignEnrollment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM campaign_enrollments WHERE campaign_id = ?1 AND lead_id = ?2"
                ),
                params![campaign_id.to_string(), lead_id.to_string()],
            )
            .await
            .map_err(query_err("find_enrollment"))?;

        match rows.next().await.map_err(query_err("find_enrollment"))? {
            Some(row) => Ok(Some(row_to_enrollment(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CampaignEnrollment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM campaign_enrollments
                     WHERE status = ?1 AND next_run_at IS NOT NULL AND next_run_at <= ?2
                     ORDER BY next_run_at ASC LIMIT ?3"
                ),
                params![EnrollmentStatus::Active.as_str(), ts(now), limit as i64],
            )
            .await
            .map_err(query_err("list_due_enrollments"))?;

        let mut enrollments = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_enrollment(&row) {
                Ok(e) => enrollments.push(e),
                Err(e) => tracing::warn!("Skipping enrollment row: {e}"),
            }
        }
        Ok(enrollments)
    }

    async fn advance_enrollment(
        &self,
        id: Uuid,
        expected_step: u32,
        advance: &Advance,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE campaign_enrollments
                 SET current_step = ?1, status = ?2, next_run_at = ?3, stalled_attempts = 0, updated_at = ?4
                 WHERE id = ?5 AND status = ?6 AND current_step = ?7",
                params![
                    advance.current_step as i64,
                    advance.status.as_str(),
                    opt_ts(advance.next_run_at),
                    ts(now),
                    id.to_string(),
                    EnrollmentStatus::Active.as_str(),
                    expected_step as i64,
                ],
            )
            .await
            .map_err(query_err("advance_enrollment"))?;
        Ok(count > 0)
    }

    async fn record_enrollment_stall(
        &self,
        id: Uuid,
        expected_step: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE campaign_enrollments SET stalled_attempts = stalled_attempts + 1, updated_at = ?1
                 WHERE id = ?2 AND status = ?3 AND current_step = ?4",
                params![
                    ts(now),
                    id.to_string(),
                    EnrollmentStatus::Active.as_str(),
                    expected_step as i64,
                ],
            )
            .await
            .map_err(query_err("record_enrollment_stall"))?;
        Ok(count > 0)
    }

    async fn pause_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE campaign_enrollments SET status = ?1, next_run_at = NULL, updated_at = ?2
                 WHERE id = ?3 AND status = ?4",
                params![
                    EnrollmentStatus::Paused.as_str(),
                    ts(now),
                    id.to_string(),
                    EnrollmentStatus::Active.as_str(),
                ],
            )
            .await
            .map_err(query_err("pause_enrollment"))?;
        Ok(count > 0)
    }

    async fn resume_enrollment(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE campaign_enrollments SET status = ?1, next_run_at = ?2, stalled_attempts = 0, updated_at = ?2
                 WHERE id = ?3 AND status = ?4",
                params![
                    EnrollmentStatus::Active.as_str(),
                    ts(now),
                    id.to_string(),
                    EnrollmentStatus::Paused.as_str(),
                ],
            )
            .await
            .map_err(query_err("resume_enrollment"))?;
        Ok(count > 0)
    }

    async fn append_campaign_log(&self, log: &CampaignLog) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO campaign_logs (id, enrollment_id, campaign_id, step_number, event, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    log.id.to_string(),
                    log.enrollment_id.to_string(),
                    log.campaign_id.to_string(),
                    log.step_number as i64,
                    log.event.clone(),
                    ts(log.created_at),
                ],
            )
            .await
            .map_err(query_err("append_campaign_log"))?;
        Ok(())
    }

    async fn list_campaign_logs(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Vec<CampaignLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, enrollment_id, campaign_id, step_number, event, created_at FROM campaign_logs
                 WHERE enrollment_id = ?1 ORDER BY step_number ASC, created_at ASC",
                params![enrollment_id.to_string()],
            )
            .await
            .map_err(query_err("list_campaign_logs"))?;

        let mut logs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row.get(0).map_err(query_err("log row"))?;
            let enrollment: String = row.get(1).map_err(query_err("log row"))?;
            let campaign: String = row.get(2).map_err(query_err("log row"))?;
            let step_number: i64 = row.get(3).map_err(query_err("log row"))?;
            let created_str: String = row.get(5).map_err(query_err("log row"))?;
            logs.push(CampaignLog {
                id: parse_uuid(&id),
                enrollment_id: parse_uuid(&enrollment),
                campaign_id: parse_uuid(&campaign),
                step_number: step_number as u32,
                event: row.get(4).map_err(query_err("log row"))?,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(logs)
    }

    async fn create_follow_up_task(&self, task: &FollowUpTask) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO follow_up_tasks (id, lead_id, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    task.id.to_string(),
                    task.lead_id.to_string(),
                    task.description.clone(),
                    ts(task.created_at),
                ],
            )
            .await
            .map_err(query_err("create_follow_up_task"))?;
        Ok(())
    }

    async fn list_follow_up_tasks(&self, lead_id: Uuid) -> Result<Vec<FollowUpTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, lead_id, description, created_at FROM follow_up_tasks
                 WHERE lead_id = ?1 ORDER BY created_at ASC",
                params![lead_id.to_string()],
            )
            .await
            .map_err(query_err("list_follow_up_tasks"))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row.get(0).map_err(query_err("task row"))?;
            let lead: String = row.get(1).map_err(query_err("task row"))?;
            let created_str: String = row.get(3).map_err(query_err("task row"))?;
            tasks.push(FollowUpTask {
                id: parse_uuid(&id),
                lead_id: parse_uuid(&lead),
                description: row.get(2).map_err(query_err("task row"))?,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(tasks)
    }
}
