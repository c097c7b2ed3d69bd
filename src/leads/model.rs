//! Lead data model — statuses, the transition table, and audit activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LifecycleError;

/// Routing status of a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    /// Created by intake, never routed.
    New,
    /// Offered to one agent with an open claim window.
    Assigned,
    /// Owned by an agent. Terminal for routing.
    Claimed,
    /// Claim window lapsed. Transient unless no agent or fallback owner could take it.
    UnclaimedExpired,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Assigned => "assigned",
            Self::Claimed => "claimed",
            Self::UnclaimedExpired => "unclaimed_expired",
        }
    }

    /// Apply `transition` to this status, returning the resulting status.
    pub fn apply(self, transition: LeadTransition) -> Result<LeadStatus, LifecycleError> {
        if transition.allowed_from().contains(&self) {
            Ok(transition.target())
        } else {
            Err(LifecycleError::IllegalTransition {
                transition: transition.name(),
                from: self,
            })
        }
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LeadStatus {
    type Err = LifecycleError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "assigned" => Ok(Self::Assigned),
            "claimed" => Ok(Self::Claimed),
            "unclaimed_expired" => Ok(Self::UnclaimedExpired),
            other => Err(LifecycleError::UnknownStatus(other.to_string())),
        }
    }
}

/// Every lead transition the system knows about.
///
/// Store writes derive their `status IN (...)` guard from [`LeadTransition::allowed_from`],
/// so this table is the only place status strings are paired with transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadTransition {
    /// Offer the lead to a rotating agent (fresh intake or re-route).
    Assign,
    /// The assigned agent accepts the lead inside the claim window.
    Claim,
    /// The claim window lapsed.
    Expire,
    /// Repeated misses: hand the lead to the fallback owner.
    Escalate,
}

impl LeadTransition {
    pub fn allowed_from(&self) -> &'static [LeadStatus] {
        match self {
            Self::Assign => &[LeadStatus::New, LeadStatus::UnclaimedExpired],
            Self::Claim => &[LeadStatus::Assigned],
            Self::Expire => &[LeadStatus::Assigned],
            Self::Escalate => &[LeadStatus::Assigned],
        }
    }

    pub fn target(&self) -> LeadStatus {
        match self {
            Self::Assign => LeadStatus::Assigned,
            Self::Claim => LeadStatus::Claimed,
            Self::Expire => LeadStatus::UnclaimedExpired,
            Self::Escalate => LeadStatus::Claimed,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Assign => "assign",
            Self::Claim => "claim",
            Self::Expire => "expire",
            Self::Escalate => "escalate",
        }
    }
}

/// A prospective client record owned by at most one agent at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub status: LeadStatus,
    pub assigned_agent_id: Option<Uuid>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub failed_claim_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Create a fresh, unrouted lead.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: None,
            phone: None,
            source: None,
            status: LeadStatus::New,
            assigned_agent_id: None,
            assigned_at: None,
            claim_expires_at: None,
            claimed_at: None,
            failed_claim_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Whether the claim window is still open at `now`.
    pub fn claim_window_open(&self, now: DateTime<Utc>) -> bool {
        self.status == LeadStatus::Assigned && self.claim_expires_at.is_some_and(|exp| exp > now)
    }
}

/// Kind of audit entry recorded against a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Assigned,
    Claimed,
    ClaimMissed,
    Escalated,
    /// Left for manual intervention (no agent or fallback owner available).
    Stranded,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Claimed => "claimed",
            Self::ClaimMissed => "claim_missed",
            Self::Escalated => "escalated",
            Self::Stranded => "stranded",
        }
    }
}

impl std::str::FromStr for ActivityKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(Self::Assigned),
            "claimed" => Ok(Self::Claimed),
            "claim_missed" => Ok(Self::ClaimMissed),
            "escalated" => Ok(Self::Escalated),
            "stranded" => Ok(Self::Stranded),
            other => Err(format!("unknown activity kind: {other}")),
        }
    }
}

/// Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadActivity {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub kind: ActivityKind,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

impl LeadActivity {
    pub fn new(
        lead_id: Uuid,
        agent_id: Option<Uuid>,
        kind: ActivityKind,
        note: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            agent_id,
            kind,
            note: note.into(),
            created_at: at,
        }
    }
}
