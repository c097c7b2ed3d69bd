//! Agent, ranking, and rotation-cursor types.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An agent as seen by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub is_active: bool,
    /// Only tier-1 agents take part in lead rotation.
    pub tier: u8,
}

impl Agent {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            phone: None,
            is_active: true,
            tier: 1,
        }
    }

    pub fn with_tier(mut self, tier: u8) -> Self {
        self.tier = tier;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn rotates(&self) -> bool {
        self.is_active && self.tier == 1
    }
}

/// A calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Monthly performance rank for one agent, produced by the statistics aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRanking {
    pub agent_id: Uuid,
    /// 1 = best.
    pub rank: u32,
    pub score: f64,
    pub period: Period,
}

/// One entry of the resolver's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankedAgent {
    pub agent_id: Uuid,
    pub rank: u32,
}

/// The singleton rotation cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignmentCursor {
    pub period: Period,
    pub last_rank_assigned: u32,
    /// Bumped on every write; used as the optimistic-concurrency guard.
    pub version: i64,
}
