//! Error types for the lead router.

use uuid::Uuid;

use crate::leads::model::LeadStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Outbound message errors (email / SMS).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Channel {name} is not configured")]
    NotConfigured { name: String },

    #[error("Invalid recipient for channel {name}: {recipient}")]
    InvalidRecipient { name: String, recipient: String },
}

/// Illegal lead state transitions.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Cannot {transition} a lead in status {from}")]
    IllegalTransition {
        transition: &'static str,
        from: LeadStatus,
    },

    #[error("Unknown lead status: {0}")]
    UnknownStatus(String),
}

/// Reasons the agent-facing claim action can be rejected.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("Lead {0} not found")]
    NotFound(Uuid),

    #[error("Lead {lead_id} is {status}, not awaiting a claim")]
    NotAssigned { lead_id: Uuid, status: LeadStatus },

    #[error("Lead {lead_id} is assigned to another agent")]
    WrongAgent { lead_id: Uuid },

    #[error("Claim window for lead {lead_id} has closed")]
    WindowExpired { lead_id: Uuid },

    #[error("Lead {lead_id} changed while claiming; someone else handled it")]
    LostRace { lead_id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the router.
pub type Result<T> = std::result::Result<T, Error>;
