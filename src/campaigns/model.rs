//! Campaign data model — steps, enrollments, and the audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel a step is delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Email,
    Sms,
    /// Creates a follow-up task for a human instead of sending anything.
    Task,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Task => "task",
        }
    }

    /// Event tag written to the campaign log when a step of this type runs.
    pub fn event_tag(&self) -> &'static str {
        match self {
            Self::Email => "email_sent",
            Self::Sms => "sms_sent",
            Self::Task => "task_created",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "sms" => Ok(Self::Sms),
            "task" => Ok(Self::Task),
            other => Err(format!("unknown step type: {other}")),
        }
    }
}

/// A nurture campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// One ordered, immutable unit of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStep {
    pub campaign_id: Uuid,
    /// 1-based, unique per campaign.
    pub step_number: u32,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    /// Hours after the previous step completes before this one may run.
    pub delay_hours: u32,
}

impl CampaignStep {
    pub fn email(
        campaign_id: Uuid,
        step_number: u32,
        subject: impl Into<String>,
        body: impl Into<String>,
        delay_hours: u32,
    ) -> Self {
        Self {
            campaign_id,
            step_number,
            step_type: StepType::Email,
            subject: Some(subject.into()),
            body: body.into(),
            delay_hours,
        }
    }

    pub fn sms(campaign_id: Uuid, step_number: u32, body: impl Into<String>, delay_hours: u32) -> Self {
        Self {
            campaign_id,
            step_number,
            step_type: StepType::Sms,
            subject: None,
            body: body.into(),
            delay_hours,
        }
    }

    pub fn task(campaign_id: Uuid, step_number: u32, body: impl Into<String>, delay_hours: u32) -> Self {
        Self {
            campaign_id,
            step_number,
            step_type: StepType::Task,
            subject: None,
            body: body.into(),
            delay_hours,
        }
    }
}

/// Enrollment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnrollmentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown enrollment status: {other}")),
        }
    }
}

/// One lead's progress through one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignEnrollment {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
    /// Last executed step number; 0 before the first step runs.
    pub current_step: u32,
    pub status: EnrollmentStatus,
    /// `None` means nothing further is scheduled.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Consecutive ticks the due step could not execute.
    pub stalled_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where an enrollment goes after a step executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub current_step: u32,
    pub status: EnrollmentStatus,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Advance {
    /// Compute the state after `executed_step` ran at `now`, given the step that follows it.
    pub fn after(executed_step: u32, next: Option<&CampaignStep>, now: DateTime<Utc>) -> Self {
        match next {
            Some(step) => Self {
                current_step: executed_step,
                status: EnrollmentStatus::Active,
                next_run_at: Some(now + chrono::Duration::hours(step.delay_hours as i64)),
            },
            None => Self {
                current_step: executed_step,
                status: EnrollmentStatus::Completed,
                next_run_at: None,
            },
        }
    }
}

/// Immutable audit row written once per executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignLog {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub campaign_id: Uuid,
    pub step_number: u32,
    pub event: String,
    pub created_at: DateTime<Utc>,
}

/// A durable note for a human agent, created by `task` steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Fill `{{name}}`, `{{email}}` and `{{phone}}` from the lead.
pub fn render_template(template: &str, lead: &crate::leads::model::Lead) -> String {
    template
        .replace("{{name}}", &lead.name)
        .replace("{{email}}", lead.email.as_deref().unwrap_or(""))
        .replace("{{phone}}", lead.phone.as_deref().unwrap_or(""))
}
