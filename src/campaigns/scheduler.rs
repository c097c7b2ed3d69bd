//! Campaign step scheduler.
//!
//! Each tick picks up active enrollments whose `next_run_at` has passed and
//! runs the next step for each. A step that cannot be delivered leaves the
//! enrollment where it is so the next tick retries it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::campaigns::model::{
    Advance, CampaignEnrollment, CampaignLog, CampaignStep, EnrollmentStatus, FollowUpTask,
    StepType, render_template,
};
use crate::error::{DatabaseError, Result};
use crate::leads::model::Lead;
use crate::notify::MessageSender;
use crate::store::Database;

/// Default number of enrollments handled per tick.
pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    /// Pause an enrollment after this many consecutive stalls. `None` retries forever.
    pub max_stalled_attempts: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_stalled_attempts: None,
        }
    }
}

/// Totals for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CampaignTickReport {
    pub due: usize,
    /// Steps delivered and logged.
    pub executed: usize,
    /// Enrollments that reached `completed` this tick.
    pub completed: usize,
    pub stalled: usize,
    pub paused: usize,
    pub lost_races: usize,
    pub failures: usize,
}

enum StepOutcome {
    Executed { completed: bool },
    /// No step defined past the current one.
    Exhausted,
    Stalled,
    Paused,
    LostRace,
}

/// Whether a step reached its recipient.
enum Delivery {
    Sent,
    /// Persisted only once the enrollment advance has landed.
    Task(FollowUpTask),
    Stalled(String),
}

pub struct CampaignScheduler {
    db: Arc<dyn Database>,
    sender: Arc<dyn MessageSender>,
    config: SchedulerConfig,
}

impl CampaignScheduler {
    pub fn new(db: Arc<dyn Database>, sender: Arc<dyn MessageSender>, config: SchedulerConfig) -> Self {
        Self { db, sender, config }
    }

    /// Run every due enrollment once.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<CampaignTickReport> {
        let due = self
            .db
            .list_due_enrollments(now, self.config.batch_size)
            .await?;
        let mut report = CampaignTickReport {
            due: due.len(),
            ..Default::default()
        };

        if due.is_empty() {
            debug!("No campaign steps due");
            return Ok(report);
        }

        for enrollment in &due {
            match self.process(enrollment, now).await {
                Ok(StepOutcome::Executed { completed }) => {
                    report.executed += 1;
                    if completed {
                        report.completed += 1;
                    }
                }
                Ok(StepOutcome::Exhausted) => report.completed += 1,
                Ok(StepOutcome::Stalled) => report.stalled += 1,
                Ok(StepOutcome::Paused) => report.paused += 1,
                Ok(StepOutcome::LostRace) => report.lost_races += 1,
                Err(e) => {
                    error!(enrollment_id = %enrollment.id, error = %e, "Campaign step failed");
                    report.failures += 1;
                }
            }
        }

        info!(
            due = report.due,
            executed = report.executed,
            completed = report.completed,
            stalled = report.stalled,
            paused = report.paused,
            lost_races = report.lost_races,
            failures = report.failures,
            "Campaign tick complete"
        );
        Ok(report)
    }

    async fn process(&self, enrollment: &CampaignEnrollment, now: DateTime<Utc>) -> Result<StepOutcome> {
        let target = enrollment.current_step + 1;

        let Some(step) = self.db.get_step(enrollment.campaign_id, target).await? else {
            let advance = Advance::after(enrollment.current_step, None, now);
            if !self
                .db
                .advance_enrollment(enrollment.id, enrollment.current_step, &advance, now)
                .await?
            {
                return Ok(StepOutcome::LostRace);
            }
            info!(enrollment_id = %enrollment.id, "Enrollment completed, no further steps");
            return Ok(StepOutcome::Exhausted);
        };

        let lead = self
            .db
            .get_lead(enrollment.lead_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "lead".into(),
                id: enrollment.lead_id.to_string(),
            })?;

        let delivery = self.deliver(&step, &lead, now).await;
        if let Delivery::Stalled(reason) = &delivery {
            return self.stall(enrollment, reason, now).await;
        }

        let next = self.db.get_step(enrollment.campaign_id, target + 1).await?;
        let advance = Advance::after(target, next.as_ref(), now);
        if !self
            .db
            .advance_enrollment(enrollment.id, enrollment.current_step, &advance, now)
            .await?
        {
            warn!(
                enrollment_id = %enrollment.id,
                step = target,
                "Step delivered but enrollment moved concurrently"
            );
            return Ok(StepOutcome::LostRace);
        }

        if let Delivery::Task(task) = &delivery {
            self.db.create_follow_up_task(task).await?;
        }

        self.db
            .append_campaign_log(&CampaignLog {
                id: Uuid::new_v4(),
                enrollment_id: enrollment.id,
                campaign_id: enrollment.campaign_id,
                step_number: target,
                event: step.step_type.event_tag().to_string(),
                created_at: now,
            })
            .await?;

        let completed = advance.status == EnrollmentStatus::Completed;
        info!(
            enrollment_id = %enrollment.id,
            lead_id = %lead.id,
            step = target,
            step_type = %step.step_type,
            completed,
            "Campaign step executed"
        );
        Ok(StepOutcome::Executed { completed })
    }

    async fn deliver(&self, step: &CampaignStep, lead: &Lead, now: DateTime<Utc>) -> Delivery {
        let body = render_template(&step.body, lead);
        match step.step_type {
            StepType::Email => {
                let Some(to) = lead.email.as_deref() else {
                    return Delivery::Stalled("lead has no email".into());
                };
                let subject = render_template(step.subject.as_deref().unwrap_or_default(), lead);
                match self.sender.send_email(to, &subject, &body).await {
                    Ok(()) => Delivery::Sent,
                    Err(e) => Delivery::Stalled(e.to_string()),
                }
            }
            StepType::Sms => {
                let Some(to) = lead.phone.as_deref() else {
                    return Delivery::Stalled("lead has no phone".into());
                };
                match self.sender.send_text(to, &body).await {
                    Ok(()) => Delivery::Sent,
                    Err(e) => Delivery::Stalled(e.to_string()),
                }
            }
            StepType::Task => Delivery::Task(FollowUpTask {
                id: Uuid::new_v4(),
                lead_id: lead.id,
                description: body,
                created_at: now,
            }),
        }
    }

    async fn stall(
        &self,
        enrollment: &CampaignEnrollment,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        if !self
            .db
            .record_enrollment_stall(enrollment.id, enrollment.current_step, now)
            .await?
        {
            return Ok(StepOutcome::LostRace);
        }

        let stalls = enrollment.stalled_attempts + 1;
        warn!(
            enrollment_id = %enrollment.id,
            lead_id = %enrollment.lead_id,
            step = enrollment.current_step + 1,
            stalls,
            reason,
            "Campaign step stalled"
        );

        match self.config.max_stalled_attempts {
            Some(max) if stalls >= max => {
                if self.db.pause_enrollment(enrollment.id, now).await? {
                    error!(
                        enrollment_id = %enrollment.id,
                        lead_id = %enrollment.lead_id,
                        stalls,
                        "Enrollment paused after repeated stalls"
                    );
                    Ok(StepOutcome::Paused)
                } else {
                    Ok(StepOutcome::LostRace)
                }
            }
            _ => Ok(StepOutcome::Stalled),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::campaigns::enrollment::enroll;
    use crate::campaigns::model::Campaign;
    use crate::notify::testing::{RecordingSender, Sent};
    use crate::store::LibSqlBackend;

    struct Harness {
        db: Arc<dyn Database>,
        sender: Arc<RecordingSender>,
        scheduler: CampaignScheduler,
        campaign: Campaign,
    }

    async fn harness(sender: RecordingSender, config: SchedulerConfig) -> Harness {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let campaign = Campaign::new("Re-engage");
        db.insert_campaign(&campaign).await.unwrap();
        let sender = Arc::new(sender);
        let scheduler = CampaignScheduler::new(
            Arc::clone(&db),
            Arc::clone(&sender) as Arc<dyn MessageSender>,
            config,
        );
        Harness {
            db,
            sender,
            scheduler,
            campaign,
        }
    }

    async fn lead(db: &Arc<dyn Database>, email: Option<&str>, phone: Option<&str>) -> Lead {
        let mut lead = Lead::new("Morgan");
        lead.email = email.map(str::to_string);
        lead.phone = phone.map(str::to_string);
        db.insert_lead(&lead).await.unwrap();
        lead
    }

    #[tokio::test]
    async fn runs_steps_in_order_until_completed() {
        let h = harness(RecordingSender::default(), SchedulerConfig::default()).await;
        let cid = h.campaign.id;
        h.db.insert_step(&CampaignStep::email(cid, 1, "Hi {{name}}", "Welcome {{name}}", 0))
            .await
            .unwrap();
        h.db.insert_step(&CampaignStep::sms(cid, 2, "Text {{name}}", 2)).await.unwrap();
        h.db.insert_step(&CampaignStep::task(cid, 3, "Call {{phone}}", 1)).await.unwrap();

        let lead = lead(&h.db, Some("m@example.com"), Some("+15550100")).await;
        let start = Utc::now();
        let enrollment = enroll(h.db.as_ref(), cid, lead.id, start).await.unwrap();

        let r1 = h.scheduler.tick(start).await.unwrap();
        assert_eq!(r1.executed, 1);
        let e = h.db.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(e.current_step, 1);
        assert_eq!(e.status, EnrollmentStatus::Active);

        // Not yet due.
        let idle = h.scheduler.tick(start + Duration::hours(1)).await.unwrap();
        assert_eq!(idle.due, 0);

        let r2 = h.scheduler.tick(start + Duration::hours(2)).await.unwrap();
        assert_eq!(r2.executed, 1);
        let r3 = h.scheduler.tick(start + Duration::hours(3)).await.unwrap();
        assert_eq!(r3.executed, 1);
        assert_eq!(r3.completed, 1);

        let e = h.db.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(e.current_step, 3);
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert!(e.next_run_at.is_none());

        let logs = h.db.list_campaign_logs(enrollment.id).await.unwrap();
        let steps: Vec<u32> = logs.iter().map(|l| l.step_number).collect();
        let events: Vec<&str> = logs.iter().map(|l| l.event.as_str()).collect();
        assert_eq!(steps, vec![1, 2, 3]);
        assert_eq!(events, vec!["email_sent", "sms_sent", "task_created"]);

        assert_eq!(
            h.sender.sent(),
            vec![
                Sent::Email {
                    to: "m@example.com".into(),
                    subject: "Hi Morgan".into(),
                    body: "Welcome Morgan".into(),
                },
                Sent::Text {
                    to: "+15550100".into(),
                    body: "Text Morgan".into(),
                },
            ]
        );
        let tasks = h.db.list_follow_up_tasks(lead.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "Call +15550100");

        let later = h.scheduler.tick(start + Duration::days(30)).await.unwrap();
        assert_eq!(later.due, 0);
    }

    #[tokio::test]
    async fn missing_email_stalls_without_advancing() {
        let h = harness(RecordingSender::default(), SchedulerConfig::default()).await;
        h.db.insert_step(&CampaignStep::email(h.campaign.id, 1, "Hi", "Body", 0))
            .await
            .unwrap();
        let lead = lead(&h.db, None, Some("+15550100")).await;
        let now = Utc::now();
        let enrollment = enroll(h.db.as_ref(), h.campaign.id, lead.id, now).await.unwrap();

        for i in 0..3 {
            let report = h.scheduler.tick(now + Duration::minutes(i)).await.unwrap();
            assert_eq!(report.stalled, 1);
        }

        let e = h.db.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(e.current_step, 0);
        assert_eq!(e.status, EnrollmentStatus::Active);
        assert_eq!(e.stalled_attempts, 3);
        assert!(h.db.list_campaign_logs(enrollment.id).await.unwrap().is_empty());
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn send_failure_is_retried_next_tick() {
        let h = harness(RecordingSender::failing(), SchedulerConfig::default()).await;
        h.db.insert_step(&CampaignStep::sms(h.campaign.id, 1, "Hi", 0)).await.unwrap();
        let lead = lead(&h.db, None, Some("+15550100")).await;
        let now = Utc::now();
        let enrollment = enroll(h.db.as_ref(), h.campaign.id, lead.id, now).await.unwrap();

        let report = h.scheduler.tick(now).await.unwrap();
        assert_eq!(report.stalled, 1);
        let e = h.db.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(e.current_step, 0);
        assert!(e.next_run_at.is_some());
    }

    #[tokio::test]
    async fn stall_limit_pauses_enrollment() {
        let config = SchedulerConfig {
            max_stalled_attempts: Some(2),
            ..Default::default()
        };
        let h = harness(RecordingSender::default(), config).await;
        h.db.insert_step(&CampaignStep::sms(h.campaign.id, 1, "Hi", 0)).await.unwrap();
        let lead = lead(&h.db, Some("m@example.com"), None).await;
        let now = Utc::now();
        let enrollment = enroll(h.db.as_ref(), h.campaign.id, lead.id, now).await.unwrap();

        assert_eq!(h.scheduler.tick(now).await.unwrap().stalled, 1);
        assert_eq!(h.scheduler.tick(now).await.unwrap().paused, 1);
        assert_eq!(h.scheduler.tick(now).await.unwrap().due, 0);

        let e = h.db.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(e.status, EnrollmentStatus::Paused);
    }

    #[tokio::test]
    async fn undefined_step_completes_without_sending() {
        let h = harness(RecordingSender::default(), SchedulerConfig::default()).await;
        h.db.insert_step(&CampaignStep::task(h.campaign.id, 1, "Call", 0)).await.unwrap();
        let lead = lead(&h.db, None, None).await;
        let now = Utc::now();
        let enrollment = enroll(h.db.as_ref(), h.campaign.id, lead.id, now).await.unwrap();
        h.scheduler.tick(now).await.unwrap();
        let e = h.db.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);

        // An active enrollment pointing past the last step (steps removed upstream).
        let other = Lead::new("Quinn");
        h.db.insert_lead(&other).await.unwrap();
        let stray = CampaignEnrollment {
            id: Uuid::new_v4(),
            campaign_id: h.campaign.id,
            lead_id: other.id,
            current_step: 5,
            status: EnrollmentStatus::Active,
            next_run_at: Some(now),
            stalled_attempts: 0,
            created_at: now,
            updated_at: now,
        };
        h.db.insert_enrollment(&stray).await.unwrap();

        let report = h.scheduler.tick(now).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.executed, 0);
        let e = h.db.get_enrollment(stray.id).await.unwrap().unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert_eq!(e.current_step, 5);
        assert!(h.db.list_campaign_logs(stray.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_size_bounds_tick() {
        let config = SchedulerConfig {
            batch_size: 2,
            ..Default::default()
        };
        let h = harness(RecordingSender::default(), config).await;
        h.db.insert_step(&CampaignStep::task(h.campaign.id, 1, "Call", 0)).await.unwrap();
        let now = Utc::now();
        for _ in 0..3 {
            let l = lead(&h.db, None, None).await;
            enroll(h.db.as_ref(), h.campaign.id, l.id, now).await.unwrap();
        }

        assert_eq!(h.scheduler.tick(now).await.unwrap().due, 2);
        assert_eq!(h.scheduler.tick(now).await.unwrap().due, 1);
    }

    #[tokio::test]
    async fn task_step_losing_the_advance_creates_no_task() {
        let h = harness(RecordingSender::default(), SchedulerConfig::default()).await;
        h.db.insert_step(&CampaignStep::task(h.campaign.id, 1, "Call {{name}}", 0))
            .await
            .unwrap();
        h.db.insert_step(&CampaignStep::task(h.campaign.id, 2, "Visit {{name}}", 24))
            .await
            .unwrap();
        let lead = lead(&h.db, None, None).await;
        let now = Utc::now();
        let stale = enroll(h.db.as_ref(), h.campaign.id, lead.id, now).await.unwrap();

        // Another worker runs step 1 first.
        let step_two = h.db.get_step(h.campaign.id, 2).await.unwrap();
        let advance = Advance::after(1, step_two.as_ref(), now);
        assert!(
            h.db.advance_enrollment(stale.id, 0, &advance, now)
                .await
                .unwrap()
        );

        let outcome = h.scheduler.process(&stale, now).await.unwrap();
        assert!(matches!(outcome, StepOutcome::LostRace));
        assert!(h.db.list_follow_up_tasks(lead.id).await.unwrap().is_empty());
        assert!(h.db.list_campaign_logs(stale.id).await.unwrap().is_empty());
    }
}
