//! Integration tests for the REST API.
//!
//! Each test spins up an Axum server on a random port backed by an in-memory
//! store and exercises the real HTTP contract with reqwest.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use uuid::Uuid;

use lead_router::campaigns::enrollment::enroll;
use lead_router::campaigns::model::{Campaign, CampaignLog, CampaignStep};
use lead_router::leads::Lead;
use lead_router::routes::{ApiState, api_routes};
use lead_router::routing::model::{Agent, AgentRanking, Period};
use lead_router::routing::{AssignmentRotator, EligibilityResolver};
use lead_router::store::{Database, LibSqlBackend};

/// Start an Axum server on a random port, return (base url, store).
async fn start_server() -> (String, Arc<dyn Database>) {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let rotator = Arc::new(AssignmentRotator::new(
        Arc::clone(&db),
        EligibilityResolver::new(Arc::clone(&db), 3),
        Duration::minutes(30),
    ));
    let app = api_routes(ApiState {
        db: Arc::clone(&db),
        rotator,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), db)
}

/// Insert a lead assigned to `agent` whose window closes in `minutes`.
async fn assigned_lead(db: &Arc<dyn Database>, agent: Uuid, minutes: i64) -> Lead {
    let now = Utc::now();
    let lead = Lead::new("Skyler").with_email("skyler@example.com");
    db.insert_lead(&lead).await.unwrap();
    db.assign_lead(
        lead.id,
        agent,
        now - Duration::minutes(30 - minutes),
        now + Duration::minutes(minutes),
    )
    .await
    .unwrap();
    lead
}

#[tokio::test]
async fn health_responds() {
    let (base, _db) = start_server().await;
    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn get_lead_exposes_routing_state() {
    let (base, db) = start_server().await;
    let agent = Uuid::new_v4();
    let lead = assigned_lead(&db, agent, 20).await;

    let body: Value = reqwest::get(format!("{base}/api/leads/{}", lead.id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "assigned");
    assert_eq!(body["assigned_agent_id"], agent.to_string());
    assert_eq!(body["failed_claim_attempts"], 0);
    assert!(body["claim_expires_at"].is_string());
}

#[tokio::test]
async fn unknown_lead_is_404() {
    let (base, _db) = start_server().await;
    let resp = reqwest::get(format!("{base}/api/leads/{}", Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn claim_succeeds_for_assigned_agent() {
    let (base, db) = start_server().await;
    let agent = Uuid::new_v4();
    let lead = assigned_lead(&db, agent, 20).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/api/leads/{}/claim", lead.id))
        .json(&json!({"agent_id": agent}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "claimed");
    assert!(body["claim_expires_at"].is_null());

    let activity: Value = reqwest::get(format!("{base}/api/leads/{}/activity", lead.id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let kinds: Vec<&str> = activity
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["claimed"]);
}

#[tokio::test]
async fn claim_rejections_are_409() {
    let (base, db) = start_server().await;
    let agent = Uuid::new_v4();
    let open = assigned_lead(&db, agent, 20).await;
    let lapsed = assigned_lead(&db, agent, -1).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/leads/{}/claim", open.id))
        .json(&json!({"agent_id": Uuid::new_v4()}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "wrong_agent");

    let resp = client
        .post(format!("{base}/api/leads/{}/claim", lapsed.id))
        .json(&json!({"agent_id": agent}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "window_expired");

    let resp = client
        .post(format!("{base}/api/leads/{}/claim", Uuid::new_v4()))
        .json(&json!({"agent_id": agent}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn enrollment_state_and_logs() {
    let (base, db) = start_server().await;
    let campaign = Campaign::new("Welcome");
    db.insert_campaign(&campaign).await.unwrap();
    db.insert_step(&CampaignStep::task(campaign.id, 1, "Call", 0))
        .await
        .unwrap();
    let lead = Lead::new("Taylor");
    db.insert_lead(&lead).await.unwrap();
    let now = Utc::now();
    let enrollment = enroll(db.as_ref(), campaign.id, lead.id, now).await.unwrap();
    db.append_campaign_log(&CampaignLog {
        id: Uuid::new_v4(),
        enrollment_id: enrollment.id,
        campaign_id: campaign.id,
        step_number: 1,
        event: "task_created".into(),
        created_at: now,
    })
    .await
    .unwrap();

    let body: Value = reqwest::get(format!("{base}/api/enrollments/{}", enrollment.id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "active");
    assert_eq!(body["current_step"], 0);

    let logs: Value = reqwest::get(format!("{base}/api/enrollments/{}/logs", enrollment.id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logs.as_array().unwrap().len(), 1);
    assert_eq!(logs[0]["event"], "task_created");

    let resp = reqwest::get(format!("{base}/api/enrollments/{}/logs", Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

/// A ranked agent with recent activity, eligible for rotation.
async fn eligible_agent(db: &Arc<dyn Database>) -> Agent {
    let now = Utc::now();
    let agent = Agent::new("Quinn", "quinn@agency.test");
    db.upsert_agent(&agent).await.unwrap();
    db.upsert_ranking(&AgentRanking {
        agent_id: agent.id,
        rank: 1,
        score: 42.0,
        period: Period::of(now),
    })
    .await
    .unwrap();
    db.record_task_completion(agent.id, now).await.unwrap();
    agent
}

#[tokio::test]
async fn intake_then_route_assigns_lead() {
    let (base, db) = start_server().await;
    let agent = eligible_agent(&db).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/leads"))
        .json(&json!({"name": "Parker", "email": "parker@example.com", "source": "open_house"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["status"], "new");
    assert_eq!(created["source"], "open_house");
    let id = created["id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{base}/api/leads/{id}/route"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(outcome["outcome"], "assigned");
    assert_eq!(outcome["agent_id"], agent.id.to_string());

    let lead: Value = reqwest::get(format!("{base}/api/leads/{id}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(lead["status"], "assigned");
    assert_eq!(lead["assigned_agent_id"], agent.id.to_string());

    // Already assigned: nothing to route.
    let resp = client
        .post(format!("{base}/api/leads/{id}/route"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(outcome["outcome"], "lost_race");
}

#[tokio::test]
async fn route_without_agents_leaves_lead_new() {
    let (base, db) = start_server().await;
    let lead = Lead::new("Reese");
    db.insert_lead(&lead).await.unwrap();
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/leads/{}/route", lead.id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let outcome: Value = resp.json().await.unwrap();
    assert_eq!(outcome["outcome"], "no_eligible_agent");
    let stored = db.get_lead(lead.id).await.unwrap().unwrap();
    assert_eq!(stored.status.as_str(), "new");

    let resp = client
        .post(format!("{base}/api/leads/{}/route", Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn intake_requires_a_name() {
    let (base, _db) = start_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/api/leads"))
        .json(&json!({"name": "  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn enroll_pause_and_resume() {
    let (base, db) = start_server().await;
    let campaign = Campaign::new("Buyer nurture");
    db.insert_campaign(&campaign).await.unwrap();
    db.insert_step(&CampaignStep::email(campaign.id, 1, "Hi {{name}}", "Welcome", 24))
        .await
        .unwrap();
    let lead = Lead::new("Sage").with_email("sage@example.com");
    db.insert_lead(&lead).await.unwrap();
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/enrollments"))
        .json(&json!({"campaign_id": campaign.id, "lead_id": lead.id}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let enrollment: Value = resp.json().await.unwrap();
    assert_eq!(enrollment["status"], "active");
    assert_eq!(enrollment["current_step"], 0);
    let id = enrollment["id"].as_str().unwrap().to_string();

    let again: Value = client
        .post(format!("{base}/api/enrollments"))
        .json(&json!({"campaign_id": campaign.id, "lead_id": lead.id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["id"], id.as_str());

    let resp = client
        .post(format!("{base}/api/enrollments/{id}/pause"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let paused: Value = resp.json().await.unwrap();
    assert_eq!(paused["status"], "paused");

    let resp = client
        .post(format!("{base}/api/enrollments/{id}/pause"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = client
        .post(format!("{base}/api/enrollments/{id}/resume"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resumed: Value = resp.json().await.unwrap();
    assert_eq!(resumed["status"], "active");

    let resp = client
        .post(format!("{base}/api/enrollments"))
        .json(&json!({"campaign_id": Uuid::new_v4(), "lead_id": lead.id}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{base}/api/enrollments/{}/resume", Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
