//! REST endpoints for lead intake and routing, the claim action, and campaign enrollments.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::campaigns::enrollment;
use crate::error::{ClaimError, DatabaseError, Error};
use crate::leads::{Lead, claim_lead};
use crate::routing::{AssignmentRotator, RouteOutcome};
use crate::store::Database;

/// Shared state for the API routes.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<dyn Database>,
    pub rotator: Arc<AssignmentRotator>,
}

#[derive(Debug, Deserialize)]
pub struct CreateLeadRequest {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub agent_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub campaign_id: Uuid,
    pub lead_id: Uuid,
}

fn not_found(what: &str, id: Uuid) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("{what} {id} not found")})),
    )
        .into_response()
}

fn internal(e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, "API request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
        .into_response()
}

/// 404 for a missing entity, 500 for anything else.
fn api_error(e: Error) -> Response {
    match e {
        Error::Database(DatabaseError::NotFound { entity, id }) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("{entity} {id} not found")})),
        )
            .into_response(),
        other => internal(other),
    }
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// POST /api/leads
///
/// Intake: stores the lead in `new`. Routing is a separate call.
async fn create_lead(
    State(state): State<ApiState>,
    Json(req): Json<CreateLeadRequest>,
) -> Response {
    let name = req.name.trim();
    if name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "name is required"})),
        )
            .into_response();
    }

    let mut lead = Lead::new(name);
    if let Some(email) = req.email {
        lead = lead.with_email(email);
    }
    if let Some(phone) = req.phone {
        lead = lead.with_phone(phone);
    }
    if let Some(source) = req.source {
        lead = lead.with_source(source);
    }

    match state.db.insert_lead(&lead).await {
        Ok(()) => {
            tracing::info!(lead_id = %lead.id, "Lead created");
            (StatusCode::CREATED, Json(lead)).into_response()
        }
        Err(e) => internal(e),
    }
}

/// GET /api/leads/{id}
async fn get_lead(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.db.get_lead(id).await {
        Ok(Some(lead)) => Json(lead).into_response(),
        Ok(None) => not_found("Lead", id),
        Err(e) => internal(e),
    }
}

/// GET /api/leads/{id}/activity
async fn get_activity(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.db.get_lead(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("Lead", id),
        Err(e) => return internal(e),
    }
    match state.db.list_activity(id).await {
        Ok(activity) => Json(activity).into_response(),
        Err(e) => internal(e),
    }
}

/// POST /api/leads/{id}/route
///
/// 200 with the outcome when the lead was assigned or nobody is eligible,
/// 409 when the lead is not in a routable state.
async fn route(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.rotator.route_lead(id, Utc::now()).await {
        Ok(outcome @ RouteOutcome::LostRace) => (StatusCode::CONFLICT, Json(outcome)).into_response(),
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => api_error(e),
    }
}

/// POST /api/leads/{id}/claim
///
/// 200 with the claimed lead, 404 for an unknown lead, 409 when the lead
/// cannot be claimed by this agent right now.
async fn claim(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ClaimRequest>,
) -> Response {
    match claim_lead(state.db.as_ref(), id, req.agent_id, Utc::now()).await {
        Ok(lead) => Json(lead).into_response(),
        Err(ClaimError::NotFound(id)) => not_found("Lead", id),
        Err(ClaimError::Database(e)) => internal(e),
        Err(rejection) => {
            let reason = match &rejection {
                ClaimError::NotAssigned { .. } => "not_assigned",
                ClaimError::WrongAgent { .. } => "wrong_agent",
                ClaimError::WindowExpired { .. } => "window_expired",
                _ => "lost_race",
            };
            (
                StatusCode::CONFLICT,
                Json(json!({"error": rejection.to_string(), "reason": reason})),
            )
                .into_response()
        }
    }
}

/// POST /api/enrollments
///
/// Idempotent per (campaign, lead): re-enrolling returns the existing enrollment.
async fn create_enrollment(
    State(state): State<ApiState>,
    Json(req): Json<EnrollRequest>,
) -> Response {
    match enrollment::enroll(state.db.as_ref(), req.campaign_id, req.lead_id, Utc::now()).await {
        Ok(enrollment) => Json(enrollment).into_response(),
        Err(e) => api_error(e),
    }
}

/// POST /api/enrollments/{id}/pause
async fn pause_enrollment(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    let result = enrollment::pause(state.db.as_ref(), id, Utc::now()).await;
    enrollment_change(&state, id, result, "active").await
}

/// POST /api/enrollments/{id}/resume
async fn resume_enrollment(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    let result = enrollment::resume(state.db.as_ref(), id, Utc::now()).await;
    enrollment_change(&state, id, result, "paused").await
}

/// 200 with the enrollment after a pause / resume, 409 if it was not `expected`.
async fn enrollment_change(
    state: &ApiState,
    id: Uuid,
    result: crate::error::Result<bool>,
    expected: &str,
) -> Response {
    let changed = match result {
        Ok(changed) => changed,
        Err(e) => return api_error(e),
    };
    match state.db.get_enrollment(id).await {
        Ok(Some(enrollment)) if changed => Json(enrollment).into_response(),
        Ok(Some(enrollment)) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("Enrollment {id} is {}, not {expected}", enrollment.status),
            })),
        )
            .into_response(),
        Ok(None) => not_found("Enrollment", id),
        Err(e) => internal(e),
    }
}

/// GET /api/enrollments/{id}
async fn get_enrollment(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.db.get_enrollment(id).await {
        Ok(Some(enrollment)) => Json(enrollment).into_response(),
        Ok(None) => not_found("Enrollment", id),
        Err(e) => internal(e),
    }
}

/// GET /api/enrollments/{id}/logs
async fn get_enrollment_logs(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Response {
    match state.db.get_enrollment(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("Enrollment", id),
        Err(e) => return internal(e),
    }
    match state.db.list_campaign_logs(id).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => internal(e),
    }
}

/// Build the API router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/leads", post(create_lead))
        .route("/api/leads/{id}", get(get_lead))
        .route("/api/leads/{id}/activity", get(get_activity))
        .route("/api/leads/{id}/route", post(route))
        .route("/api/leads/{id}/claim", post(claim))
        .route("/api/enrollments", post(create_enrollment))
        .route("/api/enrollments/{id}", get(get_enrollment))
        .route("/api/enrollments/{id}/logs", get(get_enrollment_logs))
        .route("/api/enrollments/{id}/pause", post(pause_enrollment))
        .route("/api/enrollments/{id}/resume", post(resume_enrollment))
        .with_state(state)
}
