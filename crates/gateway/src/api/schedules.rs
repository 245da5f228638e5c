//! Schedule CRUD, pause/resume, and cron preview endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use uuid::Uuid;

use courier_domain::model::EmailDeliveryConfig;

use crate::service::{CreateScheduleInput, UpdateScheduleInput};
use crate::state::AppState;

use super::auth::TenantContext;
use super::ApiError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/schedules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub report_definition_id: Uuid,
    pub name: String,
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub email_delivery_config: Option<EmailDeliveryConfig>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

pub async fn create_schedule(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = state
        .schedules
        .create(CreateScheduleInput {
            tenant_id: ctx.tenant_id,
            tenant_tier: ctx.tier,
            report_definition_id: req.report_definition_id,
            name: req.name,
            cron_expression: req.cron_expression,
            timezone: req.timezone,
            email_delivery_config: req.email_delivery_config,
            created_by: ctx.user_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/schedules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub is_active: Option<bool>,
}

fn default_limit() -> usize {
    20
}

pub async fn list_schedules(
    State(state): State<AppState>,
    ctx: TenantContext,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state
        .schedules
        .list(
            ctx.tenant_id,
            params.cursor.as_deref(),
            params.limit,
            params.is_active,
        )
        .await?;
    Ok(Json(serde_json::json!({
        "items": page.items,
        "next_cursor": page.next_cursor,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET / PUT / DELETE /v1/schedules/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_schedule(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = state.schedules.get(id, ctx.tenant_id).await?;
    Ok(Json(schedule))
}

#[derive(Debug, Deserialize)]
pub struct UpdateScheduleRequest {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub email_delivery_config: Option<EmailDeliveryConfig>,
}

pub async fn update_schedule(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = state
        .schedules
        .update(
            id,
            ctx.tenant_id,
            UpdateScheduleInput {
                name: req.name,
                cron_expression: req.cron_expression,
                timezone: req.timezone,
                email_delivery_config: req.email_delivery_config,
            },
        )
        .await?;
    Ok(Json(schedule))
}

pub async fn delete_schedule(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.schedules.delete(id, ctx.tenant_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PATCH /v1/schedules/:id/pause | /resume
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn pause_schedule(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = state.schedules.pause(id, ctx.tenant_id).await?;
    Ok(Json(schedule))
}

pub async fn resume_schedule(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let schedule = state.schedules.resume(id, ctx.tenant_id).await?;
    Ok(Json(schedule))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/schedules/cron/preview
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_preview_count")]
    pub count: usize,
}

fn default_preview_count() -> usize {
    5
}

pub async fn preview_cron(
    State(state): State<AppState>,
    _ctx: TenantContext,
    Json(req): Json<PreviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let preview = state
        .schedules
        .preview(&req.cron_expression, &req.timezone, req.count)?;
    Ok(Json(serde_json::json!({
        "description": preview.description,
        "next_runs": preview.next_runs,
    })))
}
