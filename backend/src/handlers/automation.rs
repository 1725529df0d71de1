use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;
use triage_shared::{
    AutomationLog, AutomationRule, NotificationTemplate, QuickReply, SlaConfig, TicketPriority,
    TicketType,
};

use super::ActorContext;
use crate::AppState;
use crate::automation::engine::{LogListParams, RuleListParams, RuleStats, SaveRuleRequest};
use crate::error::{ApiResult, AppError};
use crate::pagination::{PaginatedResponse, PaginationParams};

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/:id", get(get_rule).put(update_rule).delete(delete_rule))
        .route("/rules/:id/stats", get(rule_stats))
        .route("/logs", get(list_logs))
        .route("/sla", get(list_sla_configs).post(create_sla_config))
        .route("/sla/:id", get(get_sla_config).put(update_sla_config).delete(delete_sla_config))
        .route("/templates", get(list_templates).post(create_template))
        .route("/quick-replies", get(list_quick_replies).post(create_quick_reply))
}

// ===== Rules =====

async fn list_rules(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RuleListParams>,
) -> ApiResult<Json<PaginatedResponse<AutomationRule>>> {
    Ok(Json(state.automation.list_rules(&params).await?))
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Json(payload): Json<SaveRuleRequest>,
) -> ApiResult<(StatusCode, Json<AutomationRule>)> {
    let rule = state.automation.create_rule(&payload, &actor.0).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<AutomationRule>> {
    Ok(Json(state.automation.get_rule(id).await?))
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    _actor: ActorContext,
    Json(payload): Json<SaveRuleRequest>,
) -> ApiResult<Json<AutomationRule>> {
    Ok(Json(state.automation.update_rule(id, &payload).await?))
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    _actor: ActorContext,
) -> ApiResult<StatusCode> {
    state.automation.delete_rule(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rule_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<RuleStats>> {
    Ok(Json(state.automation.rule_stats(id).await?))
}

async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogListParams>,
) -> ApiResult<Json<PaginatedResponse<AutomationLog>>> {
    Ok(Json(state.automation.list_logs(&params).await?))
}

// ===== SLA configs =====

#[derive(Debug, Deserialize)]
pub struct SaveSlaRequest {
    pub name: String,
    pub is_active: Option<bool>,
    pub is_default: Option<bool>,
    pub ticket_type: Option<String>,
    pub priority: Option<String>,
    pub category_id: Option<i64>,
    pub assigned_to: Option<i64>,
    pub response_time_minutes: i32,
    pub resolution_time_minutes: i32,
    pub working_hours: Option<serde_json::Value>,
    pub exclude_weekends: Option<bool>,
    pub exclude_holidays: Option<bool>,
    pub escalation_rules: Option<serde_json::Value>,
}

struct ValidatedSla {
    ticket_type: Option<TicketType>,
    priority: Option<TicketPriority>,
    working_hours: serde_json::Value,
    escalation_rules: serde_json::Value,
}

fn validate_sla(payload: &SaveSlaRequest) -> ApiResult<ValidatedSla> {
    if payload.name.trim().is_empty() {
        return Err(AppError::validation("name", "must not be empty"));
    }
    if payload.response_time_minutes < 0 || payload.resolution_time_minutes < 0 {
        return Err(AppError::validation("response_time_minutes", "must not be negative"));
    }
    // Reported, not enforced.
    if payload.response_time_minutes > payload.resolution_time_minutes {
        warn!(
            "SLA config '{}' has response time above resolution time",
            payload.name
        );
    }

    let ticket_type = match payload.ticket_type.as_deref() {
        None => None,
        Some(s) => Some(
            TicketType::parse(s)
                .ok_or_else(|| AppError::validation("ticket_type", &format!("unknown value '{s}'")))?,
        ),
    };
    let priority = match payload.priority.as_deref() {
        None => None,
        Some(s) => Some(
            TicketPriority::parse(s)
                .ok_or_else(|| AppError::validation("priority", &format!("unknown value '{s}'")))?,
        ),
    };

    let escalation_rules = payload
        .escalation_rules
        .clone()
        .unwrap_or_else(|| serde_json::json!([]));
    serde_json::from_value::<Vec<triage_shared::EscalationRule>>(escalation_rules.clone())
        .map_err(|e| AppError::validation("escalation_rules", &e.to_string()))?;

    Ok(ValidatedSla {
        ticket_type,
        priority,
        working_hours: payload.working_hours.clone().unwrap_or_else(|| serde_json::json!({})),
        escalation_rules,
    })
}

async fn list_sla_configs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> ApiResult<Json<PaginatedResponse<SlaConfig>>> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sla_configs")
        .fetch_one(&state.pool)
        .await?;
    let rows = sqlx::query_as::<_, SlaConfig>(
        "SELECT * FROM sla_configs ORDER BY is_default DESC, created_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(params.limit())
    .bind(params.offset())
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(PaginatedResponse::new(rows, &params, total)))
}

async fn get_sla_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<SlaConfig>> {
    let config = sqlx::query_as::<_, SlaConfig>("SELECT * FROM sla_configs WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::not_found("SLA config"))?;
    Ok(Json(config))
}

async fn create_sla_config(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
    Json(payload): Json<SaveSlaRequest>,
) -> ApiResult<(StatusCode, Json<SlaConfig>)> {
    let validated = validate_sla(&payload)?;
    let is_default = payload.is_default.unwrap_or(false);

    let mut tx = state.pool.begin().await?;
    if is_default {
        // At most one active default: demote the current one.
        sqlx::query("UPDATE sla_configs SET is_default = FALSE WHERE is_default = TRUE")
            .execute(&mut *tx)
            .await?;
    }

    let config = sqlx::query_as::<_, SlaConfig>(
        r#"
        INSERT INTO sla_configs
            (name, is_active, is_default, ticket_type, priority, category_id, assigned_to,
             response_time_minutes, resolution_time_minutes, working_hours,
             exclude_weekends, exclude_holidays, escalation_rules)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING *
        "#,
    )
    .bind(&payload.name)
    .bind(payload.is_active.unwrap_or(true))
    .bind(is_default)
    .bind(validated.ticket_type)
    .bind(validated.priority)
    .bind(payload.category_id)
    .bind(payload.assigned_to)
    .bind(payload.response_time_minutes)
    .bind(payload.resolution_time_minutes)
    .bind(&validated.working_hours)
    .bind(payload.exclude_weekends.unwrap_or(false))
    .bind(payload.exclude_holidays.unwrap_or(false))
    .bind(&validated.escalation_rules)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(config)))
}

async fn update_sla_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    _actor: ActorContext,
    Json(payload): Json<SaveSlaRequest>,
) -> ApiResult<Json<SlaConfig>> {
    let validated = validate_sla(&payload)?;
    let is_default = payload.is_default.unwrap_or(false);

    let mut tx = state.pool.begin().await?;
    if is_default {
        sqlx::query("UPDATE sla_configs SET is_default = FALSE WHERE is_default = TRUE AND id <> $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }

    let config = sqlx::query_as::<_, SlaConfig>(
        r#"
        UPDATE sla_configs SET
            name = $2, is_active = $3, is_default = $4, ticket_type = $5, priority = $6,
            category_id = $7, assigned_to = $8, response_time_minutes = $9,
            resolution_time_minutes = $10, working_hours = $11, exclude_weekends = $12,
            exclude_holidays = $13, escalation_rules = $14, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&payload.name)
    .bind(payload.is_active.unwrap_or(true))
    .bind(is_default)
    .bind(validated.ticket_type)
    .bind(validated.priority)
    .bind(payload.category_id)
    .bind(payload.assigned_to)
    .bind(payload.response_time_minutes)
    .bind(payload.resolution_time_minutes)
    .bind(&validated.working_hours)
    .bind(payload.exclude_weekends.unwrap_or(false))
    .bind(payload.exclude_holidays.unwrap_or(false))
    .bind(&validated.escalation_rules)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::not_found("SLA config"))?;

    tx.commit().await?;
    Ok(Json(config))
}

async fn delete_sla_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    _actor: ActorContext,
) -> ApiResult<StatusCode> {
    let result = sqlx::query("DELETE FROM sla_configs WHERE id = $1")
        .bind(id)
        .execute(&state.pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("SLA config"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ===== Notification templates =====

#[derive(Debug, Deserialize)]
pub struct SaveTemplateRequest {
    pub name: String,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub is_active: Option<bool>,
}

async fn list_templates(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> ApiResult<Json<PaginatedResponse<NotificationTemplate>>> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notification_templates")
        .fetch_one(&state.pool)
        .await?;
    let rows = sqlx::query_as::<_, NotificationTemplate>(
        "SELECT * FROM notification_templates ORDER BY name ASC LIMIT $1 OFFSET $2",
    )
    .bind(params.limit())
    .bind(params.offset())
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(PaginatedResponse::new(rows, &params, total)))
}

async fn create_template(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
    Json(payload): Json<SaveTemplateRequest>,
) -> ApiResult<(StatusCode, Json<NotificationTemplate>)> {
    if payload.name.trim().is_empty() {
        return Err(AppError::validation("name", "must not be empty"));
    }
    let template = sqlx::query_as::<_, NotificationTemplate>(
        r#"
        INSERT INTO notification_templates (name, subject, body, is_active)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(&payload.name)
    .bind(payload.subject.as_deref().unwrap_or(""))
    .bind(payload.body.as_deref().unwrap_or(""))
    .bind(payload.is_active.unwrap_or(true))
    .fetch_one(&state.pool)
    .await?;
    Ok((StatusCode::CREATED, Json(template)))
}

// ===== Quick replies =====

#[derive(Debug, Deserialize)]
pub struct SaveQuickReplyRequest {
    pub name: String,
    pub content: String,
    pub sort_order: Option<i32>,
}

async fn list_quick_replies(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<QuickReply>>> {
    let rows = sqlx::query_as::<_, QuickReply>(
        "SELECT * FROM quick_replies WHERE is_active = TRUE ORDER BY sort_order ASC, name ASC",
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

async fn create_quick_reply(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
    Json(payload): Json<SaveQuickReplyRequest>,
) -> ApiResult<(StatusCode, Json<QuickReply>)> {
    if payload.name.trim().is_empty() || payload.content.trim().is_empty() {
        return Err(AppError::validation("content", "name and content must not be empty"));
    }
    let reply = sqlx::query_as::<_, QuickReply>(
        "INSERT INTO quick_replies (name, content, sort_order) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(&payload.name)
    .bind(&payload.content)
    .bind(payload.sort_order.unwrap_or(0))
    .fetch_one(&state.pool)
    .await?;
    Ok((StatusCode::CREATED, Json(reply)))
}
