use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use triage_shared::{WebhookConfig, WebhookLog, WebhookProvider, normalize_string_list, parse_string_list};

use super::ActorContext;
use crate::AppState;
use crate::error::{ApiResult, AppError};
use crate::events::EventKind;
use crate::pagination::{PaginatedResponse, PaginationParams};

#[derive(Debug, Deserialize)]
pub struct SaveWebhookRequest {
    pub name: String,
    pub provider: String,
    pub url: String,
    pub secret: Option<String>,
    pub is_enabled: Option<bool>,
    /// JSON array, JSON-encoded-string array, or comma-separated string.
    pub events: serde_json::Value,
    pub template: Option<String>,
    pub filter_rules: Option<serde_json::Value>,
    pub max_retries: Option<i32>,
    pub retry_interval_seconds: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub rate_limit: Option<i32>,
}

pub fn webhook_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_configs).post(create_config))
        .route("/:id", get(get_config).put(update_config).delete(delete_config))
        .route("/:id/test", post(test_config))
}

fn validate_webhook(payload: &SaveWebhookRequest) -> ApiResult<(WebhookProvider, serde_json::Value)> {
    if payload.name.trim().is_empty() {
        return Err(AppError::validation("name", "must not be empty"));
    }
    if payload.url.trim().is_empty() {
        return Err(AppError::validation("url", "must not be empty"));
    }
    let provider = WebhookProvider::parse(&payload.provider)
        .ok_or_else(|| AppError::validation("provider", &format!("unknown value '{}'", payload.provider)))?;

    let events = normalize_string_list(&payload.events);
    let tags = parse_string_list(&events);
    if tags.is_empty() {
        return Err(AppError::validation("events", "at least one event tag is required"));
    }
    for tag in &tags {
        if EventKind::parse(tag).is_none() {
            return Err(AppError::validation("events", &format!("unknown event tag '{tag}'")));
        }
    }

    Ok((provider, events))
}

async fn list_configs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> ApiResult<Json<PaginatedResponse<WebhookConfig>>> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_configs")
        .fetch_one(&state.pool)
        .await?;
    let rows = sqlx::query_as::<_, WebhookConfig>(
        "SELECT * FROM webhook_configs ORDER BY created_at DESC LIMIT $1 OFFSET $2",
    )
    .bind(params.limit())
    .bind(params.offset())
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(PaginatedResponse::new(rows, &params, total)))
}

async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<WebhookConfig>> {
    let config = sqlx::query_as::<_, WebhookConfig>("SELECT * FROM webhook_configs WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::not_found("Webhook config"))?;
    Ok(Json(config))
}

async fn create_config(
    State(state): State<Arc<AppState>>,
    _actor: ActorContext,
    Json(payload): Json<SaveWebhookRequest>,
) -> ApiResult<(StatusCode, Json<WebhookConfig>)> {
    let (provider, events) = validate_webhook(&payload)?;

    let config = sqlx::query_as::<_, WebhookConfig>(
        r#"
        INSERT INTO webhook_configs
            (name, provider, url, secret, is_enabled, events, template, filter_rules,
             max_retries, retry_interval_seconds, timeout_seconds, rate_limit)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING *
        "#,
    )
    .bind(&payload.name)
    .bind(provider)
    .bind(payload.url.trim())
    .bind(&payload.secret)
    .bind(payload.is_enabled.unwrap_or(true))
    .bind(&events)
    .bind(&payload.template)
    .bind(payload.filter_rules.clone().unwrap_or_else(|| serde_json::json!({})))
    .bind(payload.max_retries.unwrap_or(3))
    .bind(payload.retry_interval_seconds.unwrap_or(60))
    .bind(payload.timeout_seconds.unwrap_or(10))
    .bind(payload.rate_limit.unwrap_or(0))
    .fetch_one(&state.pool)
    .await?;

    Ok((StatusCode::CREATED, Json(config)))
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    _actor: ActorContext,
    Json(payload): Json<SaveWebhookRequest>,
) -> ApiResult<Json<WebhookConfig>> {
    let (provider, events) = validate_webhook(&payload)?;

    let config = sqlx::query_as::<_, WebhookConfig>(
        r#"
        UPDATE webhook_configs SET
            name = $2, provider = $3, url = $4, secret = $5, is_enabled = $6, events = $7,
            template = $8, filter_rules = $9, max_retries = $10, retry_interval_seconds = $11,
            timeout_seconds = $12, rate_limit = $13, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&payload.name)
    .bind(provider)
    .bind(payload.url.trim())
    .bind(&payload.secret)
    .bind(payload.is_enabled.unwrap_or(true))
    .bind(&events)
    .bind(&payload.template)
    .bind(payload.filter_rules.clone().unwrap_or_else(|| serde_json::json!({})))
    .bind(payload.max_retries.unwrap_or(3))
    .bind(payload.retry_interval_seconds.unwrap_or(60))
    .bind(payload.timeout_seconds.unwrap_or(10))
    .bind(payload.rate_limit.unwrap_or(0))
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::not_found("Webhook config"))?;

    Ok(Json(config))
}

async fn delete_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    _actor: ActorContext,
) -> ApiResult<StatusCode> {
    let result = sqlx::query("DELETE FROM webhook_configs WHERE id = $1")
        .bind(id)
        .execute(&state.pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Webhook config"));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Fire a fixed `system.alert` through the normal delivery path.
async fn test_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    _actor: ActorContext,
) -> ApiResult<Json<WebhookLog>> {
    Ok(Json(state.dispatcher.test_config(id).await?))
}
