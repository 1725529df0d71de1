use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use triage_shared::{Ticket, TicketComment};

use super::ActorContext;
use crate::AppState;
use crate::error::{ApiResult, AppError};
use crate::pagination::{PaginatedResponse, PaginationParams};
use crate::tickets::{
    BulkUpdateOutcome, CreateTicketRequest, TicketListParams, TicketStats, UpdateTicketRequest,
};

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub assigned_to: Option<i64>,
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub assigned_to: i64,
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EscalateRequest {
    pub target_user_id: i64,
    pub reason: String,
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
    pub comment: Option<String>,
    pub resolution_notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkUpdateRequest {
    pub ids: Vec<i64>,
    pub patch: UpdateTicketRequest,
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub content: String,
}

pub fn ticket_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_tickets).post(create_ticket))
        .route("/stats", get(ticket_stats))
        .route("/bulk", post(bulk_update))
        .route(
            "/:id",
            get(get_ticket)
                .put(update_ticket)
                .patch(update_ticket)
                .delete(delete_ticket),
        )
        .route("/:id/assign", post(assign_ticket))
        .route("/:id/transfer", post(transfer_ticket))
        .route("/:id/escalate", post(escalate_ticket))
        .route("/:id/status", post(update_status))
        .route("/:id/history", get(ticket_history))
        .route("/:id/comments", get(list_comments).post(add_comment))
}

async fn list_tickets(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TicketListParams>,
) -> ApiResult<Json<PaginatedResponse<Ticket>>> {
    Ok(Json(state.tickets.list(&params).await?))
}

async fn create_ticket(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Json(payload): Json<CreateTicketRequest>,
) -> ApiResult<(StatusCode, Json<Ticket>)> {
    let ticket = state.tickets.create(&payload, &actor.0).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Ticket>> {
    let ticket = state.tickets.get(id).await?;
    state.tickets.increment_view(id).await;
    Ok(Json(ticket))
}

async fn update_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    actor: ActorContext,
    Json(payload): Json<UpdateTicketRequest>,
) -> ApiResult<Json<Ticket>> {
    Ok(Json(state.tickets.update(id, &payload, &actor.0).await?))
}

async fn delete_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    actor: ActorContext,
) -> ApiResult<StatusCode> {
    state.tickets.delete(id, &actor.0).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn assign_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    actor: ActorContext,
    Json(payload): Json<AssignRequest>,
) -> ApiResult<Json<Ticket>> {
    let ticket = state
        .tickets
        .assign(id, payload.assigned_to, &actor.0, payload.comment.as_deref())
        .await?;
    Ok(Json(ticket))
}

async fn transfer_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    actor: ActorContext,
    Json(payload): Json<TransferRequest>,
) -> ApiResult<Json<Ticket>> {
    let ticket = state
        .tickets
        .assign(id, Some(payload.assigned_to), &actor.0, payload.comment.as_deref())
        .await?;
    Ok(Json(ticket))
}

async fn escalate_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    actor: ActorContext,
    Json(payload): Json<EscalateRequest>,
) -> ApiResult<Json<Ticket>> {
    if payload.reason.trim().is_empty() {
        return Err(AppError::validation("reason", "must not be empty"));
    }
    let ticket = state
        .tickets
        .escalate(
            id,
            payload.target_user_id,
            &actor.0,
            &payload.reason,
            payload.comment.as_deref(),
        )
        .await?;
    Ok(Json(ticket))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    actor: ActorContext,
    Json(payload): Json<StatusRequest>,
) -> ApiResult<Json<Ticket>> {
    let ticket = state
        .tickets
        .update_status(
            id,
            &payload.status,
            &actor.0,
            payload.comment.as_deref(),
            payload.resolution_notes.as_deref(),
        )
        .await?;
    Ok(Json(ticket))
}

async fn bulk_update(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
    Json(payload): Json<BulkUpdateRequest>,
) -> ApiResult<Json<BulkUpdateOutcome>> {
    if payload.ids.is_empty() {
        return Err(AppError::validation("ids", "must not be empty"));
    }
    Ok(Json(
        state.tickets.bulk_update(&payload.ids, &payload.patch, &actor.0).await,
    ))
}

async fn ticket_stats(
    State(state): State<Arc<AppState>>,
    actor: ActorContext,
) -> ApiResult<Json<TicketStats>> {
    Ok(Json(state.tickets.stats(&actor.0).await?))
}

async fn ticket_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<PaginationParams>,
) -> ApiResult<Json<PaginatedResponse<triage_shared::TicketHistory>>> {
    state.tickets.get(id).await?;
    Ok(Json(
        crate::tickets::history::list(state.tickets.pool(), id, &params).await?,
    ))
}

async fn list_comments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<PaginationParams>,
) -> ApiResult<Json<PaginatedResponse<TicketComment>>> {
    Ok(Json(state.tickets.list_comments(id, &params).await?))
}

async fn add_comment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    actor: ActorContext,
    Json(payload): Json<CommentRequest>,
) -> ApiResult<(StatusCode, Json<TicketComment>)> {
    let comment = state
        .tickets
        .add_comment(id, &payload.content, &actor.0, false)
        .await?;
    Ok((StatusCode::CREATED, Json(comment)))
}
