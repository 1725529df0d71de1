// HTTP surface for the Triage core.
//
// Authentication is a collaborator: the gateway injects the acting
// principal as X-Actor-Id / X-Actor-Role headers, extracted here.

pub mod automation;
pub mod tickets;
pub mod webhooks;

use axum::{
    Json,
    extract::{FromRequestParts, State},
    http::request::Parts,
    response::IntoResponse,
};
use std::sync::Arc;

use crate::AppState;
use crate::error::AppError;
use crate::events::Actor;

/// The authenticated principal, taken from gateway-injected headers.
pub struct ActorContext(pub Actor);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-actor-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        let role = parts
            .headers
            .get("x-actor-role")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        match (id, role) {
            (Some(id), Some(role)) => Ok(ActorContext(Actor::user(id, role))),
            _ => Err(AppError::PermissionDenied(
                "missing actor context".to_string(),
            )),
        }
    }
}

/// Liveness plus database health and pool statistics.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_healthy = crate::database::health_check(&state.pool).await;
    let pool = crate::database::get_pool_stats(&state.pool);
    Json(serde_json::json!({
        "status": if db_healthy { "ok" } else { "degraded" },
        "database": db_healthy,
        "pool": pool,
    }))
}

/// Scheduler introspection: the registered jobs and their next fire times.
pub async fn scheduler_jobs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scheduler.list_jobs().await)
}
