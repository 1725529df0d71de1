use axum::{
    Router,
    http::Method,
    routing::get,
};
use chrono::FixedOffset;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod automation;
mod config;
mod database;
mod error;
mod events;
mod handlers;
mod notify;
mod pagination;
mod scheduler;
mod sla;
mod tickets;

pub use error::{ApiError, ApiResult, AppError};
pub use pagination::{PaginatedResponse, PaginationMeta, PaginationParams};

use automation::AutomationEngine;
use events::EventRouter;
use notify::WebhookDispatcher;
use scheduler::jobs::{JobContext, register_default_jobs};
use scheduler::Scheduler;
use sla::{FixedHolidays, HolidayOracle, NoHolidays, SlaEngine};
use tickets::TicketEngine;

pub struct AppState {
    pub pool: sqlx::PgPool,
    pub tickets: TicketEngine,
    pub automation: Arc<AutomationEngine>,
    pub sla: Arc<SlaEngine>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub scheduler: Arc<Scheduler>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let pool = database::create_pool(&config.database_url).await?;

    database::migrate(&pool).await?;

    // Engines share one event router; its consumers are wired after
    // construction because they hold the engines themselves.
    let events = Arc::new(EventRouter::new());
    let ticket_engine = TicketEngine::new(
        pool.clone(),
        events.clone(),
        config.automation.system_user_id,
    );
    let automation_engine = Arc::new(AutomationEngine::new(
        pool.clone(),
        ticket_engine.clone(),
        events.clone(),
        Duration::from_secs(config.automation.rule_timeout_secs),
    ));
    let dispatcher = Arc::new(WebhookDispatcher::new(pool.clone()));
    events.wire(automation_engine.clone(), dispatcher.clone());

    let offset = FixedOffset::east_opt(config.sla.utc_offset_minutes * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
    let holidays: Arc<dyn HolidayOracle> = if config.sla.holidays.is_empty() {
        Arc::new(NoHolidays)
    } else {
        Arc::new(FixedHolidays::new(config.sla.holidays.clone()))
    };
    let sla_engine = Arc::new(SlaEngine::new(
        pool.clone(),
        ticket_engine.clone(),
        events.clone(),
        offset,
        holidays,
    ));

    let scheduler = Arc::new(Scheduler::new());
    if config.scheduler_enabled {
        let ctx = Arc::new(JobContext {
            pool: pool.clone(),
            sla: sla_engine.clone(),
            automation: automation_engine.clone(),
            dispatcher: dispatcher.clone(),
        });
        register_default_jobs(&scheduler, ctx).await;
        scheduler.start();
    }

    let app_state = Arc::new(AppState {
        pool,
        tickets: ticket_engine,
        automation: automation_engine,
        sla: sla_engine,
        dispatcher,
        scheduler: scheduler.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Triage Ticket Platform API v1.0.0" }))
        .route("/health", get(handlers::health_check))
        .route("/api/v1/scheduler/jobs", get(handlers::scheduler_jobs))
        .nest("/api/v1/tickets", handlers::tickets::ticket_routes())
        .nest("/api/v1/automation", handlers::automation::automation_routes())
        .nest("/api/v1/webhooks", handlers::webhooks::webhook_routes())
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop();

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
