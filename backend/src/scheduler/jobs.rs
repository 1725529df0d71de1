// Default background jobs wired into the scheduler.

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{DEFAULT_JOB_TIMEOUT, JobHandler, Scheduler};
use crate::automation::AutomationEngine;
use crate::notify::WebhookDispatcher;
use crate::sla::SlaEngine;

/// Tickets per batch for the scheduled rule evaluation.
const AUTOMATION_BATCH_SIZE: i64 = 50;
/// Rows per delete batch in the cleanup job.
const CLEANUP_BATCH_SIZE: i64 = 500;
/// Pause between cleanup batches to keep store pressure down.
const CLEANUP_BATCH_PAUSE: Duration = Duration::from_millis(100);

pub struct JobContext {
    pub pool: PgPool,
    pub sla: Arc<SlaEngine>,
    pub automation: Arc<AutomationEngine>,
    pub dispatcher: Arc<WebhookDispatcher>,
}

/// Register the default periodic jobs.
pub async fn register_default_jobs(scheduler: &Scheduler, ctx: Arc<JobContext>) {
    scheduler
        .add_job("sla_check", "every_15m", DEFAULT_JOB_TIMEOUT, sla_check(ctx.clone()))
        .await;
    scheduler
        .add_job(
            "automation_rules",
            "every_5m",
            DEFAULT_JOB_TIMEOUT,
            automation_rules(ctx.clone()),
        )
        .await;
    scheduler
        .add_job(
            "cleanup_expired_data",
            "daily_02:00",
            DEFAULT_JOB_TIMEOUT,
            cleanup_expired_data(ctx.clone()),
        )
        .await;
    scheduler
        .add_job(
            "update_statistics",
            "hourly",
            DEFAULT_JOB_TIMEOUT,
            update_statistics(ctx.clone()),
        )
        .await;
    scheduler
        .add_job("webhook_retry", "every_1m", DEFAULT_JOB_TIMEOUT, webhook_retry(ctx))
        .await;
}

fn sla_check(ctx: Arc<JobContext>) -> JobHandler {
    Arc::new(move || {
        let ctx = ctx.clone();
        Box::pin(async move {
            let result = ctx.sla.run_sweep().await.map_err(|e| e.to_string())?;
            if !result.errors.is_empty() {
                return Err(format!(
                    "sweep finished with {} contained errors: {}",
                    result.errors.len(),
                    result.errors.join("; ")
                ));
            }
            Ok(())
        })
    })
}

fn automation_rules(ctx: Arc<JobContext>) -> JobHandler {
    Arc::new(move || {
        let ctx = ctx.clone();
        Box::pin(async move {
            let processed = ctx
                .automation
                .run_scheduled_sweep(AUTOMATION_BATCH_SIZE)
                .await
                .map_err(|e| e.to_string())?;
            info!("scheduled rule evaluation covered {} tickets", processed);
            Ok(())
        })
    })
}

fn update_statistics(ctx: Arc<JobContext>) -> JobHandler {
    Arc::new(move || {
        let ctx = ctx.clone();
        Box::pin(async move {
            let updated = ctx
                .sla
                .recompute_compliance_rates()
                .await
                .map_err(|e| e.to_string())?;
            info!("refreshed compliance rates on {} SLA configs", updated);
            Ok(())
        })
    })
}

fn webhook_retry(ctx: Arc<JobContext>) -> JobHandler {
    Arc::new(move || {
        let ctx = ctx.clone();
        Box::pin(async move {
            let retried = ctx
                .dispatcher
                .run_retry_sweep()
                .await
                .map_err(|e| e.to_string())?;
            if retried > 0 {
                info!("retried {} webhook deliveries", retried);
            }
            Ok(())
        })
    })
}

fn cleanup_expired_data(ctx: Arc<JobContext>) -> JobHandler {
    Arc::new(move || {
        let ctx = ctx.clone();
        Box::pin(async move {
            let mut total = 0u64;

            total += delete_batched(
                &ctx.pool,
                "DELETE FROM otp_codes WHERE id IN (
                    SELECT id FROM otp_codes WHERE expires_at < NOW() - INTERVAL '30 minutes' LIMIT $1
                )",
            )
            .await?;

            total += delete_batched(
                &ctx.pool,
                "DELETE FROM login_attempts WHERE id IN (
                    SELECT id FROM login_attempts WHERE created_at < NOW() - INTERVAL '7 days' LIMIT $1
                )",
            )
            .await?;

            total += delete_batched(
                &ctx.pool,
                "DELETE FROM refresh_tokens WHERE id IN (
                    SELECT id FROM refresh_tokens
                    WHERE (revoked = TRUE OR expires_at < NOW())
                      AND created_at < NOW() - INTERVAL '30 days'
                    LIMIT $1
                )",
            )
            .await?;

            info!("cleanup removed {} expired rows", total);
            Ok(())
        })
    })
}

/// Delete in bounded batches with a pause between them. Cancellation (the
/// job timeout) is observed at every await.
async fn delete_batched(pool: &PgPool, sql: &str) -> Result<u64, String> {
    let mut total = 0u64;
    loop {
        let affected = sqlx::query(sql)
            .bind(CLEANUP_BATCH_SIZE)
            .execute(pool)
            .await
            .map_err(|e| e.to_string())?
            .rows_affected();
        total += affected;
        if affected < CLEANUP_BATCH_SIZE as u64 {
            break;
        }
        tokio::time::sleep(CLEANUP_BATCH_PAUSE).await;
    }
    Ok(total)
}
