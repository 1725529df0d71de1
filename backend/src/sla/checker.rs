// SLA Checker - violation detection and escalation application.

use chrono::{FixedOffset, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};
use triage_shared::{EscalationActionKind, EscalationRule, SlaConfig, Ticket, TicketPriority};

use super::deadline::{HolidayOracle, compute_deadlines};
use super::policy::match_policy;
use crate::error::ApiResult;
use crate::events::{Actor, EventKind, EventRouter, TicketEvent};
use crate::tickets::{TicketEngine, UpdateTicketRequest};

/// Result of one `check_sla` evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct SlaCheckOutcome {
    pub config_id: i64,
    pub response_violated: bool,
    pub resolution_violated: bool,
    pub response_overdue_minutes: i64,
    pub resolution_overdue_minutes: i64,
}

impl SlaCheckOutcome {
    pub fn violated(&self) -> bool {
        self.response_violated || self.resolution_violated
    }

    pub fn overdue_minutes(&self) -> i64 {
        self.response_overdue_minutes.max(self.resolution_overdue_minutes)
    }
}

/// Aggregate outcome of a full sweep.
#[derive(Debug, Default, Serialize)]
pub struct SlaSweepResult {
    pub tickets_checked: i32,
    pub response_violations: i32,
    pub resolution_violations: i32,
    pub escalations_triggered: i32,
    pub errors: Vec<String>,
}

pub struct SlaEngine {
    pool: PgPool,
    tickets: TicketEngine,
    events: Arc<EventRouter>,
    offset: FixedOffset,
    holidays: Arc<dyn HolidayOracle>,
}

impl SlaEngine {
    pub fn new(
        pool: PgPool,
        tickets: TicketEngine,
        events: Arc<EventRouter>,
        offset: FixedOffset,
        holidays: Arc<dyn HolidayOracle>,
    ) -> Self {
        Self {
            pool,
            tickets,
            events,
            offset,
            holidays,
        }
    }

    /// Evaluate one ticket against its matched policy. None when no policy
    /// applies.
    pub async fn check_sla(&self, ticket: &Ticket) -> ApiResult<Option<SlaCheckOutcome>> {
        let configs = self.load_active_configs().await?;
        self.check_against(ticket, &configs).await
    }

    async fn check_against(
        &self,
        ticket: &Ticket,
        configs: &[SlaConfig],
    ) -> ApiResult<Option<SlaCheckOutcome>> {
        let Some(config) = match_policy(ticket, configs) else {
            return Ok(None);
        };

        let (response_deadline, resolution_deadline) =
            compute_deadlines(ticket.created_at, config, self.offset, self.holidays.as_ref());

        let now = Utc::now();

        let response_overdue = (now - response_deadline).num_minutes().max(0);
        let has_reply = self.tickets.has_non_system_comment(ticket.id).await?;
        let response_violated = now > response_deadline && !has_reply;

        let resolution_overdue = (now - resolution_deadline).num_minutes().max(0);
        let resolution_violated = now > resolution_deadline && ticket.status.counts_for_sla();

        Ok(Some(SlaCheckOutcome {
            config_id: config.id,
            response_violated,
            resolution_violated,
            response_overdue_minutes: if response_violated { response_overdue } else { 0 },
            resolution_overdue_minutes: if resolution_violated { resolution_overdue } else { 0 },
        }))
    }

    /// Full sweep over all tickets still counting against SLAs. Per-ticket
    /// failures are contained and reported in the result.
    pub async fn run_sweep(&self) -> ApiResult<SlaSweepResult> {
        let mut result = SlaSweepResult::default();

        let configs = self.load_active_configs().await?;
        if configs.is_empty() {
            return Ok(result);
        }

        let tickets = sqlx::query_as::<_, Ticket>(
            r#"
            SELECT * FROM tickets
            WHERE deleted_at IS NULL
              AND status IN ('open', 'in_progress', 'pending')
            ORDER BY
                CASE priority
                    WHEN 'critical' THEN 1
                    WHEN 'urgent' THEN 2
                    WHEN 'high' THEN 3
                    WHEN 'normal' THEN 4
                    ELSE 5
                END,
                created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        result.tickets_checked = tickets.len() as i32;

        for ticket in &tickets {
            match self.check_against(ticket, &configs).await {
                Ok(Some(outcome)) => {
                    if outcome.response_violated {
                        result.response_violations += 1;
                    }
                    if outcome.resolution_violated {
                        result.resolution_violations += 1;
                    }

                    if let Err(e) = self.update_config_stats(outcome.config_id, outcome.violated()).await {
                        result.errors.push(format!(
                            "failed to update stats for config {}: {}",
                            outcome.config_id, e
                        ));
                    }

                    if outcome.violated() {
                        let config = configs.iter().find(|c| c.id == outcome.config_id);
                        if let Some(config) = config {
                            match self.apply_escalations(ticket, config, &outcome).await {
                                Ok(fired) => result.escalations_triggered += fired,
                                Err(e) => result.errors.push(format!(
                                    "escalation failed for ticket {}: {}",
                                    ticket.id, e
                                )),
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    result
                        .errors
                        .push(format!("SLA check failed for ticket {}: {}", ticket.id, e));
                }
            }
        }

        info!(
            "SLA sweep: {} tickets, {} response violations, {} resolution violations, {} escalations",
            result.tickets_checked,
            result.response_violations,
            result.resolution_violations,
            result.escalations_triggered
        );

        Ok(result)
    }

    /// Fire every escalation rule whose threshold is reached, at most once
    /// per sweep, each with a system comment through the ticket engine.
    async fn apply_escalations(
        &self,
        ticket: &Ticket,
        config: &SlaConfig,
        outcome: &SlaCheckOutcome,
    ) -> ApiResult<i32> {
        let mut rules = config
            .parse_escalation_rules()
            .map_err(|e| crate::error::AppError::internal(format!("bad escalation rules: {e}")))?;
        rules.sort_by_key(|r| r.trigger_minutes);

        let overdue = outcome.overdue_minutes();
        let mut fired = 0;

        for rule in rules.iter().filter(|r| r.trigger_minutes <= overdue) {
            match self.fire_escalation(ticket, rule, overdue).await {
                Ok(()) => fired += 1,
                Err(e) => {
                    warn!("escalation rule on config {} failed: {}", config.id, e);
                }
            }
        }

        Ok(fired)
    }

    async fn fire_escalation(
        &self,
        ticket: &Ticket,
        rule: &EscalationRule,
        overdue_minutes: i64,
    ) -> ApiResult<()> {
        let actor = Actor::system();

        match rule.action {
            EscalationActionKind::EscalateToManager => {
                let target = match rule.target_user_id {
                    Some(id) => Some(id),
                    None => self.tickets.first_active_admin().await?,
                };
                let Some(target) = target else {
                    warn!("no escalation target for ticket {}, skipping", ticket.id);
                    return Ok(());
                };

                self.tickets
                    .escalate(
                        ticket.id,
                        target,
                        &actor,
                        &format!("SLA overdue by {overdue_minutes} minutes"),
                        None,
                    )
                    .await?;

                // The escalation bump is one level; the SLA contract is "at
                // least high".
                let after = self.tickets.get(ticket.id).await?;
                if after.priority < TicketPriority::High {
                    let patch = UpdateTicketRequest {
                        priority: Some(TicketPriority::High.as_str().to_string()),
                        ..Default::default()
                    };
                    self.tickets.update(ticket.id, &patch, &actor).await?;
                }

                self.tickets
                    .add_comment(
                        ticket.id,
                        &format!(
                            "SLA escalation: reassigned to user {target} after {overdue_minutes} minutes overdue"
                        ),
                        &actor,
                        true,
                    )
                    .await?;
            }
            EscalationActionKind::NotifyAdmin => {
                let recipients = rule.notify_users.clone().unwrap_or_default();
                let event = TicketEvent::for_ticket(
                    EventKind::SystemAlert,
                    format!("SLA violation: {}", ticket.title),
                    ticket,
                    &actor,
                )
                .with_data("overdue_minutes", serde_json::json!(overdue_minutes))
                .with_data("recipients", serde_json::json!(recipients));
                self.events.publish(event).await;

                self.tickets
                    .add_comment(
                        ticket.id,
                        &format!(
                            "SLA escalation: administrators notified after {overdue_minutes} minutes overdue"
                        ),
                        &actor,
                        true,
                    )
                    .await?;
            }
            EscalationActionKind::ChangePriority => {
                let bumped = ticket.priority.bumped();
                if bumped != ticket.priority {
                    let patch = UpdateTicketRequest {
                        priority: Some(bumped.as_str().to_string()),
                        ..Default::default()
                    };
                    self.tickets.update(ticket.id, &patch, &actor).await?;
                }

                self.tickets
                    .add_comment(
                        ticket.id,
                        &format!(
                            "SLA escalation: priority raised to {bumped} after {overdue_minutes} minutes overdue"
                        ),
                        &actor,
                        true,
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// Atomic store-side counter updates; compliance is recomputed from the
    /// post-increment values in the same statement.
    async fn update_config_stats(&self, config_id: i64, violated: bool) -> ApiResult<()> {
        sqlx::query(
            r#"
            UPDATE sla_configs SET
                applied_count = applied_count + 1,
                violation_count = violation_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                compliance_rate =
                    ((applied_count + 1 - (violation_count + CASE WHEN $2 THEN 1 ELSE 0 END))::double precision
                        / (applied_count + 1)) * 100,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(config_id)
        .bind(violated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Hourly statistics refresh: recompute every config's compliance rate
    /// from its counters.
    pub async fn recompute_compliance_rates(&self) -> ApiResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sla_configs SET
                compliance_rate = CASE
                    WHEN applied_count > 0
                    THEN ((applied_count - violation_count)::double precision / applied_count) * 100
                    ELSE 0
                END,
                updated_at = NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn load_active_configs(&self) -> ApiResult<Vec<SlaConfig>> {
        Ok(sqlx::query_as::<_, SlaConfig>(
            "SELECT * FROM sla_configs WHERE is_active = TRUE ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}
