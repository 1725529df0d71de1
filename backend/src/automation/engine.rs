// Automation Engine - rule CRUD, the execution protocol, statistics, and
// the structured execution log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use triage_shared::{AutomationLog, AutomationRule, RuleType, Ticket, parse_actions, parse_conditions};

use super::actions::validate_actions;
use super::conditions::evaluate_conditions;
use super::executor::{ActionExecutor, ExecutedAction};
use super::AutomationError;
use crate::error::{ApiResult, AppError};
use crate::events::{Actor, EventKind, EventRouter, TicketEvent};
use crate::pagination::{PaginatedResponse, PaginationParams, QueryBuilder};
use crate::tickets::TicketEngine;

#[derive(Debug, Clone, Deserialize)]
pub struct SaveRuleRequest {
    pub name: String,
    pub description: Option<String>,
    pub rule_type: String,
    pub is_active: Option<bool>,
    pub priority: Option<i32>,
    pub trigger_event: String,
    pub conditions: Option<serde_json::Value>,
    pub actions: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleListParams {
    #[serde(flatten)]
    pub pagination: PaginationParams,
    pub rule_type: Option<String>,
    pub trigger_event: Option<String>,
    /// Tri-state: absent means "any".
    pub is_active: Option<bool>,
    /// Case-insensitive substring over name and description.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogListParams {
    #[serde(flatten)]
    pub pagination: PaginationParams,
    pub rule_id: Option<i64>,
    pub ticket_id: Option<i64>,
    pub success: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct RuleStats {
    pub rule_id: i64,
    pub name: String,
    pub execution_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub average_exec_time_ms: f64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub success_rate: f64,
}

/// Outcome of one rule execution, before it is logged.
struct RuleOutcome {
    success: bool,
    error: Option<String>,
    actions_executed: Vec<ExecutedAction>,
    changes: serde_json::Map<String, serde_json::Value>,
}

impl RuleOutcome {
    /// A condition miss is still a successful (empty) execution.
    fn condition_miss() -> Self {
        Self {
            success: true,
            error: None,
            actions_executed: Vec::new(),
            changes: serde_json::Map::new(),
        }
    }

    fn failure(message: String, actions_executed: Vec<ExecutedAction>) -> Self {
        Self {
            success: false,
            error: Some(message),
            actions_executed,
            changes: serde_json::Map::new(),
        }
    }
}

pub struct AutomationEngine {
    pool: PgPool,
    executor: ActionExecutor,
    rule_timeout: Duration,
}

impl AutomationEngine {
    pub fn new(
        pool: PgPool,
        tickets: TicketEngine,
        events: Arc<EventRouter>,
        rule_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            executor: ActionExecutor::new(tickets, events),
            rule_timeout,
        }
    }

    // ===== CRUD =====

    pub async fn create_rule(&self, req: &SaveRuleRequest, actor: &Actor) -> ApiResult<AutomationRule> {
        let (rule_type, conditions, actions) = self.validate_save(req)?;

        let rule = sqlx::query_as::<_, AutomationRule>(
            r#"
            INSERT INTO automation_rules
                (name, description, rule_type, is_active, priority, trigger_event,
                 conditions, actions, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(&req.name)
        .bind(&req.description)
        .bind(rule_type)
        .bind(req.is_active.unwrap_or(true))
        .bind(req.priority.unwrap_or(100))
        .bind(&req.trigger_event)
        .bind(&conditions)
        .bind(&actions)
        .bind(actor.id)
        .fetch_one(&self.pool)
        .await?;

        info!("created automation rule {} ({})", rule.id, rule.name);
        Ok(rule)
    }

    pub async fn update_rule(&self, id: i64, req: &SaveRuleRequest) -> ApiResult<AutomationRule> {
        let (rule_type, conditions, actions) = self.validate_save(req)?;

        let rule = sqlx::query_as::<_, AutomationRule>(
            r#"
            UPDATE automation_rules SET
                name = $2, description = $3, rule_type = $4, is_active = $5,
                priority = $6, trigger_event = $7, conditions = $8, actions = $9,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&req.name)
        .bind(&req.description)
        .bind(rule_type)
        .bind(req.is_active.unwrap_or(true))
        .bind(req.priority.unwrap_or(100))
        .bind(&req.trigger_event)
        .bind(&conditions)
        .bind(&actions)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::not_found("Rule"))?;

        Ok(rule)
    }

    pub async fn delete_rule(&self, id: i64) -> ApiResult<()> {
        let result = sqlx::query("DELETE FROM automation_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Rule"));
        }
        Ok(())
    }

    pub async fn get_rule(&self, id: i64) -> ApiResult<AutomationRule> {
        sqlx::query_as::<_, AutomationRule>("SELECT * FROM automation_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("Rule"))
    }

    fn validate_save(
        &self,
        req: &SaveRuleRequest,
    ) -> ApiResult<(RuleType, serde_json::Value, serde_json::Value)> {
        if req.name.trim().is_empty() {
            return Err(AppError::validation("name", "must not be empty"));
        }
        let rule_type = RuleType::parse(&req.rule_type)
            .ok_or_else(|| AppError::validation("rule_type", &format!("unknown value '{}'", req.rule_type)))?;
        if EventKind::parse(&req.trigger_event).is_none() {
            return Err(AppError::validation(
                "trigger_event",
                &format!("unknown trigger event '{}'", req.trigger_event),
            ));
        }

        let conditions_value = req.conditions.clone().unwrap_or_else(|| serde_json::json!([]));
        parse_conditions(&conditions_value)
            .map_err(|e| AppError::from(AutomationError::InvalidCondition(e.to_string())))?;

        let actions_value = req.actions.clone().unwrap_or_else(|| serde_json::json!([]));
        let actions = parse_actions(&actions_value)
            .map_err(|e| AppError::from(AutomationError::InvalidAction(e.to_string())))?;
        validate_actions(&actions).map_err(AppError::from)?;

        Ok((rule_type, conditions_value, actions_value))
    }

    // ===== Listing =====

    pub async fn list_rules(&self, params: &RuleListParams) -> ApiResult<PaginatedResponse<AutomationRule>> {
        let search = params
            .search
            .as_ref()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty())
            .map(|q| format!("%{}%", q));

        let mut qb = QueryBuilder::new();
        if params.rule_type.is_some() {
            qb.add_condition("rule_type::text = {}");
        }
        if params.trigger_event.is_some() {
            qb.add_condition("trigger_event = {}");
        }
        if params.is_active.is_some() {
            qb.add_condition("is_active = {}");
        }
        if search.is_some() {
            qb.add_condition("(name ILIKE {} OR description ILIKE {})");
        }

        let count_sql = format!("SELECT COUNT(*) FROM automation_rules {}", qb.where_clause());
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(rt) = &params.rule_type {
            count_query = count_query.bind(rt);
        }
        if let Some(te) = &params.trigger_event {
            count_query = count_query.bind(te);
        }
        if let Some(active) = params.is_active {
            count_query = count_query.bind(active);
        }
        if let Some(s) = &search {
            count_query = count_query.bind(s);
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let sql = format!(
            "SELECT * FROM automation_rules {} ORDER BY priority ASC, created_at DESC LIMIT ${} OFFSET ${}",
            qb.where_clause(),
            qb.param_count() + 1,
            qb.param_count() + 2,
        );
        let mut query = sqlx::query_as::<_, AutomationRule>(&sql);
        if let Some(rt) = &params.rule_type {
            query = query.bind(rt);
        }
        if let Some(te) = &params.trigger_event {
            query = query.bind(te);
        }
        if let Some(active) = params.is_active {
            query = query.bind(active);
        }
        if let Some(s) = &search {
            query = query.bind(s);
        }
        let rows = query
            .bind(params.pagination.limit())
            .bind(params.pagination.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(PaginatedResponse::new(rows, &params.pagination, total))
    }

    pub async fn rule_stats(&self, id: i64) -> ApiResult<RuleStats> {
        let rule = self.get_rule(id).await?;
        let success_rate = if rule.execution_count > 0 {
            rule.success_count as f64 / rule.execution_count as f64 * 100.0
        } else {
            0.0
        };
        Ok(RuleStats {
            rule_id: rule.id,
            name: rule.name,
            execution_count: rule.execution_count,
            success_count: rule.success_count,
            failure_count: rule.failure_count,
            average_exec_time_ms: rule.average_exec_time_ms,
            last_executed_at: rule.last_executed_at,
            success_rate,
        })
    }

    pub async fn list_logs(&self, params: &LogListParams) -> ApiResult<PaginatedResponse<AutomationLog>> {
        let mut qb = QueryBuilder::new();
        if params.rule_id.is_some() {
            qb.add_condition("rule_id = {}");
        }
        if params.ticket_id.is_some() {
            qb.add_condition("ticket_id = {}");
        }
        if params.success.is_some() {
            qb.add_condition("success = {}");
        }

        let count_sql = format!("SELECT COUNT(*) FROM automation_logs {}", qb.where_clause());
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(rule_id) = params.rule_id {
            count_query = count_query.bind(rule_id);
        }
        if let Some(ticket_id) = params.ticket_id {
            count_query = count_query.bind(ticket_id);
        }
        if let Some(success) = params.success {
            count_query = count_query.bind(success);
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let sql = format!(
            "SELECT * FROM automation_logs {} ORDER BY executed_at DESC, id DESC LIMIT ${} OFFSET ${}",
            qb.where_clause(),
            qb.param_count() + 1,
            qb.param_count() + 2,
        );
        let mut query = sqlx::query_as::<_, AutomationLog>(&sql);
        if let Some(rule_id) = params.rule_id {
            query = query.bind(rule_id);
        }
        if let Some(ticket_id) = params.ticket_id {
            query = query.bind(ticket_id);
        }
        if let Some(success) = params.success {
            query = query.bind(success);
        }
        let rows = query
            .bind(params.pagination.limit())
            .bind(params.pagination.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(PaginatedResponse::new(rows, &params.pagination, total))
    }

    // ===== Execution protocol =====

    /// Run all matching active rules against a committed event, in
    /// (priority, id) order. Every rule produces exactly one log row; rule
    /// failures never abort the remaining rules.
    pub async fn execute_rules(&self, event: &TicketEvent) -> ApiResult<()> {
        let Some(ticket) = &event.ticket else {
            return Ok(());
        };

        let rules = sqlx::query_as::<_, AutomationRule>(
            r#"
            SELECT * FROM automation_rules
            WHERE is_active = TRUE AND trigger_event = $1
            ORDER BY priority ASC, id ASC
            "#,
        )
        .bind(event.kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        if rules.is_empty() {
            return Ok(());
        }

        info!("evaluating {} rules for {}", rules.len(), event.kind);

        for rule in &rules {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.rule_timeout, self.execute_rule(rule, ticket)).await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("rule {} timed out after {:?}", rule.id, self.rule_timeout);
                    RuleOutcome::failure("rule execution timed out".to_string(), Vec::new())
                }
            };
            let elapsed_ms = started.elapsed().as_millis() as i64;

            if let Err(e) = self.record_outcome(rule, event, elapsed_ms, &outcome).await {
                error!("failed to record automation log for rule {}: {}", rule.id, e);
            }
        }

        Ok(())
    }

    async fn execute_rule(&self, rule: &AutomationRule, ticket: &Ticket) -> RuleOutcome {
        let conditions = match rule.parse_conditions() {
            Ok(conditions) => conditions,
            Err(e) => return RuleOutcome::failure(format!("invalid condition: {e}"), Vec::new()),
        };

        if !evaluate_conditions(&conditions, ticket) {
            return RuleOutcome::condition_miss();
        }

        let actions = match rule.parse_actions() {
            Ok(actions) => actions,
            Err(e) => return RuleOutcome::failure(format!("invalid action: {e}"), Vec::new()),
        };

        let mut executed = Vec::new();
        let mut changes = serde_json::Map::new();
        for action in &actions {
            match self.executor.execute(action, ticket.id, &mut changes).await {
                Ok(entry) => executed.push(entry),
                // Remaining actions of this rule are skipped; later rules run.
                Err(e) => return RuleOutcome::failure(e.to_string(), executed),
            }
        }

        RuleOutcome {
            success: true,
            error: None,
            actions_executed: executed,
            changes,
        }
    }

    /// Append the log row and update the rule's statistics in one
    /// transaction.
    async fn record_outcome(
        &self,
        rule: &AutomationRule,
        event: &TicketEvent,
        elapsed_ms: i64,
        outcome: &RuleOutcome,
    ) -> ApiResult<()> {
        let actions_json = serde_json::to_value(&outcome.actions_executed)?;
        let changes_json = serde_json::Value::Object(outcome.changes.clone());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO automation_logs
                (rule_id, ticket_id, trigger_event, success, error_message,
                 execution_time_ms, actions_executed, changes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(rule.id)
        .bind(event.resource_id)
        .bind(event.kind.as_str())
        .bind(outcome.success)
        .bind(&outcome.error)
        .bind(elapsed_ms)
        .bind(&actions_json)
        .bind(&changes_json)
        .execute(&mut *tx)
        .await?;

        let (prev_count, prev_avg): (i64, f64) = sqlx::query_as(
            "SELECT execution_count, average_exec_time_ms FROM automation_rules WHERE id = $1 FOR UPDATE",
        )
        .bind(rule.id)
        .fetch_one(&mut *tx)
        .await?;

        let new_avg = running_mean(prev_avg, prev_count, elapsed_ms);

        sqlx::query(
            r#"
            UPDATE automation_rules SET
                execution_count = execution_count + 1,
                success_count = success_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                failure_count = failure_count + CASE WHEN $2 THEN 0 ELSE 1 END,
                average_exec_time_ms = $3,
                last_executed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(rule.id)
        .bind(outcome.success)
        .bind(new_avg)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ===== Scheduled evaluation =====

    /// Timer-triggered pass over all open and in-progress tickets, in
    /// batches. Cancellation (the job timeout) is observed between batches.
    pub async fn run_scheduled_sweep(&self, batch_size: i64) -> ApiResult<u64> {
        let mut processed = 0u64;
        let mut last_id = 0i64;

        loop {
            let tickets = sqlx::query_as::<_, Ticket>(
                r#"
                SELECT * FROM tickets
                WHERE deleted_at IS NULL
                  AND status IN ('open', 'in_progress')
                  AND id > $1
                ORDER BY id ASC
                LIMIT $2
                "#,
            )
            .bind(last_id)
            .bind(batch_size)
            .fetch_all(&self.pool)
            .await?;

            if tickets.is_empty() {
                break;
            }

            for ticket in &tickets {
                last_id = ticket.id;
                let actor = Actor::system();
                let mut event = TicketEvent::for_ticket(
                    EventKind::ScheduledCheck,
                    format!("Scheduled check: {}", ticket.title),
                    ticket,
                    &actor,
                );
                // Scheduled checks exist to drive rules.
                event.suppress_rules = false;
                if let Err(e) = self.execute_rules(&event).await {
                    warn!("scheduled rule sweep failed for ticket {}: {}", ticket.id, e);
                }
                processed += 1;
            }
        }

        Ok(processed)
    }
}

/// Running mean with the first sample assigned directly.
fn running_mean(prev_avg: f64, prev_count: i64, sample_ms: i64) -> f64 {
    if prev_count <= 0 {
        return sample_ms as f64;
    }
    (prev_avg * prev_count as f64 + sample_ms as f64) / (prev_count + 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_assigned_directly() {
        assert_eq!(running_mean(0.0, 0, 40), 40.0);
    }

    #[test]
    fn running_mean_matches_arithmetic_mean() {
        let samples = [12i64, 7, 31, 4, 18];
        let mut avg = 0.0;
        for (i, s) in samples.iter().enumerate() {
            avg = running_mean(avg, i as i64, *s);
        }
        let expected: f64 = samples.iter().sum::<i64>() as f64 / samples.len() as f64;
        assert!((avg - expected).abs() < 1e-9);
    }

    #[test]
    fn condition_miss_is_a_success_with_empty_actions() {
        let outcome = RuleOutcome::condition_miss();
        assert!(outcome.success);
        assert!(outcome.error.is_none());
        assert!(outcome.actions_executed.is_empty());
    }
}
