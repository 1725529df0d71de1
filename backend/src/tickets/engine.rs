// Ticket Engine - lifecycle operations over tickets
//
// Every mutation runs load -> validate -> mutate -> history append inside a
// single transaction, then publishes an in-process event on commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

use triage_shared::{
    HistoryAction, Ticket, TicketComment, TicketPriority, TicketSource, TicketStatus, TicketType,
    normalize_string_list, parse_string_list,
};

use super::history::{self, HistoryEntry};
use super::number::{self, MAX_NUMBER_ATTEMPTS};
use super::state;
use crate::error::{ApiResult, AppError};
use crate::events::{Actor, EventKind, EventRouter, TicketEvent};
use crate::pagination::{PaginatedResponse, PaginationParams};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateTicketRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub ticket_type: Option<String>,
    pub priority: Option<String>,
    pub source: Option<String>,
    pub assigned_to: Option<i64>,
    pub category_id: Option<i64>,
    pub due_date: Option<DateTime<Utc>>,
    pub customer_name: Option<String>,
    #[validate(email)]
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    /// JSON array, JSON-encoded-string array, or comma-separated string.
    pub tags: Option<serde_json::Value>,
    pub custom_fields: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTicketRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub ticket_type: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub category_id: Option<i64>,
    pub due_date: Option<DateTime<Utc>>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub tags: Option<serde_json::Value>,
    pub custom_fields: Option<serde_json::Value>,
    pub rating: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketListParams {
    #[serde(flatten)]
    pub pagination: PaginationParams,
    /// Comma-separated status set.
    pub status: Option<String>,
    /// Comma-separated priority set.
    pub priority: Option<String>,
    pub ticket_type: Option<String>,
    pub assigned_to: Option<i64>,
    pub created_by: Option<i64>,
    /// Case-insensitive substring over title and description.
    pub search: Option<String>,
    /// Comma-separated tags; matches tickets carrying all of them.
    pub tags: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TicketStats {
    pub total: i64,
    pub by_status: HashMap<String, i64>,
    pub by_priority: HashMap<String, i64>,
    pub by_category: HashMap<String, i64>,
    pub overdue: i64,
    pub unassigned: i64,
    pub high_priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub my_assigned: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BulkUpdateOutcome {
    pub updated: Vec<i64>,
    pub failed: Vec<BulkFailure>,
}

#[derive(Debug, Serialize)]
pub struct BulkFailure {
    pub id: i64,
    pub code: String,
    pub message: String,
}

const SORTABLE_FIELDS: &[&str] = &["created_at", "updated_at", "priority", "status", "due_date", "id"];

#[derive(Clone)]
pub struct TicketEngine {
    pool: PgPool,
    events: Arc<EventRouter>,
    system_user_id: i64,
}

impl TicketEngine {
    pub fn new(pool: PgPool, events: Arc<EventRouter>, system_user_id: i64) -> Self {
        Self {
            pool,
            events,
            system_user_id,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ===== Create =====

    pub async fn create(&self, req: &CreateTicketRequest, actor: &Actor) -> ApiResult<Ticket> {
        req.validate()
            .map_err(|e| AppError::validation("request", &e.to_string()))?;

        let ticket_type = parse_enum(req.ticket_type.as_deref(), "ticket_type", TicketType::parse)?
            .unwrap_or(TicketType::Request);
        let priority = parse_enum(req.priority.as_deref(), "priority", TicketPriority::parse)?
            .unwrap_or(TicketPriority::Normal);
        let source = match req.source.as_deref() {
            None => TicketSource::Web,
            Some("web") => TicketSource::Web,
            Some("email") => TicketSource::Email,
            Some("phone") => TicketSource::Phone,
            Some("chat") => TicketSource::Chat,
            Some("api") => TicketSource::Api,
            Some("mobile") => TicketSource::Mobile,
            Some(other) => {
                return Err(AppError::validation("source", &format!("unknown value '{other}'")));
            }
        };

        let creator = actor
            .id
            .ok_or_else(|| AppError::PermissionDenied("an authenticated actor is required".into()))?;

        if let Some(assignee) = req.assigned_to {
            self.ensure_user_active(assignee).await?;
        }

        let tags = req
            .tags
            .as_ref()
            .map(normalize_string_list)
            .unwrap_or_else(|| serde_json::json!([]));
        let custom_fields = req
            .custom_fields
            .clone()
            .filter(|v| v.is_object())
            .unwrap_or_else(|| serde_json::json!({}));

        // The timestamp+random number scheme can collide within a second;
        // retry with a fresh suffix when the unique index rejects it.
        let mut attempt = 0;
        let ticket = loop {
            attempt += 1;
            let number = number::generate(Utc::now());

            let mut tx = self.pool.begin().await?;
            let inserted = sqlx::query_as::<_, Ticket>(
                r#"
                INSERT INTO tickets
                    (number, title, description, ticket_type, priority, status, source,
                     created_by, assigned_to, category_id, due_date,
                     customer_name, customer_email, customer_phone, tags, custom_fields)
                VALUES ($1, $2, $3, $4, $5, 'open', $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                RETURNING *
                "#,
            )
            .bind(&number)
            .bind(&req.title)
            .bind(&req.description)
            .bind(ticket_type)
            .bind(priority)
            .bind(source)
            .bind(creator)
            .bind(req.assigned_to)
            .bind(req.category_id)
            .bind(req.due_date)
            .bind(&req.customer_name)
            .bind(&req.customer_email)
            .bind(&req.customer_phone)
            .bind(&tags)
            .bind(&custom_fields)
            .fetch_one(&mut *tx)
            .await;

            match inserted {
                Ok(ticket) => {
                    history::append(
                        &mut tx,
                        &HistoryEntry::new(ticket.id, actor, HistoryAction::Create, format!("Ticket {} created", ticket.number)),
                    )
                    .await?;
                    tx.commit().await?;
                    break ticket;
                }
                Err(e) if number::is_unique_violation(&e) && attempt < MAX_NUMBER_ATTEMPTS => {
                    warn!("ticket number collision on {}, retrying", number);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        };

        info!("created ticket {} ({})", ticket.id, ticket.number);

        let event = TicketEvent::for_ticket(
            EventKind::TicketCreated,
            format!("Ticket created: {}", ticket.title),
            &ticket,
            actor,
        );
        self.events.publish(event).await;

        self.get(ticket.id).await
    }

    // ===== Read =====

    pub async fn get(&self, id: i64) -> ApiResult<Ticket> {
        sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("Ticket"))
    }

    pub async fn increment_view(&self, id: i64) {
        let _ = sqlx::query("UPDATE tickets SET view_count = view_count + 1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await;
    }

    // ===== Update =====

    pub async fn update(&self, id: i64, patch: &UpdateTicketRequest, actor: &Actor) -> ApiResult<Ticket> {
        self.apply_patch(id, patch, actor, false).await
    }

    /// Shared patch path. `force_close` lets the bulk/admin override move a
    /// ticket to closed without passing through resolved; the history row is
    /// flagged important.
    async fn apply_patch(
        &self,
        id: i64,
        patch: &UpdateTicketRequest,
        actor: &Actor,
        force_close: bool,
    ) -> ApiResult<Ticket> {
        let new_type = parse_enum(patch.ticket_type.as_deref(), "ticket_type", TicketType::parse)?;
        let new_priority = parse_enum(patch.priority.as_deref(), "priority", TicketPriority::parse)?;
        let new_status = parse_enum(patch.status.as_deref(), "status", TicketStatus::parse)?;
        if let Some(rating) = patch.rating {
            if !(1..=5).contains(&rating) {
                return Err(AppError::validation("rating", "must be between 1 and 5"));
            }
        }

        let mut tx = self.pool.begin().await?;
        let ticket = load_for_update(&mut tx, id).await?;

        let mut updated = ticket.clone();
        let mut changes: Vec<FieldChange> = Vec::new();

        if let Some(title) = &patch.title {
            if title.is_empty() {
                return Err(AppError::validation("title", "must not be empty"));
            }
            if *title != ticket.title {
                changes.push(FieldChange::plain("title", &ticket.title, title));
                updated.title = title.clone();
            }
        }
        if let Some(description) = &patch.description {
            if *description != ticket.description {
                changes.push(FieldChange::plain("description", &ticket.description, description));
                updated.description = description.clone();
            }
        }
        if let Some(t) = new_type {
            if t != ticket.ticket_type {
                changes.push(FieldChange::plain("type", ticket.ticket_type.as_str(), t.as_str()));
                updated.ticket_type = t;
            }
        }
        if let Some(p) = new_priority {
            if p != ticket.priority {
                changes.push(FieldChange::priority(ticket.priority, p));
                updated.priority = p;
            }
        }
        if let Some(s) = new_status {
            if s != ticket.status {
                let overridden = force_close && s == TicketStatus::Closed && actor.is_elevated();
                if !overridden {
                    state::check_transition(ticket.status, s)?;
                }
                apply_status_side_effects(&mut updated, s);
                changes.push(FieldChange::status(ticket.status, s));
                updated.status = s;
            }
        }
        if let Some(category_id) = patch.category_id {
            if Some(category_id) != ticket.category_id {
                changes.push(FieldChange::plain(
                    "category_id",
                    &display_opt(ticket.category_id),
                    &category_id.to_string(),
                ));
                updated.category_id = Some(category_id);
            }
        }
        if let Some(due) = patch.due_date {
            if Some(due) != ticket.due_date {
                changes.push(FieldChange::plain(
                    "due_date",
                    &ticket.due_date.map(|d| d.to_rfc3339()).unwrap_or_else(|| "none".into()),
                    &due.to_rfc3339(),
                ));
                updated.due_date = Some(due);
            }
        }
        if let Some(name) = &patch.customer_name {
            if Some(name.as_str()) != ticket.customer_name.as_deref() {
                changes.push(FieldChange::plain(
                    "customer_name",
                    ticket.customer_name.as_deref().unwrap_or(""),
                    name,
                ));
                updated.customer_name = Some(name.clone());
            }
        }
        if let Some(email) = &patch.customer_email {
            if Some(email.as_str()) != ticket.customer_email.as_deref() {
                changes.push(FieldChange::plain(
                    "customer_email",
                    ticket.customer_email.as_deref().unwrap_or(""),
                    email,
                ));
                updated.customer_email = Some(email.clone());
            }
        }
        if let Some(phone) = &patch.customer_phone {
            if Some(phone.as_str()) != ticket.customer_phone.as_deref() {
                changes.push(FieldChange::plain(
                    "customer_phone",
                    ticket.customer_phone.as_deref().unwrap_or(""),
                    phone,
                ));
                updated.customer_phone = Some(phone.clone());
            }
        }
        if let Some(tags) = &patch.tags {
            let canonical = normalize_string_list(tags);
            if canonical != ticket.tags {
                changes.push(FieldChange::plain(
                    "tags",
                    &ticket.tags.to_string(),
                    &canonical.to_string(),
                ));
                updated.tags = canonical;
            }
        }
        if let Some(fields) = &patch.custom_fields {
            if !fields.is_object() {
                return Err(AppError::validation("custom_fields", "must be a JSON object"));
            }
            if *fields != ticket.custom_fields {
                changes.push(FieldChange::plain(
                    "custom_fields",
                    &ticket.custom_fields.to_string(),
                    &fields.to_string(),
                ));
                updated.custom_fields = fields.clone();
            }
        }
        if let Some(rating) = patch.rating {
            if Some(rating) != ticket.rating {
                changes.push(FieldChange::plain(
                    "rating",
                    &display_opt(ticket.rating.map(i64::from)),
                    &rating.to_string(),
                ));
                updated.rating = Some(rating);
            }
        }

        if changes.is_empty() {
            tx.commit().await?;
            return Ok(ticket);
        }

        sqlx::query(
            r#"
            UPDATE tickets SET
                title = $2, description = $3, ticket_type = $4, priority = $5, status = $6,
                category_id = $7, due_date = $8, customer_name = $9, customer_email = $10,
                customer_phone = $11, tags = $12, custom_fields = $13, rating = $14,
                resolved_at = $15, closed_at = $16, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&updated.title)
        .bind(&updated.description)
        .bind(updated.ticket_type)
        .bind(updated.priority)
        .bind(updated.status)
        .bind(updated.category_id)
        .bind(updated.due_date)
        .bind(&updated.customer_name)
        .bind(&updated.customer_email)
        .bind(&updated.customer_phone)
        .bind(&updated.tags)
        .bind(&updated.custom_fields)
        .bind(updated.rating)
        .bind(updated.resolved_at)
        .bind(updated.closed_at)
        .execute(&mut *tx)
        .await?;

        for change in &changes {
            let mut entry = HistoryEntry::new(
                id,
                actor,
                change.action,
                format!("Changed {} from '{}' to '{}'", change.field, change.old, change.new),
            )
            .field_change(change.field.clone(), change.old.clone(), change.new.clone());
            if change.important {
                entry = entry.important();
            }
            history::append(&mut tx, &entry).await?;
        }

        tx.commit().await?;

        let fresh = self.get(id).await?;
        let changes_json = changes_map(&changes);
        let status_change = changes.iter().find(|c| c.field == "status");
        let kind = match status_change {
            Some(c) if c.new == TicketStatus::Resolved.as_str() => EventKind::TicketResolved,
            Some(c) if c.new == TicketStatus::Closed.as_str() => EventKind::TicketClosed,
            _ => EventKind::TicketUpdated,
        };
        let event = TicketEvent::for_ticket(
            kind,
            format!("Ticket updated: {}", fresh.title),
            &fresh,
            actor,
        )
        .with_changes(changes_json);
        self.events.publish(event).await;

        Ok(fresh)
    }

    // ===== Assignment =====

    /// Assign, reassign, or unassign. Always writes an
    /// assign/unassign/transfer history row and publishes `ticket.assigned`,
    /// even when the assignee did not change.
    pub async fn assign(
        &self,
        id: i64,
        assignee: Option<i64>,
        actor: &Actor,
        comment: Option<&str>,
    ) -> ApiResult<Ticket> {
        if let Some(user_id) = assignee {
            self.ensure_user_active(user_id).await?;
        }

        let mut tx = self.pool.begin().await?;
        let ticket = load_for_update(&mut tx, id).await?;

        if ticket.status.is_terminal() {
            return Err(AppError::validation(
                "status",
                &format!("cannot change assignment of a {} ticket", ticket.status),
            ));
        }

        let (action, description) = match (ticket.assigned_to, assignee) {
            (None, Some(new)) => (HistoryAction::Assign, format!("Assigned to user {new}")),
            (Some(old), None) => (HistoryAction::Unassign, format!("Unassigned from user {old}")),
            (Some(old), Some(new)) if old != new => (
                HistoryAction::Transfer,
                format!("Transferred from user {old} to user {new}"),
            ),
            (Some(_), Some(new)) => (HistoryAction::Assign, format!("Assigned to user {new}")),
            (None, None) => (HistoryAction::Unassign, "Unassigned".to_string()),
        };

        sqlx::query("UPDATE tickets SET assigned_to = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(assignee)
            .execute(&mut *tx)
            .await?;

        history::append(
            &mut tx,
            &HistoryEntry::new(id, actor, action, description).field_change(
                "assigned_to",
                display_opt(ticket.assigned_to),
                display_opt(assignee),
            ),
        )
        .await?;

        if let Some(content) = comment {
            self.insert_comment(&mut tx, id, content, actor, false).await?;
        }

        tx.commit().await?;

        let fresh = self.get(id).await?;
        let event = TicketEvent::for_ticket(
            EventKind::TicketAssigned,
            format!("Ticket assigned: {}", fresh.title),
            &fresh,
            actor,
        )
        .with_data("old_assignee", serde_json::json!(ticket.assigned_to))
        .with_changes(serde_json::json!({
            "assigned_to": {"old": ticket.assigned_to, "new": assignee}
        }));
        self.events.publish(event).await;

        Ok(fresh)
    }

    // ===== Escalation =====

    /// Reassign to `target` and bump priority one level (capped at
    /// critical). Writes a single escalate history row with the packed
    /// old/new representation.
    pub async fn escalate(
        &self,
        id: i64,
        target: i64,
        actor: &Actor,
        reason: &str,
        comment: Option<&str>,
    ) -> ApiResult<Ticket> {
        self.ensure_user_active(target).await?;

        let mut tx = self.pool.begin().await?;
        let ticket = load_for_update(&mut tx, id).await?;

        if ticket.status.is_terminal() {
            return Err(AppError::validation(
                "status",
                &format!("cannot escalate a {} ticket", ticket.status),
            ));
        }

        let new_priority = ticket.priority.bumped();

        sqlx::query(
            "UPDATE tickets SET assigned_to = $2, priority = $3, is_escalated = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(target)
        .bind(new_priority)
        .execute(&mut *tx)
        .await?;

        let old_packed = format!(
            "assigned_to: {}, priority: {}",
            display_opt(ticket.assigned_to),
            ticket.priority
        );
        let new_packed = format!("assigned_to: {}, priority: {}", target, new_priority);

        history::append(
            &mut tx,
            &HistoryEntry::new(
                id,
                actor,
                HistoryAction::Escalate,
                format!("Escalated to user {target}: {reason}"),
            )
            .field_change("escalation", old_packed, new_packed)
            .important(),
        )
        .await?;

        if let Some(content) = comment {
            self.insert_comment(&mut tx, id, content, actor, actor.automated).await?;
        }

        tx.commit().await?;

        let fresh = self.get(id).await?;
        let event = TicketEvent::for_ticket(
            EventKind::TicketEscalated,
            format!("Ticket escalated: {}", fresh.title),
            &fresh,
            actor,
        )
        .with_data("reason", serde_json::json!(reason))
        .with_changes(serde_json::json!({
            "assigned_to": {"old": ticket.assigned_to, "new": target},
            "priority": {"old": ticket.priority.as_str(), "new": new_priority.as_str()}
        }));
        self.events.publish(event).await;

        Ok(fresh)
    }

    // ===== Status =====

    pub async fn update_status(
        &self,
        id: i64,
        new_status: &str,
        actor: &Actor,
        comment: Option<&str>,
        resolution_notes: Option<&str>,
    ) -> ApiResult<Ticket> {
        let status = TicketStatus::parse(new_status)
            .ok_or_else(|| AppError::validation("status", &format!("unknown value '{new_status}'")))?;

        let mut tx = self.pool.begin().await?;
        let ticket = load_for_update(&mut tx, id).await?;

        state::check_transition(ticket.status, status)?;

        let mut updated = ticket.clone();
        apply_status_side_effects(&mut updated, status);

        sqlx::query(
            "UPDATE tickets SET status = $2, resolved_at = $3, closed_at = $4, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(updated.resolved_at)
        .bind(updated.closed_at)
        .execute(&mut *tx)
        .await?;

        let mut entry = HistoryEntry::new(
            id,
            actor,
            HistoryAction::StatusChange,
            format!("Status changed from {} to {}", ticket.status, status),
        )
        .field_change("status", ticket.status.as_str(), status.as_str())
        .important();
        if let Some(notes) = resolution_notes {
            entry = entry.with_details(serde_json::json!({ "resolution_notes": notes }));
        }
        history::append(&mut tx, &entry).await?;

        if let Some(content) = comment {
            self.insert_comment(&mut tx, id, content, actor, false).await?;
        }

        tx.commit().await?;

        let fresh = self.get(id).await?;
        let kind = match status {
            TicketStatus::Resolved => EventKind::TicketResolved,
            TicketStatus::Closed => EventKind::TicketClosed,
            _ => EventKind::TicketUpdated,
        };
        let event = TicketEvent::for_ticket(
            kind,
            format!("Ticket {}: {}", status, fresh.title),
            &fresh,
            actor,
        )
        .with_changes(serde_json::json!({
            "status": {"old": ticket.status.as_str(), "new": status.as_str()}
        }));
        self.events.publish(event).await;

        Ok(fresh)
    }

    // ===== Bulk =====

    /// Best-effort per-ticket patch. Elevated actors may force-close without
    /// passing through resolved.
    pub async fn bulk_update(
        &self,
        ids: &[i64],
        patch: &UpdateTicketRequest,
        actor: &Actor,
    ) -> BulkUpdateOutcome {
        let mut outcome = BulkUpdateOutcome {
            updated: Vec::new(),
            failed: Vec::new(),
        };

        for &id in ids {
            match self.apply_patch(id, patch, actor, actor.is_elevated()).await {
                Ok(_) => outcome.updated.push(id),
                Err(e) => outcome.failed.push(BulkFailure {
                    id,
                    code: e.error_code().to_string(),
                    message: e.public_message(),
                }),
            }
        }

        outcome
    }

    // ===== Delete =====

    /// Soft delete. Only the creator or an elevated role may delete; history
    /// and automation logs keep referencing the tombstoned row.
    pub async fn delete(&self, id: i64, actor: &Actor) -> ApiResult<()> {
        let mut tx = self.pool.begin().await?;
        let ticket = load_for_update(&mut tx, id).await?;

        let is_creator = actor.id == Some(ticket.created_by);
        if !is_creator && !actor.is_elevated() {
            return Err(AppError::PermissionDenied(
                "only the creator or an administrator may delete a ticket".into(),
            ));
        }

        sqlx::query("UPDATE tickets SET deleted_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        history::append(
            &mut tx,
            &HistoryEntry::new(id, actor, HistoryAction::System, format!("Ticket {} deleted", ticket.number)),
        )
        .await?;

        tx.commit().await?;
        info!("soft-deleted ticket {}", id);
        Ok(())
    }

    // ===== Comments =====

    /// Comment pathway used by agents, the automation engine, and the SLA
    /// escalations. System comments carry the configured system user.
    pub async fn add_comment(
        &self,
        id: i64,
        content: &str,
        actor: &Actor,
        is_system: bool,
    ) -> ApiResult<TicketComment> {
        if content.trim().is_empty() {
            return Err(AppError::validation("content", "must not be empty"));
        }

        let mut tx = self.pool.begin().await?;
        // Lock the ticket row so comment_count and first_reply_at are safe.
        let ticket = load_for_update(&mut tx, id).await?;

        let comment = self.insert_comment(&mut tx, id, content, actor, is_system).await?;

        history::append(
            &mut tx,
            &HistoryEntry::new(id, actor, HistoryAction::Comment, "Comment added"),
        )
        .await?;

        tx.commit().await?;

        let fresh = self.get(id).await?;
        let event = TicketEvent::for_ticket(
            EventKind::TicketComment,
            format!("New comment on: {}", ticket.title),
            &fresh,
            actor,
        )
        .with_data("comment_id", serde_json::json!(comment.id))
        .with_data("is_system", serde_json::json!(is_system));
        self.events.publish(event).await;

        Ok(comment)
    }

    async fn insert_comment(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ticket_id: i64,
        content: &str,
        actor: &Actor,
        is_system: bool,
    ) -> ApiResult<TicketComment> {
        let user_id = if is_system {
            Some(self.system_user_id)
        } else {
            actor.id.or(Some(self.system_user_id))
        };

        let comment = sqlx::query_as::<_, TicketComment>(
            r#"
            INSERT INTO ticket_comments (ticket_id, user_id, content, is_system)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(ticket_id)
        .bind(user_id)
        .bind(content)
        .bind(is_system)
        .fetch_one(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE tickets SET
                comment_count = comment_count + 1,
                first_reply_at = CASE WHEN $2 THEN first_reply_at ELSE COALESCE(first_reply_at, NOW()) END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(ticket_id)
        .bind(is_system)
        .execute(&mut **tx)
        .await?;

        Ok(comment)
    }

    pub async fn list_comments(
        &self,
        ticket_id: i64,
        params: &PaginationParams,
    ) -> ApiResult<PaginatedResponse<TicketComment>> {
        self.get(ticket_id).await?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ticket_comments WHERE ticket_id = $1")
                .bind(ticket_id)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query_as::<_, TicketComment>(
            "SELECT * FROM ticket_comments WHERE ticket_id = $1 ORDER BY created_at ASC, id ASC LIMIT $2 OFFSET $3",
        )
        .bind(ticket_id)
        .bind(params.limit())
        .bind(params.offset())
        .fetch_all(&self.pool)
        .await?;

        Ok(PaginatedResponse::new(rows, params, total))
    }

    /// Whether anyone other than the platform has replied. Consulted by the
    /// SLA response-violation check.
    pub async fn has_non_system_comment(&self, ticket_id: i64) -> ApiResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ticket_comments WHERE ticket_id = $1 AND is_system = FALSE",
        )
        .bind(ticket_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // ===== Listing =====

    pub async fn list(&self, params: &TicketListParams) -> ApiResult<PaginatedResponse<Ticket>> {
        let statuses = parse_enum_set(params.status.as_deref(), "status", TicketStatus::parse)?;
        let priorities = parse_enum_set(params.priority.as_deref(), "priority", TicketPriority::parse)?;
        let ticket_type = parse_enum(params.ticket_type.as_deref(), "ticket_type", TicketType::parse)?;
        let search = params
            .search
            .as_ref()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty())
            .map(|q| format!("%{}%", q));
        let tags = params.tags.as_ref().map(|t| {
            triage_shared::string_list_value(&parse_string_list(&serde_json::json!(t)))
        });

        let filter_sql = r#"
            deleted_at IS NULL
            AND ($1::text[] IS NULL OR status::text = ANY($1))
            AND ($2::text[] IS NULL OR priority::text = ANY($2))
            AND ($3::ticket_type IS NULL OR ticket_type = $3)
            AND ($4::bigint IS NULL OR assigned_to = $4)
            AND ($5::bigint IS NULL OR created_by = $5)
            AND ($6::text IS NULL OR title ILIKE $6 OR description ILIKE $6)
            AND ($7::jsonb IS NULL OR tags @> $7)
        "#;

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM tickets WHERE {filter_sql}"))
            .bind(&statuses)
            .bind(&priorities)
            .bind(ticket_type)
            .bind(params.assigned_to)
            .bind(params.created_by)
            .bind(&search)
            .bind(&tags)
            .fetch_one(&self.pool)
            .await?;

        let sort_field = params.pagination.validated_sort_field(SORTABLE_FIELDS, "created_at");
        let query = format!(
            "SELECT * FROM tickets WHERE {filter_sql} ORDER BY {} {} LIMIT $8 OFFSET $9",
            sort_field,
            params.pagination.sort_direction(),
        );

        let rows = sqlx::query_as::<_, Ticket>(&query)
            .bind(&statuses)
            .bind(&priorities)
            .bind(ticket_type)
            .bind(params.assigned_to)
            .bind(params.created_by)
            .bind(&search)
            .bind(&tags)
            .bind(params.pagination.limit())
            .bind(params.pagination.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(PaginatedResponse::new(rows, &params.pagination, total))
    }

    // ===== Statistics =====

    pub async fn stats(&self, actor: &Actor) -> ApiResult<TicketStats> {
        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status::text, COUNT(*) FROM tickets WHERE deleted_at IS NULL GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let by_priority: Vec<(String, i64)> = sqlx::query_as(
            "SELECT priority::text, COUNT(*) FROM tickets WHERE deleted_at IS NULL GROUP BY priority",
        )
        .fetch_all(&self.pool)
        .await?;

        let by_category: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT COALESCE(category_id::text, 'uncategorized'), COUNT(*)
            FROM tickets WHERE deleted_at IS NULL GROUP BY category_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let overdue: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tickets
            WHERE deleted_at IS NULL
              AND due_date < NOW()
              AND status NOT IN ('resolved', 'closed')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let unassigned: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tickets
            WHERE deleted_at IS NULL AND assigned_to IS NULL
              AND status NOT IN ('closed', 'cancelled')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let high_priority: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM tickets
            WHERE deleted_at IS NULL AND priority IN ('high', 'urgent', 'critical')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let my_assigned = match (&actor.role, actor.id) {
            (Some(role), Some(user_id)) if role == "agent" => {
                let count: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM tickets WHERE deleted_at IS NULL AND assigned_to = $1",
                )
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
                Some(count)
            }
            _ => None,
        };

        let total = by_status.iter().map(|(_, n)| n).sum();

        Ok(TicketStats {
            total,
            by_status: by_status.into_iter().collect(),
            by_priority: by_priority.into_iter().collect(),
            by_category: by_category.into_iter().collect(),
            overdue,
            unassigned,
            high_priority,
            my_assigned,
        })
    }

    // ===== Helpers =====

    pub async fn ensure_user_active(&self, user_id: i64) -> ApiResult<()> {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT id FROM users WHERE id = $1 AND is_active = TRUE")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        if exists.is_none() {
            return Err(AppError::validation(
                "user_id",
                &format!("user {user_id} does not exist or is inactive"),
            ));
        }
        Ok(())
    }

    /// First active admin, used when an escalation rule has no explicit target.
    pub async fn first_active_admin(&self) -> ApiResult<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM users WHERE role = 'admin' AND is_active = TRUE ORDER BY id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

async fn load_for_update(tx: &mut Transaction<'_, Postgres>, id: i64) -> ApiResult<Ticket> {
    sqlx::query_as::<_, Ticket>(
        "SELECT * FROM tickets WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| AppError::not_found("Ticket"))
}

/// Entering resolved or closed stamps the matching timestamp if unset.
fn apply_status_side_effects(ticket: &mut Ticket, new_status: TicketStatus) {
    match new_status {
        TicketStatus::Resolved => {
            if ticket.resolved_at.is_none() {
                ticket.resolved_at = Some(Utc::now());
            }
        }
        TicketStatus::Closed => {
            if ticket.closed_at.is_none() {
                ticket.closed_at = Some(Utc::now());
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone)]
struct FieldChange {
    field: String,
    old: String,
    new: String,
    action: HistoryAction,
    important: bool,
}

impl FieldChange {
    fn plain(field: &str, old: &str, new: &str) -> Self {
        Self {
            field: field.to_string(),
            old: old.to_string(),
            new: new.to_string(),
            action: HistoryAction::Update,
            important: false,
        }
    }

    fn priority(old: TicketPriority, new: TicketPriority) -> Self {
        Self {
            field: "priority".to_string(),
            old: old.as_str().to_string(),
            new: new.as_str().to_string(),
            action: HistoryAction::PriorityChange,
            important: true,
        }
    }

    fn status(old: TicketStatus, new: TicketStatus) -> Self {
        Self {
            field: "status".to_string(),
            old: old.as_str().to_string(),
            new: new.as_str().to_string(),
            action: HistoryAction::StatusChange,
            important: true,
        }
    }
}

fn changes_map(changes: &[FieldChange]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for c in changes {
        map.insert(
            c.field.clone(),
            serde_json::json!({ "old": c.old, "new": c.new }),
        );
    }
    serde_json::Value::Object(map)
}

fn display_opt(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())
}

fn parse_enum<T>(
    raw: Option<&str>,
    field: &str,
    parse: fn(&str) -> Option<T>,
) -> ApiResult<Option<T>> {
    match raw {
        None => Ok(None),
        Some(s) => parse(s)
            .map(Some)
            .ok_or_else(|| AppError::validation(field, &format!("unknown value '{s}'"))),
    }
}

/// Parse a comma-separated enum set for list filters; each entry must be a
/// known value.
fn parse_enum_set<T>(
    raw: Option<&str>,
    field: &str,
    parse: fn(&str) -> Option<T>,
) -> ApiResult<Option<Vec<String>>> {
    let Some(raw) = raw else { return Ok(None) };
    let mut out = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if parse(part).is_none() {
            return Err(AppError::validation(field, &format!("unknown value '{part}'")));
        }
        out.push(part.to_string());
    }
    if out.is_empty() { Ok(None) } else { Ok(Some(out)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_enum_set_validates_each_entry() {
        let set = parse_enum_set(Some("open, in_progress"), "status", TicketStatus::parse)
            .unwrap()
            .unwrap();
        assert_eq!(set, vec!["open", "in_progress"]);

        let err = parse_enum_set(Some("open,bogus"), "status", TicketStatus::parse).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");

        assert!(parse_enum_set(Some(" ,, "), "status", TicketStatus::parse).unwrap().is_none());
    }

    #[test]
    fn status_side_effects_stamp_once() {
        let mut ticket = sample_ticket();
        apply_status_side_effects(&mut ticket, TicketStatus::Resolved);
        let first = ticket.resolved_at.unwrap();
        apply_status_side_effects(&mut ticket, TicketStatus::Resolved);
        assert_eq!(ticket.resolved_at.unwrap(), first);
        assert!(ticket.closed_at.is_none());

        apply_status_side_effects(&mut ticket, TicketStatus::Closed);
        assert!(ticket.closed_at.is_some());
        assert!(ticket.resolved_at.unwrap() <= ticket.closed_at.unwrap());
    }

    #[test]
    fn changes_map_shape() {
        let changes = vec![
            FieldChange::priority(TicketPriority::Normal, TicketPriority::High),
            FieldChange::plain("title", "a", "b"),
        ];
        let map = changes_map(&changes);
        assert_eq!(map["priority"]["old"], "normal");
        assert_eq!(map["priority"]["new"], "high");
        assert_eq!(map["title"]["new"], "b");
    }

    fn sample_ticket() -> Ticket {
        Ticket {
            id: 1,
            number: "TK-20250101-000000-001".into(),
            title: "t".into(),
            description: String::new(),
            ticket_type: TicketType::Incident,
            priority: TicketPriority::Normal,
            status: TicketStatus::Open,
            source: TicketSource::Web,
            created_by: 1,
            assigned_to: None,
            category_id: None,
            due_date: None,
            customer_name: None,
            customer_email: None,
            customer_phone: None,
            tags: serde_json::json!([]),
            custom_fields: serde_json::json!({}),
            view_count: 0,
            comment_count: 0,
            history_count: 0,
            rating: None,
            is_escalated: false,
            first_reply_at: None,
            resolved_at: None,
            closed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }
}
