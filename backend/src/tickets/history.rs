// Ticket history ledger - append-only, written in the same transaction as
// the mutation it describes.

use sqlx::{PgPool, Postgres, Transaction};
use triage_shared::{HistoryAction, TicketHistory};

use crate::events::Actor;
use crate::pagination::{PaginatedResponse, PaginationParams};

/// A history row waiting to be appended.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub ticket_id: i64,
    pub user_id: Option<i64>,
    pub action: HistoryAction,
    pub description: String,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub details: serde_json::Value,
    pub is_visible: bool,
    pub is_system: bool,
    pub is_automated: bool,
    pub is_important: bool,
}

impl HistoryEntry {
    pub fn new(ticket_id: i64, actor: &Actor, action: HistoryAction, description: impl Into<String>) -> Self {
        Self {
            ticket_id,
            user_id: actor.id,
            action,
            description: description.into(),
            field_name: None,
            old_value: None,
            new_value: None,
            details: serde_json::json!({}),
            is_visible: true,
            is_system: actor.id.is_none(),
            is_automated: actor.automated,
            is_important: false,
        }
    }

    pub fn field_change(
        mut self,
        field: impl Into<String>,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        self.field_name = Some(field.into());
        self.old_value = Some(old.into());
        self.new_value = Some(new.into());
        self
    }

    pub fn important(mut self) -> Self {
        self.is_important = true;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Append one history row and bump the ticket's history counter. Runs inside
/// the caller's transaction so the ledger and the mutation commit together.
pub async fn append(
    tx: &mut Transaction<'_, Postgres>,
    entry: &HistoryEntry,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO ticket_history
            (ticket_id, user_id, action, description, field_name, old_value, new_value,
             details, is_visible, is_system, is_automated, is_important)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(entry.ticket_id)
    .bind(entry.user_id)
    .bind(entry.action)
    .bind(&entry.description)
    .bind(&entry.field_name)
    .bind(&entry.old_value)
    .bind(&entry.new_value)
    .bind(&entry.details)
    .bind(entry.is_visible)
    .bind(entry.is_system)
    .bind(entry.is_automated)
    .bind(entry.is_important)
    .execute(&mut **tx)
    .await?;

    sqlx::query("UPDATE tickets SET history_count = history_count + 1 WHERE id = $1")
        .bind(entry.ticket_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// List a ticket's history, newest first.
pub async fn list(
    pool: &PgPool,
    ticket_id: i64,
    params: &PaginationParams,
) -> Result<PaginatedResponse<TicketHistory>, sqlx::Error> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ticket_history WHERE ticket_id = $1")
        .bind(ticket_id)
        .fetch_one(pool)
        .await?;

    let rows = sqlx::query_as::<_, TicketHistory>(
        r#"
        SELECT * FROM ticket_history
        WHERE ticket_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(ticket_id)
    .bind(params.limit())
    .bind(params.offset())
    .fetch_all(pool)
    .await?;

    Ok(PaginatedResponse::new(rows, params, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_actor_marks_row_system_and_automated() {
        let entry = HistoryEntry::new(1, &Actor::system(), HistoryAction::Assign, "Auto-assigned");
        assert!(entry.is_system);
        assert!(entry.is_automated);
        assert_eq!(entry.user_id, None);
    }

    #[test]
    fn user_actor_is_neither_system_nor_automated() {
        let entry = HistoryEntry::new(1, &Actor::user(7, "agent"), HistoryAction::Comment, "Replied");
        assert!(!entry.is_system);
        assert!(!entry.is_automated);
        assert_eq!(entry.user_id, Some(7));
    }

    #[test]
    fn field_change_builder_sets_all_three() {
        let entry = HistoryEntry::new(1, &Actor::user(7, "agent"), HistoryAction::PriorityChange, "")
            .field_change("priority", "normal", "high")
            .important();
        assert_eq!(entry.field_name.as_deref(), Some("priority"));
        assert_eq!(entry.old_value.as_deref(), Some("normal"));
        assert_eq!(entry.new_value.as_deref(), Some("high"));
        assert!(entry.is_important);
    }
}
