// Action executor - applies rule actions through the ticket engine.
//
// Mutations run as the system actor, so history rows are flagged automated
// and the resulting events do not re-enter the rule engine.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use triage_shared::{RuleAction, Ticket, TicketPriority, TicketStatus};

use super::actions::{self, ActionKind};
use super::AutomationError;
use crate::events::{Actor, EventKind, EventRouter, TicketEvent};
use crate::tickets::{TicketEngine, UpdateTicketRequest};

/// One entry of an automation log's `actions_executed` list.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedAction {
    #[serde(rename = "type")]
    pub action_type: String,
    pub params: Value,
    pub output: Value,
}

pub struct ActionExecutor {
    tickets: TicketEngine,
    events: Arc<EventRouter>,
}

impl ActionExecutor {
    pub fn new(tickets: TicketEngine, events: Arc<EventRouter>) -> Self {
        Self { tickets, events }
    }

    /// Execute one action against a ticket. Returns the log entry and the
    /// field changes it caused.
    pub async fn execute(
        &self,
        action: &RuleAction,
        ticket_id: i64,
        changes: &mut serde_json::Map<String, Value>,
    ) -> Result<ExecutedAction, AutomationError> {
        let kind = actions::resolve(action)?;
        let ticket = self.tickets.get(ticket_id).await.map_err(AutomationError::App)?;
        let actor = Actor::system();

        let output = match kind {
            ActionKind::Assign => {
                let user_id = actions::param_i64(&action.params, "user_id")?;
                self.tickets
                    .assign(ticket_id, Some(user_id), &actor, None)
                    .await
                    .map_err(AutomationError::App)?;
                record_change(changes, "assigned_to", Value::from(ticket.assigned_to), Value::from(user_id));
                serde_json::json!({ "assigned_to": user_id })
            }
            ActionKind::SetPriority => {
                let raw = actions::param_str(&action.params, "priority")?;
                let priority = TicketPriority::parse(raw).ok_or_else(|| {
                    AutomationError::InvalidAction(format!("unknown priority '{raw}'"))
                })?;
                let patch = UpdateTicketRequest {
                    priority: Some(priority.as_str().to_string()),
                    ..Default::default()
                };
                self.tickets
                    .update(ticket_id, &patch, &actor)
                    .await
                    .map_err(AutomationError::App)?;
                record_change(
                    changes,
                    "priority",
                    Value::from(ticket.priority.as_str()),
                    Value::from(priority.as_str()),
                );
                serde_json::json!({ "priority": priority.as_str() })
            }
            ActionKind::SetStatus => {
                let raw = actions::param_str(&action.params, "status")?;
                if TicketStatus::parse(raw).is_none() {
                    return Err(AutomationError::InvalidAction(format!("unknown status '{raw}'")));
                }
                self.tickets
                    .update_status(ticket_id, raw, &actor, None, None)
                    .await
                    .map_err(AutomationError::App)?;
                record_change(
                    changes,
                    "status",
                    Value::from(ticket.status.as_str()),
                    Value::from(raw),
                );
                serde_json::json!({ "status": raw })
            }
            ActionKind::AddComment => {
                let content = actions::param_str(&action.params, "content")?;
                let comment = self
                    .tickets
                    .add_comment(ticket_id, content, &actor, true)
                    .await
                    .map_err(AutomationError::App)?;
                serde_json::json!({ "comment_id": comment.id })
            }
            ActionKind::Notify => {
                let recipients = action
                    .params
                    .get("recipients")
                    .cloned()
                    .unwrap_or(Value::Null);
                let channel = action.params.get("channel").cloned().unwrap_or(Value::Null);
                let template = action.params.get("template").cloned().unwrap_or(Value::Null);

                let mut event = TicketEvent::for_ticket(
                    EventKind::SystemAlert,
                    format!("Rule notification: {}", ticket.title),
                    &ticket,
                    &actor,
                );
                event = event
                    .with_data("recipients", recipients.clone())
                    .with_data("channel", channel)
                    .with_data("template", template);
                self.events.publish(event).await;
                serde_json::json!({ "notified": recipients })
            }
            ActionKind::Escalate => {
                let manager_id = actions::param_i64(&action.params, "manager_id")?;
                self.tickets
                    .escalate(ticket_id, manager_id, &actor, "Escalated by automation rule", None)
                    .await
                    .map_err(AutomationError::App)?;
                record_change(
                    changes,
                    "assigned_to",
                    Value::from(ticket.assigned_to),
                    Value::from(manager_id),
                );
                record_change(
                    changes,
                    "priority",
                    Value::from(ticket.priority.as_str()),
                    Value::from(ticket.priority.bumped().as_str()),
                );
                serde_json::json!({ "escalated_to": manager_id })
            }
            ActionKind::Classify => {
                let rules = action
                    .params
                    .get("rules")
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| {
                        AutomationError::InvalidAction("param 'rules' must be an array".into())
                    })?;
                match classify(&ticket, rules) {
                    Some((category_id, ticket_type)) => {
                        let patch = UpdateTicketRequest {
                            category_id,
                            ticket_type: ticket_type.clone(),
                            ..Default::default()
                        };
                        self.tickets
                            .update(ticket_id, &patch, &actor)
                            .await
                            .map_err(AutomationError::App)?;
                        if let Some(category_id) = category_id {
                            record_change(
                                changes,
                                "category_id",
                                Value::from(ticket.category_id),
                                Value::from(category_id),
                            );
                        }
                        if let Some(t) = &ticket_type {
                            record_change(
                                changes,
                                "type",
                                Value::from(ticket.ticket_type.as_str()),
                                Value::from(t.as_str()),
                            );
                        }
                        serde_json::json!({ "category_id": category_id, "type": ticket_type })
                    }
                    None => serde_json::json!({ "matched": false }),
                }
            }
        };

        info!(
            "executed action '{}' on ticket {}",
            action.action_type, ticket_id
        );

        Ok(ExecutedAction {
            action_type: action.action_type.clone(),
            params: action.params.clone(),
            output,
        })
    }
}

/// First keyword rule whose keywords appear in the ticket text wins.
fn classify(ticket: &Ticket, rules: &[Value]) -> Option<(Option<i64>, Option<String>)> {
    let haystack = format!("{} {}", ticket.title, ticket.description).to_lowercase();

    for rule in rules {
        let keywords = rule.get("keywords").and_then(|v| v.as_array())?;
        let matched = keywords.iter().any(|k| {
            k.as_str()
                .map(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
                .unwrap_or(false)
        });
        if matched {
            let category_id = rule.get("category_id").and_then(|v| v.as_i64());
            let ticket_type = rule
                .get("ticket_type")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            return Some((category_id, ticket_type));
        }
    }
    None
}

fn record_change(
    changes: &mut serde_json::Map<String, Value>,
    field: &str,
    old: Value,
    new: Value,
) {
    changes.insert(field.to_string(), serde_json::json!({ "old": old, "new": new }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use triage_shared::{TicketSource, TicketType};

    fn ticket(title: &str, description: &str) -> Ticket {
        Ticket {
            id: 1,
            number: "TK-20250101-000000-001".into(),
            title: title.into(),
            description: description.into(),
            ticket_type: TicketType::Request,
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
            tags: json!([]),
            custom_fields: json!({}),
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

    #[test]
    fn classify_picks_first_matching_keyword_rule() {
        let rules = vec![
            json!({"keywords": ["printer"], "category_id": 1}),
            json!({"keywords": ["vpn", "network"], "category_id": 2, "ticket_type": "incident"}),
        ];
        let result = classify(&ticket("VPN down", "remote access broken"), &rules);
        assert_eq!(result, Some((Some(2), Some("incident".to_string()))));
    }

    #[test]
    fn classify_is_case_insensitive_over_title_and_body() {
        let rules = vec![json!({"keywords": ["OUTAGE"], "category_id": 9})];
        let result = classify(&ticket("minor", "total outage since 9am"), &rules);
        assert_eq!(result, Some((Some(9), None)));
    }

    #[test]
    fn classify_returns_none_without_match() {
        let rules = vec![json!({"keywords": ["billing"]})];
        assert_eq!(classify(&ticket("vpn", "network"), &rules), None);
    }

    #[test]
    fn record_change_builds_old_new_pairs() {
        let mut changes = serde_json::Map::new();
        record_change(&mut changes, "priority", json!("normal"), json!("high"));
        assert_eq!(changes["priority"]["old"], "normal");
        assert_eq!(changes["priority"]["new"], "high");
    }
}
