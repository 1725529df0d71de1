// Ticket Events - In-process event publication consumed by the automation
// engine and the notification fan-out.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::error;
use triage_shared::Ticket;
use uuid::Uuid;

use crate::automation::AutomationEngine;
use crate::notify::WebhookDispatcher;

/// Trigger-event tags. The wire form is the dotted string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    TicketCreated,
    TicketUpdated,
    TicketAssigned,
    TicketResolved,
    TicketClosed,
    TicketComment,
    TicketEscalated,
    ScheduledCheck,
    SystemAlert,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TicketCreated => "ticket.created",
            Self::TicketUpdated => "ticket.updated",
            Self::TicketAssigned => "ticket.assigned",
            Self::TicketResolved => "ticket.resolved",
            Self::TicketClosed => "ticket.closed",
            Self::TicketComment => "ticket.comment",
            Self::TicketEscalated => "ticket.escalated",
            Self::ScheduledCheck => "scheduled_check",
            Self::SystemAlert => "system.alert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ticket.created" => Some(Self::TicketCreated),
            "ticket.updated" => Some(Self::TicketUpdated),
            "ticket.assigned" => Some(Self::TicketAssigned),
            "ticket.resolved" => Some(Self::TicketResolved),
            "ticket.closed" => Some(Self::TicketClosed),
            "ticket.comment" => Some(Self::TicketComment),
            "ticket.escalated" => Some(Self::TicketEscalated),
            "scheduled_check" => Some(Self::ScheduledCheck),
            "system.alert" => Some(Self::SystemAlert),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The acting principal behind a mutation.
#[derive(Debug, Clone)]
pub struct Actor {
    /// None means the platform itself (history actor is null).
    pub id: Option<i64>,
    pub role: Option<String>,
    /// Set when the mutation originates inside the automation or SLA engines.
    /// Automated mutations do not re-enter the rule engine.
    pub automated: bool,
}

impl Actor {
    pub fn user(id: i64, role: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            role: Some(role.into()),
            automated: false,
        }
    }

    pub fn system() -> Self {
        Self {
            id: None,
            role: None,
            automated: true,
        }
    }

    pub fn is_elevated(&self) -> bool {
        self.role
            .as_deref()
            .map(triage_shared::is_elevated_role)
            .unwrap_or(false)
    }
}

/// An event published after a committed ticket mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketEvent {
    pub event_id: Uuid,
    pub kind: EventKind,
    /// Short human summary, used as the notification title.
    pub title: String,
    pub description: String,
    pub resource_id: Option<i64>,
    /// Snapshot of the ticket after the mutation.
    pub ticket: Option<Ticket>,
    /// Map of field -> {old, new} for diffable fields.
    pub changes: serde_json::Value,
    pub actor_id: Option<i64>,
    /// Flat extra fields exposed to notification templates.
    pub data: serde_json::Value,
    pub suppress_rules: bool,
    pub timestamp: DateTime<Utc>,
}

impl TicketEvent {
    pub fn new(kind: EventKind, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            title: title.into(),
            description: description.into(),
            resource_id: None,
            ticket: None,
            changes: serde_json::json!({}),
            actor_id: None,
            data: serde_json::json!({}),
            suppress_rules: false,
            timestamp: Utc::now(),
        }
    }

    pub fn for_ticket(kind: EventKind, title: impl Into<String>, ticket: &Ticket, actor: &Actor) -> Self {
        let mut event = Self::new(kind, title, ticket.description.clone());
        event.resource_id = Some(ticket.id);
        event.ticket = Some(ticket.clone());
        event.actor_id = actor.id;
        event.suppress_rules = actor.automated;
        event.data = serde_json::json!({
            "ticket_id": ticket.id,
            "number": ticket.number,
            "status": ticket.status.as_str(),
            "priority": ticket.priority.as_str(),
            "assigned_to": ticket.assigned_to,
        });
        event
    }

    pub fn with_changes(mut self, changes: serde_json::Value) -> Self {
        self.changes = changes;
        self
    }

    pub fn with_data(mut self, key: &str, value: serde_json::Value) -> Self {
        if let Some(map) = self.data.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// Fixed sample event used by the webhook test endpoint.
    pub fn sample_alert() -> Self {
        let mut event = Self::new(
            EventKind::SystemAlert,
            "Test notification",
            "This is a test message sent from the webhook configuration screen.",
        );
        event.data = serde_json::json!({
            "source": "webhook_test",
            "severity": "info",
        });
        event
    }
}

/// Routes committed events to their consumers.
///
/// Rule execution runs to completion on the caller's task; notification
/// fan-out detaches onto a background task so slow webhooks never block a
/// ticket mutation.
pub struct EventRouter {
    automation: OnceLock<Arc<AutomationEngine>>,
    dispatcher: OnceLock<Arc<WebhookDispatcher>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            automation: OnceLock::new(),
            dispatcher: OnceLock::new(),
        }
    }

    /// Late wiring: the engines hold the router, so the consumers are
    /// attached after construction.
    pub fn wire(&self, automation: Arc<AutomationEngine>, dispatcher: Arc<WebhookDispatcher>) {
        let _ = self.automation.set(automation);
        let _ = self.dispatcher.set(dispatcher);
    }

    pub fn publish(&self, event: TicketEvent) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !event.suppress_rules {
                if let Some(automation) = self.automation.get() {
                    if let Err(e) = automation.execute_rules(&event).await {
                        error!("rule execution failed for {}: {}", event.kind, e);
                    }
                }
            }

            if let Some(dispatcher) = self.dispatcher.get() {
                let dispatcher = dispatcher.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    dispatcher.dispatch(&event).await;
                });
            }
        })
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_round_trip() {
        for kind in [
            EventKind::TicketCreated,
            EventKind::TicketUpdated,
            EventKind::TicketAssigned,
            EventKind::TicketResolved,
            EventKind::TicketClosed,
            EventKind::TicketComment,
            EventKind::TicketEscalated,
            EventKind::ScheduledCheck,
            EventKind::SystemAlert,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("ticket.deleted"), None);
    }

    #[test]
    fn test_system_actor_suppresses_rules() {
        assert!(Actor::system().automated);
        assert!(!Actor::user(7, "agent").automated);
        assert!(Actor::user(1, "admin").is_elevated());
        assert!(!Actor::user(1, "agent").is_elevated());
    }

    #[test]
    fn test_sample_alert_shape() {
        let event = TicketEvent::sample_alert();
        assert_eq!(event.kind, EventKind::SystemAlert);
        assert_eq!(event.data["source"], "webhook_test");
        assert!(event.resource_id.is_none());
    }
}
