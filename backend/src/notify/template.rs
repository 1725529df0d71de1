// Variable-substitution renderer for notification bodies and template
// subjects.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::events::TicketEvent;

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\.([A-Za-z0-9_]+)\}\}").expect("static pattern"))
}

/// Replace `{{.name}}` variables from the context map. Unknown variables are
/// left in place so broken templates stay visible in the delivered message.
pub fn render(template: &str, context: &HashMap<String, String>) -> String {
    variable_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            context
                .get(name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// The substitution context for an event: the standard variables plus every
/// flat field of `event.data`.
pub fn event_context(event: &TicketEvent) -> HashMap<String, String> {
    let mut context = HashMap::new();
    context.insert("title".to_string(), event.title.clone());
    context.insert("description".to_string(), event.description.clone());
    context.insert("type".to_string(), event.kind.as_str().to_string());
    context.insert(
        "resource_id".to_string(),
        event
            .resource_id
            .map(|id| id.to_string())
            .unwrap_or_default(),
    );
    context.insert("timestamp".to_string(), event.timestamp.to_rfc3339());

    if let Some(map) = event.data.as_object() {
        for (key, value) in map {
            context.insert(key.clone(), flat_value(value));
        }
    }

    context
}

/// Render an event through a user template, or the default format.
pub fn render_event(template: Option<&str>, event: &TicketEvent) -> String {
    let context = event_context(event);
    match template {
        Some(template) if !template.trim().is_empty() => render(template, &context),
        _ => default_message(event),
    }
}

/// The fallback message shape shared by all providers.
fn default_message(event: &TicketEvent) -> String {
    let mut lines = vec![
        format!("【{}】", event.title),
        event.description.clone(),
        format!("Event: {}", event.kind.as_str()),
    ];
    if let Some(id) = event.resource_id {
        lines.push(format!("Resource: #{id}"));
    }
    lines.push(format!("Time: {}", event.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
    lines.join("\n")
}

fn flat_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn event() -> TicketEvent {
        let mut event = TicketEvent::new(
            EventKind::TicketCreated,
            "Ticket created: VPN down",
            "The VPN concentrator dropped all sessions",
        );
        event.resource_id = Some(42);
        event.data = serde_json::json!({
            "priority": "urgent",
            "assigned_to": 7,
            "flagged": true,
        });
        event
    }

    #[test]
    fn substitutes_standard_variables() {
        let rendered = render_event(Some("{{.title}} [{{.type}}] #{{.resource_id}}"), &event());
        assert_eq!(rendered, "Ticket created: VPN down [ticket.created] #42");
    }

    #[test]
    fn substitutes_flat_data_fields() {
        let rendered = render_event(Some("p={{.priority}} u={{.assigned_to}} f={{.flagged}}"), &event());
        assert_eq!(rendered, "p=urgent u=7 f=true");
    }

    #[test]
    fn unknown_variables_stay_visible() {
        let rendered = render_event(Some("hello {{.nonexistent}}"), &event());
        assert_eq!(rendered, "hello {{.nonexistent}}");
    }

    #[test]
    fn empty_template_falls_back_to_default() {
        let rendered = render_event(Some("   "), &event());
        assert!(rendered.contains("Ticket created: VPN down"));
        assert!(rendered.contains("ticket.created"));
        assert!(rendered.contains("Resource: #42"));

        let rendered = render_event(None, &event());
        assert!(rendered.contains("ticket.created"));
    }
}
