// Condition evaluation - typed operators over a fixed ticket projection.

use serde_json::Value;
use tracing::warn;
use triage_shared::{LogicOp, RuleCondition, Ticket};

/// Resolve a condition field against the ticket projection. Unknown fields
/// evaluate to null; null never equals, exceeds, or falls below a non-null
/// value.
pub fn project_field(ticket: &Ticket, field: &str) -> Value {
    match field {
        "title" => Value::String(ticket.title.clone()),
        "content" => Value::String(ticket.description.clone()),
        "type" => Value::String(ticket.ticket_type.as_str().to_string()),
        "priority" => Value::String(ticket.priority.as_str().to_string()),
        "status" => Value::String(ticket.status.as_str().to_string()),
        "assigned_user_id" => ticket
            .assigned_to
            .map(|id| Value::from(id))
            .unwrap_or(Value::Null),
        "creator_id" => Value::from(ticket.created_by),
        "created_at" => Value::String(ticket.created_at.to_rfc3339()),
        "updated_at" => Value::String(ticket.updated_at.to_rfc3339()),
        _ => Value::Null,
    }
}

/// Evaluate a full condition list left to right.
///
/// The result starts as the first condition's value; each subsequent
/// condition is folded in with its own `logic_op`. There is no precedence;
/// authors express grouping by ordering. An empty list is true.
pub fn evaluate_conditions(conditions: &[RuleCondition], ticket: &Ticket) -> bool {
    let Some((first, rest)) = conditions.split_first() else {
        return true;
    };

    let mut result = evaluate_condition(first, ticket);
    for condition in rest {
        let value = evaluate_condition(condition, ticket);
        result = match condition.logic_op {
            LogicOp::And => result && value,
            LogicOp::Or => result || value,
        };
    }
    result
}

pub fn evaluate_condition(condition: &RuleCondition, ticket: &Ticket) -> bool {
    let field = project_field(ticket, &condition.field);

    match condition.operator.as_str() {
        "eq" => coerced_eq(&field, &condition.value),
        "ne" => !coerced_eq(&field, &condition.value),
        "contains" => with_strings(&field, &condition.value, |f, v| f.contains(&v)),
        "starts_with" => with_strings(&field, &condition.value, |f, v| f.starts_with(&v)),
        "ends_with" => with_strings(&field, &condition.value, |f, v| f.ends_with(&v)),
        "regex" => {
            let (Some(f), Some(pattern)) = (stringify(&field), condition.value.as_str()) else {
                return false;
            };
            match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(&f),
                Err(_) => {
                    warn!("invalid regex in rule condition: {}", pattern);
                    false
                }
            }
        }
        "in" => membership(&field, &condition.value),
        "not_in" => !membership(&field, &condition.value),
        "gt" => numeric(&field, &condition.value, |f, v| f > v),
        "gte" => numeric(&field, &condition.value, |f, v| f >= v),
        "lt" => numeric(&field, &condition.value, |f, v| f < v),
        "lte" => numeric(&field, &condition.value, |f, v| f <= v),
        other => {
            warn!("unknown condition operator '{}', evaluating false", other);
            false
        }
    }
}

/// String coercion: strings pass through, numbers and bools render, null is
/// absent.
fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn coerced_eq(field: &Value, value: &Value) -> bool {
    match (stringify(field), stringify(value)) {
        (Some(f), Some(v)) => f == v,
        (None, None) => true,
        _ => false,
    }
}

/// Case-insensitive substring comparisons; null field is never a match.
fn with_strings(field: &Value, value: &Value, op: impl Fn(&str, String) -> bool) -> bool {
    match (stringify(field), stringify(value)) {
        (Some(f), Some(v)) => op(&f.to_lowercase(), v.to_lowercase()),
        _ => false,
    }
}

fn membership(field: &Value, value: &Value) -> bool {
    let Some(f) = stringify(field) else {
        return false;
    };
    let Some(items) = value.as_array() else {
        return false;
    };
    items.iter().any(|item| stringify(item).as_deref() == Some(f.as_str()))
}

/// Numeric comparison after coercing both sides to f64; unparseable is false.
fn numeric(field: &Value, value: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    let f = stringify(field).and_then(|s| s.parse::<f64>().ok());
    let v = stringify(value).and_then(|s| s.parse::<f64>().ok());
    match (f, v) {
        (Some(f), Some(v)) => op(f, v),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use triage_shared::{TicketPriority, TicketSource, TicketStatus, TicketType};

    fn ticket() -> Ticket {
        Ticket {
            id: 10,
            number: "TK-20250101-000000-001".into(),
            title: "server issue".into(),
            description: "The VPN concentrator drops connections".into(),
            ticket_type: TicketType::Incident,
            priority: TicketPriority::Urgent,
            status: TicketStatus::Open,
            source: TicketSource::Web,
            created_by: 3,
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

    fn cond(field: &str, operator: &str, value: Value) -> RuleCondition {
        RuleCondition {
            field: field.into(),
            operator: operator.into(),
            value,
            logic_op: LogicOp::And,
        }
    }

    fn cond_or(field: &str, operator: &str, value: Value) -> RuleCondition {
        RuleCondition {
            logic_op: LogicOp::Or,
            ..cond(field, operator, value)
        }
    }

    #[test]
    fn empty_condition_list_is_true() {
        assert!(evaluate_conditions(&[], &ticket()));
    }

    #[test]
    fn eq_is_string_coerced() {
        assert!(evaluate_condition(&cond("priority", "eq", json!("urgent")), &ticket()));
        assert!(evaluate_condition(&cond("creator_id", "eq", json!("3")), &ticket()));
        assert!(evaluate_condition(&cond("creator_id", "eq", json!(3)), &ticket()));
        assert!(!evaluate_condition(&cond("priority", "eq", json!("low")), &ticket()));
    }

    #[test]
    fn null_field_never_equals_non_null() {
        // unassigned ticket: assigned_user_id is null
        assert!(!evaluate_condition(&cond("assigned_user_id", "eq", json!(7)), &ticket()));
        assert!(!evaluate_condition(&cond("assigned_user_id", "gt", json!(0)), &ticket()));
        // unknown fields project to null too
        assert!(!evaluate_condition(&cond("nonexistent", "eq", json!("x")), &ticket()));
    }

    #[test]
    fn substring_operators_are_case_insensitive() {
        assert!(evaluate_condition(&cond("title", "contains", json!("SERVER")), &ticket()));
        assert!(evaluate_condition(&cond("title", "starts_with", json!("Server")), &ticket()));
        assert!(evaluate_condition(&cond("title", "ends_with", json!("ISSUE")), &ticket()));
        assert!(!evaluate_condition(&cond("title", "contains", json!("printer")), &ticket()));
    }

    #[test]
    fn invalid_regex_evaluates_false_without_panicking() {
        assert!(!evaluate_condition(&cond("title", "regex", json!("[unclosed")), &ticket()));
        assert!(evaluate_condition(&cond("title", "regex", json!("^server")), &ticket()));
        // regex stays case-sensitive
        assert!(!evaluate_condition(&cond("title", "regex", json!("^SERVER")), &ticket()));
    }

    #[test]
    fn membership_is_string_coerced() {
        assert!(evaluate_condition(
            &cond("priority", "in", json!(["high", "urgent"])),
            &ticket()
        ));
        assert!(evaluate_condition(
            &cond("priority", "not_in", json!(["low", "normal"])),
            &ticket()
        ));
        // non-array value is never a match
        assert!(!evaluate_condition(&cond("priority", "in", json!("urgent")), &ticket()));
    }

    #[test]
    fn unparseable_numeric_compare_is_false() {
        assert!(!evaluate_condition(&cond("title", "gt", json!(5)), &ticket()));
        assert!(!evaluate_condition(&cond("creator_id", "gt", json!("abc")), &ticket()));
        assert!(evaluate_condition(&cond("creator_id", "gte", json!(3)), &ticket()));
        assert!(evaluate_condition(&cond("creator_id", "lt", json!("10")), &ticket()));
    }

    #[test]
    fn unknown_operator_evaluates_false() {
        assert!(!evaluate_condition(&cond("priority", "matches", json!("urgent")), &ticket()));
    }

    #[test]
    fn left_to_right_or_combination() {
        // first condition false, OR with second true => fires
        let conditions = vec![
            cond("title", "contains", json!("bug")),
            cond_or("priority", "in", json!(["high", "urgent"])),
        ];
        assert!(evaluate_conditions(&conditions, &ticket()));
    }

    #[test]
    fn and_chains_require_all() {
        let conditions = vec![
            cond("type", "eq", json!("incident")),
            cond("priority", "eq", json!("urgent")),
            cond("status", "eq", json!("closed")),
        ];
        assert!(!evaluate_conditions(&conditions, &ticket()));
    }

    #[test]
    fn no_precedence_only_ordering() {
        // (false AND true) OR true -> true when evaluated strictly left to right
        let conditions = vec![
            cond("title", "contains", json!("bug")),
            cond("priority", "eq", json!("urgent")),
            cond_or("type", "eq", json!("incident")),
        ];
        assert!(evaluate_conditions(&conditions, &ticket()));
    }
}
