// SLA policy matching - most-specific config wins.

use triage_shared::{SlaConfig, Ticket};

/// Select the policy for a ticket.
///
/// Scoped configs are scored by how many of their scope fields match; a
/// config whose scope names a value the ticket does not have is out. Ties go
/// to the most recently created. With no scoped match the default applies;
/// with no default the ticket simply has no SLA.
pub fn match_policy<'a>(ticket: &Ticket, configs: &'a [SlaConfig]) -> Option<&'a SlaConfig> {
    let mut best: Option<(&SlaConfig, u32)> = None;

    for config in configs.iter().filter(|c| c.is_active && !c.is_default) {
        let Some(score) = specificity(ticket, config) else {
            continue;
        };
        if score == 0 {
            continue;
        }
        best = match best {
            None => Some((config, score)),
            Some((current, current_score)) => {
                if score > current_score
                    || (score == current_score && config.created_at > current.created_at)
                {
                    Some((config, score))
                } else {
                    Some((current, current_score))
                }
            }
        };
    }

    if let Some((config, _)) = best {
        return Some(config);
    }

    configs.iter().find(|c| c.is_active && c.is_default)
}

/// None if a scope field contradicts the ticket; otherwise the number of
/// scope fields that matched.
fn specificity(ticket: &Ticket, config: &SlaConfig) -> Option<u32> {
    let mut score = 0;

    if let Some(t) = config.ticket_type {
        if t != ticket.ticket_type {
            return None;
        }
        score += 1;
    }
    if let Some(p) = config.priority {
        if p != ticket.priority {
            return None;
        }
        score += 1;
    }
    if let Some(category_id) = config.category_id {
        if Some(category_id) != ticket.category_id {
            return None;
        }
        score += 1;
    }
    if let Some(assigned_to) = config.assigned_to {
        if Some(assigned_to) != ticket.assigned_to {
            return None;
        }
        score += 1;
    }

    Some(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use triage_shared::{TicketPriority, TicketSource, TicketStatus, TicketType};

    fn ticket() -> Ticket {
        Ticket {
            id: 1,
            number: "TK-20250101-000000-001".into(),
            title: "t".into(),
            description: String::new(),
            ticket_type: TicketType::Incident,
            priority: TicketPriority::Urgent,
            status: TicketStatus::Open,
            source: TicketSource::Web,
            created_by: 1,
            assigned_to: Some(5),
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

    fn config(id: i64, is_default: bool) -> SlaConfig {
        SlaConfig {
            id,
            name: format!("cfg-{id}"),
            is_active: true,
            is_default,
            ticket_type: None,
            priority: None,
            category_id: None,
            assigned_to: None,
            response_time_minutes: 60,
            resolution_time_minutes: 240,
            working_hours: json!({}),
            exclude_weekends: false,
            exclude_holidays: false,
            escalation_rules: json!([]),
            applied_count: 0,
            violation_count: 0,
            compliance_rate: 0.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn more_specific_config_wins() {
        let mut broad = config(1, false);
        broad.priority = Some(TicketPriority::Urgent);

        let mut narrow = config(2, false);
        narrow.priority = Some(TicketPriority::Urgent);
        narrow.ticket_type = Some(TicketType::Incident);

        let configs = vec![broad, narrow];
        assert_eq!(match_policy(&ticket(), &configs).unwrap().id, 2);
    }

    #[test]
    fn contradicting_scope_disqualifies() {
        let mut wrong = config(1, false);
        wrong.ticket_type = Some(TicketType::Request);
        wrong.priority = Some(TicketPriority::Urgent);

        let fallback = config(2, true);
        let configs = vec![wrong, fallback];
        assert_eq!(match_policy(&ticket(), &configs).unwrap().id, 2);
    }

    #[test]
    fn tie_goes_to_most_recently_created() {
        let mut older = config(1, false);
        older.priority = Some(TicketPriority::Urgent);
        older.created_at = Utc::now() - Duration::days(10);

        let mut newer = config(2, false);
        newer.priority = Some(TicketPriority::Urgent);

        let configs = vec![older, newer];
        assert_eq!(match_policy(&ticket(), &configs).unwrap().id, 2);
    }

    #[test]
    fn default_applies_when_nothing_matches() {
        let configs = vec![config(7, true)];
        assert_eq!(match_policy(&ticket(), &configs).unwrap().id, 7);
    }

    #[test]
    fn no_default_means_no_sla() {
        let mut scoped = config(1, false);
        scoped.priority = Some(TicketPriority::Low);
        let configs = vec![scoped];
        assert!(match_policy(&ticket(), &configs).is_none());
    }

    #[test]
    fn inactive_configs_are_ignored() {
        let mut inactive = config(1, true);
        inactive.is_active = false;
        let configs = vec![inactive];
        assert!(match_policy(&ticket(), &configs).is_none());
    }
}
