// Rule actions - tagged variants dispatched through a small registry.
//
// Required-parameter metadata lives here with the registration, not inside
// the executor; save-time validation and execution both consult it.

use serde_json::Value;
use triage_shared::RuleAction;

use super::AutomationError;

/// The closed set of action kinds the executor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Assign,
    SetPriority,
    SetStatus,
    AddComment,
    Notify,
    Escalate,
    Classify,
}

/// Registration metadata for one action tag.
pub struct ActionSpec {
    pub tag: &'static str,
    pub kind: ActionKind,
    /// Params that must be present and non-null.
    pub required_params: &'static [&'static str],
}

pub const REGISTRY: &[ActionSpec] = &[
    ActionSpec {
        tag: "assign",
        kind: ActionKind::Assign,
        required_params: &["user_id"],
    },
    ActionSpec {
        tag: "set_priority",
        kind: ActionKind::SetPriority,
        required_params: &["priority"],
    },
    ActionSpec {
        tag: "set_status",
        kind: ActionKind::SetStatus,
        required_params: &["status"],
    },
    ActionSpec {
        tag: "add_comment",
        kind: ActionKind::AddComment,
        required_params: &["content"],
    },
    ActionSpec {
        tag: "notify",
        kind: ActionKind::Notify,
        required_params: &["recipients"],
    },
    ActionSpec {
        tag: "escalate",
        kind: ActionKind::Escalate,
        required_params: &["manager_id"],
    },
    ActionSpec {
        tag: "classify",
        kind: ActionKind::Classify,
        required_params: &["rules"],
    },
];

pub fn lookup(tag: &str) -> Option<&'static ActionSpec> {
    REGISTRY.iter().find(|spec| spec.tag == tag)
}

/// Resolve an action's kind, checking its required params.
pub fn resolve(action: &RuleAction) -> Result<ActionKind, AutomationError> {
    let spec = lookup(&action.action_type)
        .ok_or_else(|| AutomationError::UnknownAction(action.action_type.clone()))?;

    for param in spec.required_params {
        let present = action
            .params
            .get(*param)
            .map(|v| !v.is_null())
            .unwrap_or(false);
        if !present {
            return Err(AutomationError::InvalidAction(format!(
                "action '{}' requires param '{}'",
                spec.tag, param
            )));
        }
    }

    Ok(spec.kind)
}

/// Save-time validation of a full action list.
pub fn validate_actions(actions: &[RuleAction]) -> Result<(), AutomationError> {
    for action in actions {
        resolve(action)?;
    }
    Ok(())
}

/// Required param accessors used by the executor.

pub fn param_i64(params: &Value, key: &str) -> Result<i64, AutomationError> {
    params
        .get(key)
        .and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .ok_or_else(|| AutomationError::InvalidAction(format!("param '{key}' must be an integer")))
}

pub fn param_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, AutomationError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| AutomationError::InvalidAction(format!("param '{key}' must be a string")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(tag: &str, params: Value) -> RuleAction {
        RuleAction {
            action_type: tag.to_string(),
            params,
        }
    }

    #[test]
    fn registry_resolves_known_tags() {
        assert_eq!(
            resolve(&action("assign", json!({"user_id": 7}))).unwrap(),
            ActionKind::Assign
        );
        assert_eq!(
            resolve(&action("set_priority", json!({"priority": "high"}))).unwrap(),
            ActionKind::SetPriority
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = resolve(&action("delete_ticket", json!({}))).unwrap_err();
        assert!(matches!(err, AutomationError::UnknownAction(tag) if tag == "delete_ticket"));
    }

    #[test]
    fn missing_required_param_is_rejected() {
        let err = resolve(&action("assign", json!({}))).unwrap_err();
        assert!(matches!(err, AutomationError::InvalidAction(_)));

        // null counts as missing
        let err = resolve(&action("assign", json!({"user_id": null}))).unwrap_err();
        assert!(matches!(err, AutomationError::InvalidAction(_)));
    }

    #[test]
    fn validate_actions_fails_on_first_bad_entry() {
        let actions = vec![
            action("assign", json!({"user_id": 7})),
            action("bogus", json!({})),
        ];
        assert!(validate_actions(&actions).is_err());
    }

    #[test]
    fn param_i64_accepts_string_numbers() {
        assert_eq!(param_i64(&json!({"user_id": 7}), "user_id").unwrap(), 7);
        assert_eq!(param_i64(&json!({"user_id": "7"}), "user_id").unwrap(), 7);
        assert!(param_i64(&json!({"user_id": "abc"}), "user_id").is_err());
    }
}
