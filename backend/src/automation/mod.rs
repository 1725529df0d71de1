// Automation Rule Engine
//
// Declarative {trigger, conditions, actions} rules evaluated against ticket
// events. Rule execution is isolated per rule: a failure is logged and
// accounted, then the next rule runs.

pub mod actions;
pub mod conditions;
pub mod engine;
pub mod executor;

pub use engine::{AutomationEngine, LogListParams, RuleListParams, SaveRuleRequest};

use thiserror::Error;

use crate::error::AppError;

/// Failure modes internal to rule handling. They cross the HTTP boundary as
/// the stable `AppError` kinds.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("rule not found")]
    RuleNotFound,
    #[error("invalid condition: {0}")]
    InvalidCondition(String),
    #[error("invalid action: {0}")]
    InvalidAction(String),
    #[error("unknown action type '{0}'")]
    UnknownAction(String),
    #[error(transparent)]
    App(#[from] AppError),
}

impl From<AutomationError> for AppError {
    fn from(err: AutomationError) -> Self {
        match err {
            AutomationError::RuleNotFound => AppError::not_found("Rule"),
            AutomationError::InvalidCondition(msg) => AppError::validation("conditions", &msg),
            AutomationError::InvalidAction(msg) => AppError::validation("actions", &msg),
            AutomationError::UnknownAction(tag) => {
                AppError::validation("actions", &format!("unknown action type '{tag}'"))
            }
            AutomationError::App(inner) => inner,
        }
    }
}

impl From<sqlx::Error> for AutomationError {
    fn from(err: sqlx::Error) -> Self {
        Self::App(err.into())
    }
}
