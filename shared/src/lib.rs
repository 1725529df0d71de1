// Shared domain model for the Triage ticket automation platform.
//
// Entities mirror the relational schema; JSON-backed columns (tags,
// conditions, actions, working hours, escalation rules) are carried as raw
// `serde_json::Value` with a single parse/serialise helper pair per field
// type, so callers never hand-assemble JSON strings.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

// ===== Enums =====

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "ticket_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Pending,
    Resolved,
    Closed,
    Cancelled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            "closed" => Some(Self::Closed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states admit no further workflow transitions or assignment.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }

    /// States that still count against resolution SLAs.
    pub fn counts_for_sla(&self) -> bool {
        !matches!(self, Self::Resolved | Self::Closed | Self::Cancelled)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "ticket_priority", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
}

impl TicketPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Strict ordering used by the escalation engine.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Urgent => 3,
            Self::Critical => 4,
        }
    }

    /// One level up, capped at critical.
    pub fn bumped(&self) -> Self {
        match self {
            Self::Low => Self::Normal,
            Self::Normal => Self::High,
            Self::High => Self::Urgent,
            Self::Urgent => Self::Critical,
            Self::Critical => Self::Critical,
        }
    }

    pub fn is_high(&self) -> bool {
        self.rank() >= Self::High.rank()
    }
}

impl PartialOrd for TicketPriority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TicketPriority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for TicketPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "ticket_type", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketType {
    Incident,
    Request,
    Problem,
    Change,
    Complaint,
    Consultation,
}

impl TicketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incident => "incident",
            Self::Request => "request",
            Self::Problem => "problem",
            Self::Change => "change",
            Self::Complaint => "complaint",
            Self::Consultation => "consultation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incident" => Some(Self::Incident),
            "request" => Some(Self::Request),
            "problem" => Some(Self::Problem),
            "change" => Some(Self::Change),
            "complaint" => Some(Self::Complaint),
            "consultation" => Some(Self::Consultation),
            _ => None,
        }
    }
}

impl std::fmt::Display for TicketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "ticket_source", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketSource {
    Web,
    Email,
    Phone,
    Chat,
    Api,
    Mobile,
}

impl TicketSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Chat => "chat",
            Self::Api => "api",
            Self::Mobile => "mobile",
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "history_action", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Create,
    Update,
    StatusChange,
    PriorityChange,
    Assign,
    Unassign,
    Comment,
    Transfer,
    Escalate,
    Resolve,
    Close,
    Reopen,
    System,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::StatusChange => "status_change",
            Self::PriorityChange => "priority_change",
            Self::Assign => "assign",
            Self::Unassign => "unassign",
            Self::Comment => "comment",
            Self::Transfer => "transfer",
            Self::Escalate => "escalate",
            Self::Resolve => "resolve",
            Self::Close => "close",
            Self::Reopen => "reopen",
            Self::System => "system",
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "rule_type", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Assignment,
    Classification,
    Escalation,
    Sla,
    Notification,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assignment => "assignment",
            Self::Classification => "classification",
            Self::Escalation => "escalation",
            Self::Sla => "sla",
            Self::Notification => "notification",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "assignment" => Some(Self::Assignment),
            "classification" => Some(Self::Classification),
            "escalation" => Some(Self::Escalation),
            "sla" => Some(Self::Sla),
            "notification" => Some(Self::Notification),
            _ => None,
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "webhook_provider", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookProvider {
    Wechat,
    Dingtalk,
    Lark,
    Slack,
    Teams,
    Custom,
}

impl WebhookProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wechat => "wechat",
            Self::Dingtalk => "dingtalk",
            Self::Lark => "lark",
            Self::Slack => "slack",
            Self::Teams => "teams",
            Self::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "wechat" => Some(Self::Wechat),
            "dingtalk" => Some(Self::Dingtalk),
            "lark" => Some(Self::Lark),
            "slack" => Some(Self::Slack),
            "teams" => Some(Self::Teams),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "webhook_delivery_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Success,
    Failed,
    Retrying,
}

/// Binding between a condition and its predecessor in the evaluation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogicOp {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationActionKind {
    EscalateToManager,
    NotifyAdmin,
    ChangePriority,
}

// ===== Entities =====

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    /// Human-readable number, `TK-YYYYMMDD-HHMMSS-NNN`. Immutable.
    pub number: String,
    pub title: String,
    pub description: String,
    pub ticket_type: TicketType,
    pub priority: TicketPriority,
    pub status: TicketStatus,
    pub source: TicketSource,
    pub created_by: i64,
    pub assigned_to: Option<i64>,
    pub category_id: Option<i64>,
    pub due_date: Option<DateTime<Utc>>,
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    /// Canonical JSON array of strings.
    pub tags: serde_json::Value,
    /// Canonical JSON object.
    pub custom_fields: serde_json::Value,
    pub view_count: i32,
    pub comment_count: i32,
    pub history_count: i32,
    /// Customer satisfaction rating, 1-5.
    pub rating: Option<i32>,
    pub is_escalated: bool,
    pub first_reply_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Ticket {
    pub fn tag_list(&self) -> Vec<String> {
        parse_string_list(&self.tags)
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketComment {
    pub id: i64,
    pub ticket_id: i64,
    /// None means the platform itself wrote the comment.
    pub user_id: Option<i64>,
    pub content: String,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketHistory {
    pub id: i64,
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
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub rule_type: RuleType,
    pub is_active: bool,
    /// Lower executes earlier.
    pub priority: i32,
    pub trigger_event: String,
    /// JSON array of `RuleCondition`.
    pub conditions: serde_json::Value,
    /// JSON array of `RuleAction`.
    pub actions: serde_json::Value,
    pub execution_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub average_exec_time_ms: f64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationRule {
    pub fn parse_conditions(&self) -> Result<Vec<RuleCondition>, serde_json::Error> {
        parse_conditions(&self.conditions)
    }

    pub fn parse_actions(&self) -> Result<Vec<RuleAction>, serde_json::Error> {
        parse_actions(&self.actions)
    }
}

/// A single predicate evaluated against the ticket projection.
///
/// `operator` stays a free string so rules saved by a newer writer degrade to
/// a logged false-evaluation instead of a deserialisation failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub logic_op: LogicOp,
}

/// A tagged action: discriminator plus a free-form params map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub fn parse_conditions(value: &serde_json::Value) -> Result<Vec<RuleCondition>, serde_json::Error> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value.clone())
}

pub fn parse_actions(value: &serde_json::Value) -> Result<Vec<RuleAction>, serde_json::Error> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value.clone())
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationLog {
    pub id: i64,
    pub rule_id: i64,
    pub ticket_id: Option<i64>,
    pub trigger_event: String,
    pub executed_at: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
    /// JSON array of the actions that actually ran.
    pub actions_executed: serde_json::Value,
    /// JSON map of field -> {old, new}.
    pub changes: serde_json::Value,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaConfig {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub is_default: bool,
    pub ticket_type: Option<TicketType>,
    pub priority: Option<TicketPriority>,
    pub category_id: Option<i64>,
    pub assigned_to: Option<i64>,
    pub response_time_minutes: i32,
    pub resolution_time_minutes: i32,
    /// JSON map of weekday key -> {start, end} in HH:MM; missing = non-working.
    pub working_hours: serde_json::Value,
    pub exclude_weekends: bool,
    pub exclude_holidays: bool,
    /// JSON array of `EscalationRule`.
    pub escalation_rules: serde_json::Value,
    pub applied_count: i64,
    pub violation_count: i64,
    pub compliance_rate: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SlaConfig {
    pub fn parse_working_hours(&self) -> WorkingHours {
        WorkingHours::from_value(&self.working_hours)
    }

    pub fn parse_escalation_rules(&self) -> Result<Vec<EscalationRule>, serde_json::Error> {
        if self.escalation_rules.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(self.escalation_rules.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRule {
    /// Overdue threshold that arms this rule.
    pub trigger_minutes: i64,
    pub action: EscalationActionKind,
    #[serde(default)]
    pub target_user_id: Option<i64>,
    #[serde(default)]
    pub notify_users: Option<Vec<i64>>,
}

/// Per-weekday working windows, parsed once from the JSON column.
#[derive(Debug, Clone, Default)]
pub struct WorkingHours {
    windows: [Option<(NaiveTime, NaiveTime)>; 7],
}

impl WorkingHours {
    const KEYS: [&'static str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

    pub fn from_value(value: &serde_json::Value) -> Self {
        let mut windows: [Option<(NaiveTime, NaiveTime)>; 7] = Default::default();
        if let Some(map) = value.as_object() {
            for (i, key) in Self::KEYS.iter().enumerate() {
                let Some(day) = map.get(*key) else { continue };
                let start = day.get("start").and_then(|v| v.as_str()).unwrap_or("");
                let end = day.get("end").and_then(|v| v.as_str()).unwrap_or("");
                if let (Some(s), Some(e)) = (parse_hhmm(start), parse_hhmm(end)) {
                    if s < e {
                        windows[i] = Some((s, e));
                    }
                }
            }
        }
        Self { windows }
    }

    /// Standard nine-to-six, Monday through Friday.
    pub fn standard() -> Self {
        let window = Some((
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        ));
        Self {
            windows: [window, window, window, window, window, None, None],
        }
    }

    pub fn window_for(&self, weekday: Weekday) -> Option<(NaiveTime, NaiveTime)> {
        self.windows[weekday.num_days_from_monday() as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.windows.iter().all(|w| w.is_none())
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: i64,
    pub name: String,
    pub provider: WebhookProvider,
    pub url: String,
    pub secret: Option<String>,
    pub is_enabled: bool,
    /// JSON array of event tags this config subscribes to.
    pub events: serde_json::Value,
    pub template: Option<String>,
    pub filter_rules: serde_json::Value,
    pub max_retries: i32,
    pub retry_interval_seconds: i32,
    pub timeout_seconds: i32,
    /// Requests allowed per rate window; 0 disables limiting.
    pub rate_limit: i32,
    pub total_sent: i64,
    pub total_success: i64,
    pub total_failed: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookConfig {
    pub fn subscribed_events(&self) -> Vec<String> {
        parse_string_list(&self.events)
    }

    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.subscribed_events().iter().any(|e| e == event_type)
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLog {
    pub id: i64,
    pub config_id: i64,
    pub event_type: String,
    pub resource_id: Option<i64>,
    /// Serialised event, kept so the retry sweep can reconstruct it.
    pub event_payload: serde_json::Value,
    pub request_url: String,
    pub request_method: String,
    pub request_headers: serde_json::Value,
    pub request_body: String,
    pub response_status: Option<i32>,
    pub response_headers: serde_json::Value,
    pub response_body: Option<String>,
    pub response_time_ms: Option<i64>,
    pub status: WebhookStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub id: i64,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickReply {
    pub id: i64,
    pub name: String,
    pub content: String,
    pub sort_order: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Roles allowed to delete tickets they did not create, and to force-close.
pub const ELEVATED_ROLES: [&str; 2] = ["admin", "superuser"];

pub fn is_elevated_role(role: &str) -> bool {
    ELEVATED_ROLES.contains(&role)
}

// ===== JSON field helpers =====

/// Parse a list-of-strings column or request field.
///
/// Accepts the canonical JSON array, a JSON-encoded-string array, or a
/// comma-separated string. Entries are trimmed and empties dropped; order is
/// preserved.
pub fn parse_string_list(value: &serde_json::Value) -> Vec<String> {
    let raw: Vec<String> = match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        serde_json::Value::String(s) => {
            match serde_json::from_str::<Vec<String>>(s) {
                Ok(list) => list,
                Err(_) => s.split(',').map(|p| p.to_string()).collect(),
            }
        }
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// The canonical persisted form of a string list.
pub fn string_list_value(list: &[String]) -> serde_json::Value {
    serde_json::Value::Array(
        list.iter()
            .map(|s| serde_json::Value::String(s.clone()))
            .collect(),
    )
}

/// Normalise any accepted client encoding to the canonical array.
pub fn normalize_string_list(value: &serde_json::Value) -> serde_json::Value {
    string_list_value(&parse_string_list(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_ordering_is_strict() {
        assert!(TicketPriority::Low < TicketPriority::Normal);
        assert!(TicketPriority::Normal < TicketPriority::High);
        assert!(TicketPriority::High < TicketPriority::Urgent);
        assert!(TicketPriority::Urgent < TicketPriority::Critical);
    }

    #[test]
    fn priority_bump_caps_at_critical() {
        assert_eq!(TicketPriority::Urgent.bumped(), TicketPriority::Critical);
        assert_eq!(TicketPriority::Critical.bumped(), TicketPriority::Critical);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TicketStatus::Open,
            TicketStatus::InProgress,
            TicketStatus::Pending,
            TicketStatus::Resolved,
            TicketStatus::Closed,
            TicketStatus::Cancelled,
        ] {
            assert_eq!(TicketStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TicketStatus::parse("reopened"), None);
    }

    #[test]
    fn string_list_accepts_all_encodings() {
        let canonical = json!(["network", "vpn"]);
        assert_eq!(parse_string_list(&canonical), vec!["network", "vpn"]);

        let encoded = json!("[\"network\", \"vpn\"]");
        assert_eq!(parse_string_list(&encoded), vec!["network", "vpn"]);

        let comma = json!(" network, vpn ,, ");
        assert_eq!(parse_string_list(&comma), vec!["network", "vpn"]);
    }

    #[test]
    fn string_list_trims_and_drops_empties_preserving_order() {
        let value = json!(["  b ", "", "a", "  "]);
        assert_eq!(parse_string_list(&value), vec!["b", "a"]);
        assert_eq!(normalize_string_list(&value), json!(["b", "a"]));
    }

    #[test]
    fn conditions_parse_with_default_logic_op() {
        let value = json!([
            {"field": "priority", "operator": "eq", "value": "urgent"},
            {"field": "title", "operator": "contains", "value": "bug", "logic_op": "or"}
        ]);
        let conditions = parse_conditions(&value).unwrap();
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].logic_op, LogicOp::And);
        assert_eq!(conditions[1].logic_op, LogicOp::Or);
        assert!(parse_conditions(&serde_json::Value::Null).unwrap().is_empty());
    }

    #[test]
    fn working_hours_parse_and_lookup() {
        let value = json!({
            "mon": {"start": "09:00", "end": "18:00"},
            "sat": {"start": "", "end": ""}
        });
        let hours = WorkingHours::from_value(&value);
        let (start, end) = hours.window_for(Weekday::Mon).unwrap();
        assert_eq!(start, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(end, NaiveTime::from_hms_opt(18, 0, 0).unwrap());
        assert!(hours.window_for(Weekday::Sat).is_none());
        assert!(hours.window_for(Weekday::Sun).is_none());
    }

    #[test]
    fn inverted_working_window_is_ignored() {
        let value = json!({"mon": {"start": "18:00", "end": "09:00"}});
        assert!(WorkingHours::from_value(&value).window_for(Weekday::Mon).is_none());
    }

    #[test]
    fn escalation_rules_parse() {
        let config = SlaConfig {
            id: 1,
            name: "default".into(),
            is_active: true,
            is_default: true,
            ticket_type: None,
            priority: None,
            category_id: None,
            assigned_to: None,
            response_time_minutes: 60,
            resolution_time_minutes: 240,
            working_hours: serde_json::Value::Null,
            exclude_weekends: false,
            exclude_holidays: false,
            escalation_rules: json!([
                {"trigger_minutes": 60, "action": "escalate_to_manager", "target_user_id": 42}
            ]),
            applied_count: 0,
            violation_count: 0,
            compliance_rate: 0.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let rules = config.parse_escalation_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action, EscalationActionKind::EscalateToManager);
        assert_eq!(rules[0].target_user_id, Some(42));
    }
}
