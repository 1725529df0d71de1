// Notification fan-out - outbound webhook dispatch, delivery logging, and
// the retry sweep.
//
// Fan-out across configs is concurrent; attempts against one config are
// serial. A failing config never blocks another.

pub mod providers;
pub mod template;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use sqlx::PgPool;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use triage_shared::{WebhookConfig, WebhookLog, WebhookStatus};

use crate::error::{ApiResult, AppError};
use crate::events::TicketEvent;
use providers::PreparedRequest;

pub const USER_AGENT: &str = "TicketSystem-Webhook/1.0";

/// How many due retries one sweep picks up.
const RETRY_SWEEP_LIMIT: i64 = 100;
/// Window for the per-config rate limit.
const RATE_WINDOW_SECONDS: i64 = 60;

#[derive(Clone)]
pub struct WebhookDispatcher {
    pool: PgPool,
    client: reqwest::Client,
}

/// What one HTTP attempt produced.
struct AttemptOutcome {
    status: Option<u16>,
    response_headers: serde_json::Value,
    response_body: Option<String>,
    latency_ms: i64,
    error: Option<String>,
}

impl AttemptOutcome {
    fn succeeded(&self) -> bool {
        matches!(self.status, Some(s) if (200..300).contains(&s))
    }
}

impl WebhookDispatcher {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            client: reqwest::Client::new(),
        }
    }

    /// Fan an event out to every enabled config subscribed to its type.
    pub async fn dispatch(&self, event: &TicketEvent) {
        let configs = match self.subscribed_configs(event.kind.as_str()).await {
            Ok(configs) => configs,
            Err(e) => {
                error!("failed to load webhook configs: {}", e);
                return;
            }
        };

        if configs.is_empty() {
            return;
        }

        let workers = configs.into_iter().filter(|c| passes_filters(c, event)).map(|config| {
            let dispatcher = self.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.dispatch_to_config(&config, &event).await {
                    error!("webhook dispatch to '{}' failed: {}", config.name, e);
                }
            })
        });

        join_all(workers).await;
    }

    /// One delivery attempt for one config: create the log row, POST, and
    /// record the outcome. Further attempts belong to the retry sweep.
    pub async fn dispatch_to_config(
        &self,
        config: &WebhookConfig,
        event: &TicketEvent,
    ) -> ApiResult<WebhookLog> {
        if self.rate_limited(config).await? {
            warn!("webhook '{}' rate limited, dropping {}", config.name, event.kind);
            return Err(AppError::Transient(format!(
                "webhook '{}' is rate limited",
                config.name
            )));
        }

        sqlx::query("UPDATE webhook_configs SET last_triggered_at = NOW() WHERE id = $1")
            .bind(config.id)
            .execute(&self.pool)
            .await?;

        let log_id = self.create_log(config, event).await?;
        self.attempt_delivery(config, event, log_id, 0).await?;
        self.load_log(log_id).await
    }

    /// Sweep deliveries that are due for a retry. Each row is re-dispatched
    /// to its own config only, with the event reconstructed from the log.
    pub async fn run_retry_sweep(&self) -> ApiResult<u64> {
        let due = sqlx::query_as::<_, WebhookLog>(
            r#"
            SELECT l.* FROM webhook_logs l
            JOIN webhook_configs c ON l.config_id = c.id
            WHERE l.status = 'retrying'
              AND l.next_retry_at <= NOW()
              AND l.retry_count < c.max_retries
            ORDER BY l.next_retry_at ASC
            LIMIT $1
            "#,
        )
        .bind(RETRY_SWEEP_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        let mut retried = 0u64;

        for log in due {
            let config = match self.load_config(log.config_id).await {
                Ok(config) => config,
                Err(e) => {
                    warn!("retry sweep: config {} unavailable: {}", log.config_id, e);
                    continue;
                }
            };

            let event: TicketEvent = match serde_json::from_value(log.event_payload.clone()) {
                Ok(event) => event,
                Err(e) => {
                    warn!("retry sweep: log {} has unreadable event, marking failed: {}", log.id, e);
                    self.mark_failed(log.id, &format!("unreadable stored event: {e}")).await?;
                    continue;
                }
            };

            let retry_count = log.retry_count + 1;
            sqlx::query("UPDATE webhook_logs SET retry_count = $2, updated_at = NOW() WHERE id = $1")
                .bind(log.id)
                .bind(retry_count)
                .execute(&self.pool)
                .await?;

            if let Err(e) = self.attempt_delivery(&config, &event, log.id, retry_count).await {
                warn!("retry attempt for log {} failed: {}", log.id, e);
            }
            retried += 1;
        }

        Ok(retried)
    }

    /// Synthesize a `system.alert` with fixed sample data and push it
    /// through the normal delivery path, so operators can verify a config
    /// end to end.
    pub async fn test_config(&self, config_id: i64) -> ApiResult<WebhookLog> {
        let config = self.load_config(config_id).await?;
        let event = TicketEvent::sample_alert();
        self.dispatch_to_config(&config, &event).await
    }

    // ===== internals =====

    async fn attempt_delivery(
        &self,
        config: &WebhookConfig,
        event: &TicketEvent,
        log_id: i64,
        retry_count: i32,
    ) -> ApiResult<()> {
        let content = template::render_event(config.template.as_deref(), event);

        let prepared = match providers::build_request(config, &content, Utc::now()) {
            Ok(prepared) => prepared,
            Err(e) => {
                let message = e.public_message();
                self.mark_failed(log_id, &message).await?;
                self.bump_counters(config.id, false, Some(&message)).await?;
                return Err(e);
            }
        };

        let timeout = Duration::from_secs(config.timeout_seconds.max(1) as u64);
        let outcome = post_prepared(&self.client, &prepared, timeout).await;
        let success = outcome.succeeded();

        let (status, next_retry_at) = retry_decision(
            success,
            retry_count,
            config.max_retries,
            config.retry_interval_seconds,
            Utc::now(),
        );

        sqlx::query(
            r#"
            UPDATE webhook_logs SET
                request_url = $2,
                request_headers = $3,
                request_body = $4,
                response_status = $5,
                response_headers = $6,
                response_body = $7,
                response_time_ms = $8,
                status = $9,
                next_retry_at = $10,
                error_message = $11,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(log_id)
        .bind(&prepared.url)
        .bind(request_headers_json(&prepared))
        .bind(prepared.body.to_string())
        .bind(outcome.status.map(|s| s as i32))
        .bind(&outcome.response_headers)
        .bind(&outcome.response_body)
        .bind(outcome.latency_ms)
        .bind(status)
        .bind(next_retry_at)
        .bind(&outcome.error)
        .execute(&self.pool)
        .await?;

        let error_text = outcome.error.clone().or_else(|| {
            outcome
                .status
                .filter(|s| !(200..300).contains(s))
                .map(|s| format!("HTTP {s}"))
        });
        self.bump_counters(config.id, success, error_text.as_deref()).await?;

        if success {
            info!(
                "delivered {} to '{}' in {} ms",
                event.kind, config.name, outcome.latency_ms
            );
        }

        Ok(())
    }

    async fn create_log(&self, config: &WebhookConfig, event: &TicketEvent) -> ApiResult<i64> {
        let payload = serde_json::to_value(event)?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_logs
                (config_id, event_type, resource_id, event_payload,
                 request_url, request_method, status)
            VALUES ($1, $2, $3, $4, $5, 'POST', 'pending')
            RETURNING id
            "#,
        )
        .bind(config.id)
        .bind(event.kind.as_str())
        .bind(event.resource_id)
        .bind(&payload)
        .bind(&config.url)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn mark_failed(&self, log_id: i64, message: &str) -> ApiResult<()> {
        sqlx::query(
            "UPDATE webhook_logs SET status = 'failed', error_message = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(log_id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rolling counters with store-side increments, so concurrent dispatch
    /// never loses updates.
    async fn bump_counters(&self, config_id: i64, success: bool, error: Option<&str>) -> ApiResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_configs SET
                total_sent = total_sent + 1,
                total_success = total_success + CASE WHEN $2 THEN 1 ELSE 0 END,
                total_failed = total_failed + CASE WHEN $2 THEN 0 ELSE 1 END,
                last_success_at = CASE WHEN $2 THEN NOW() ELSE last_success_at END,
                last_error_at = CASE WHEN $2 THEN last_error_at ELSE NOW() END,
                last_error = CASE WHEN $2 THEN last_error ELSE $3 END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(config_id)
        .bind(success)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rate_limited(&self, config: &WebhookConfig) -> ApiResult<bool> {
        if config.rate_limit <= 0 {
            return Ok(false);
        }
        let recent: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM webhook_logs WHERE config_id = $1 AND created_at > NOW() - make_interval(secs => $2)",
        )
        .bind(config.id)
        .bind(RATE_WINDOW_SECONDS as f64)
        .fetch_one(&self.pool)
        .await?;
        Ok(recent >= config.rate_limit as i64)
    }

    async fn subscribed_configs(&self, event_type: &str) -> ApiResult<Vec<WebhookConfig>> {
        Ok(sqlx::query_as::<_, WebhookConfig>(
            "SELECT * FROM webhook_configs WHERE is_enabled = TRUE AND events @> to_jsonb($1::text)",
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn load_config(&self, id: i64) -> ApiResult<WebhookConfig> {
        sqlx::query_as::<_, WebhookConfig>("SELECT * FROM webhook_configs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("Webhook config"))
    }

    async fn load_log(&self, id: i64) -> ApiResult<WebhookLog> {
        sqlx::query_as::<_, WebhookLog>("SELECT * FROM webhook_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::not_found("Webhook log"))
    }
}

/// Optional per-config filters: restrict delivery by ticket priority or type.
fn passes_filters(config: &WebhookConfig, event: &TicketEvent) -> bool {
    let Some(rules) = config.filter_rules.as_object() else {
        return true;
    };
    let Some(ticket) = &event.ticket else {
        return true;
    };

    if let Some(priorities) = rules.get("priorities").and_then(|v| v.as_array()) {
        if !priorities.is_empty()
            && !priorities.iter().any(|p| p.as_str() == Some(ticket.priority.as_str()))
        {
            return false;
        }
    }
    if let Some(types) = rules.get("ticket_types").and_then(|v| v.as_array()) {
        if !types.is_empty()
            && !types.iter().any(|t| t.as_str() == Some(ticket.ticket_type.as_str()))
        {
            return false;
        }
    }
    true
}

fn request_headers_json(prepared: &PreparedRequest) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert("User-Agent".to_string(), serde_json::json!(USER_AGENT));
    map.insert("Content-Type".to_string(), serde_json::json!("application/json"));
    for (name, value) in &prepared.headers {
        map.insert(name.clone(), serde_json::json!(value));
    }
    serde_json::Value::Object(map)
}

/// Delivery state after an attempt: success, schedule a retry, or give up.
fn retry_decision(
    success: bool,
    retry_count: i32,
    max_retries: i32,
    retry_interval_seconds: i32,
    now: DateTime<Utc>,
) -> (WebhookStatus, Option<DateTime<Utc>>) {
    if success {
        return (WebhookStatus::Success, None);
    }
    if retry_count < max_retries {
        (
            WebhookStatus::Retrying,
            Some(now + ChronoDuration::seconds(retry_interval_seconds.max(1) as i64)),
        )
    } else {
        (WebhookStatus::Failed, None)
    }
}

/// The raw HTTP POST, isolated from the store so it can be exercised against
/// a mock server.
async fn post_prepared(
    client: &reqwest::Client,
    prepared: &PreparedRequest,
    timeout: Duration,
) -> AttemptOutcome {
    let started = Instant::now();

    let mut request = client
        .post(&prepared.url)
        .timeout(timeout)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .json(&prepared.body);
    for (name, value) in &prepared.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let mut headers = serde_json::Map::new();
            for (name, value) in response.headers() {
                headers.insert(
                    name.to_string(),
                    serde_json::json!(value.to_str().unwrap_or_default()),
                );
            }
            let body = response.text().await.ok();
            AttemptOutcome {
                status: Some(status),
                response_headers: serde_json::Value::Object(headers),
                response_body: body,
                latency_ms: started.elapsed().as_millis() as i64,
                error: None,
            }
        }
        Err(e) => AttemptOutcome {
            status: None,
            response_headers: serde_json::json!({}),
            response_body: None,
            latency_ms: started.elapsed().as_millis() as i64,
            error: Some(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_shared::WebhookProvider;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prepared(url: String) -> PreparedRequest {
        PreparedRequest {
            url,
            headers: vec![("X-Lark-Request-Nonce".to_string(), "ticket-system".to_string())],
            body: serde_json::json!({ "text": "hello" }),
        }
    }

    #[tokio::test]
    async fn post_sends_user_agent_and_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/intake"))
            .and(header("user-agent", USER_AGENT))
            .and(header("x-lark-request-nonce", "ticket-system"))
            .and(body_partial_json(serde_json::json!({ "text": "hello" })))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let outcome = post_prepared(
            &client,
            &prepared(format!("{}/intake", server.uri())),
            Duration::from_secs(5),
        )
        .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.status, Some(200));
        assert_eq!(outcome.response_body.as_deref(), Some("ok"));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn two_failures_then_success_mirrors_the_retry_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/intake"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/intake"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let target = prepared(format!("{}/intake", server.uri()));

        let now = Utc::now();
        let max_retries = 2;
        let mut statuses = Vec::new();
        let mut state = WebhookStatus::Pending;

        for attempt in 0..=max_retries {
            let outcome = post_prepared(&client, &target, Duration::from_secs(5)).await;
            statuses.push(outcome.status.unwrap());
            let (next_state, next_retry) =
                retry_decision(outcome.succeeded(), attempt, max_retries, 1, now);
            state = next_state;
            if state == WebhookStatus::Success {
                assert!(next_retry.is_none());
                break;
            }
            assert_eq!(state, WebhookStatus::Retrying);
            assert_eq!(next_retry, Some(now + ChronoDuration::seconds(1)));
        }

        assert_eq!(statuses, vec![500, 500, 200]);
        assert_eq!(state, WebhookStatus::Success);
    }

    #[tokio::test]
    async fn exhausted_retries_become_failed() {
        let (state, next) = retry_decision(false, 2, 2, 60, Utc::now());
        assert_eq!(state, WebhookStatus::Failed);
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn connection_error_is_captured_not_raised() {
        // nothing listens on this port
        let client = reqwest::Client::new();
        let outcome = post_prepared(
            &client,
            &prepared("http://127.0.0.1:9/intake".to_string()),
            Duration::from_millis(500),
        )
        .await;
        assert!(!outcome.succeeded());
        assert!(outcome.status.is_none());
        assert!(outcome.error.is_some());
    }

    #[test]
    fn filters_respect_priority_and_type() {
        let mut config = WebhookConfig {
            id: 1,
            name: "c".into(),
            provider: WebhookProvider::Slack,
            url: "https://example.com".into(),
            secret: None,
            is_enabled: true,
            events: serde_json::json!(["ticket.created"]),
            template: None,
            filter_rules: serde_json::json!({ "priorities": ["urgent", "critical"] }),
            max_retries: 3,
            retry_interval_seconds: 60,
            timeout_seconds: 10,
            rate_limit: 0,
            total_sent: 0,
            total_success: 0,
            total_failed: 0,
            last_triggered_at: None,
            last_success_at: None,
            last_error_at: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let event = crate::events::TicketEvent::sample_alert();
        // no ticket on the event: filters pass
        assert!(passes_filters(&config, &event));

        config.filter_rules = serde_json::json!({});
        assert!(passes_filters(&config, &event));
    }
}
