// Provider-specific webhook bodies and signatures.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use triage_shared::{WebhookConfig, WebhookProvider};

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

/// A request ready to POST: final URL (possibly signed), extra headers, and
/// the JSON body.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
}

/// Build the provider-specific request for one rendered message.
pub fn build_request(
    config: &WebhookConfig,
    content: &str,
    now: DateTime<Utc>,
) -> Result<PreparedRequest, AppError> {
    if config.url.trim().is_empty() {
        return Err(AppError::ConfigIncomplete(format!(
            "webhook config '{}' has no URL",
            config.name
        )));
    }

    let mut url = config.url.clone();
    let mut headers = Vec::new();

    let body = match config.provider {
        WebhookProvider::Wechat => serde_json::json!({
            "msgtype": "markdown",
            "markdown": { "content": content }
        }),
        WebhookProvider::Dingtalk => {
            if let Some(secret) = non_empty(&config.secret) {
                let timestamp = now.timestamp_millis();
                let sign = dingtalk_sign(secret, timestamp)?;
                let separator = if url.contains('?') { '&' } else { '?' };
                url = format!(
                    "{url}{separator}timestamp={timestamp}&sign={}",
                    urlencoding::encode(&sign)
                );
            }
            serde_json::json!({
                "msgtype": "markdown",
                "markdown": { "title": "工单系统通知", "text": content }
            })
        }
        WebhookProvider::Lark => {
            if let Some(secret) = non_empty(&config.secret) {
                let timestamp = now.timestamp();
                let sign = lark_sign(secret, timestamp)?;
                headers.push(("X-Lark-Request-Timestamp".to_string(), timestamp.to_string()));
                headers.push(("X-Lark-Request-Nonce".to_string(), "ticket-system".to_string()));
                headers.push(("X-Lark-Signature".to_string(), sign));
            }
            serde_json::json!({
                "msg_type": "text",
                "content": { "text": content }
            })
        }
        WebhookProvider::Slack => serde_json::json!({ "text": content }),
        WebhookProvider::Teams => serde_json::json!({ "text": content }),
        WebhookProvider::Custom => serde_json::json!({
            "text": content,
            "timestamp": now.timestamp()
        }),
    };

    Ok(PreparedRequest { url, headers, body })
}

/// DingTalk: `base64(HMAC_SHA256(key=secret, data="<millis>\n<secret>"))`.
pub fn dingtalk_sign(secret: &str, timestamp_millis: i64) -> Result<String, AppError> {
    let data = format!("{timestamp_millis}\n{secret}");
    hmac_base64(secret.as_bytes(), data.as_bytes())
}

/// Lark: `base64(HMAC_SHA256(key="<secs>\nticket-system\n<secret>", data=""))`.
pub fn lark_sign(secret: &str, timestamp_secs: i64) -> Result<String, AppError> {
    let key = format!("{timestamp_secs}\nticket-system\n{secret}");
    hmac_base64(key.as_bytes(), b"")
}

fn hmac_base64(key: &[u8], data: &[u8]) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AppError::internal(format!("HMAC init failed: {e}")))?;
    mac.update(data);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn config(provider: WebhookProvider, secret: Option<&str>) -> WebhookConfig {
        WebhookConfig {
            id: 1,
            name: "chat".into(),
            provider,
            url: "https://hooks.example.com/intake".into(),
            secret: secret.map(|s| s.to_string()),
            is_enabled: true,
            events: json!(["ticket.created"]),
            template: None,
            filter_rules: json!({}),
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
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn wechat_body_shape() {
        let req = build_request(&config(WebhookProvider::Wechat, None), "hello", at()).unwrap();
        assert_eq!(req.body["msgtype"], "markdown");
        assert_eq!(req.body["markdown"]["content"], "hello");
        assert!(req.headers.is_empty());
        assert_eq!(req.url, "https://hooks.example.com/intake");
    }

    #[test]
    fn dingtalk_body_and_signed_url() {
        let req = build_request(&config(WebhookProvider::Dingtalk, Some("s3cret")), "hi", at()).unwrap();
        assert_eq!(req.body["msgtype"], "markdown");
        assert_eq!(req.body["markdown"]["title"], "工单系统通知");
        assert_eq!(req.body["markdown"]["text"], "hi");

        let millis = at().timestamp_millis();
        assert!(req.url.contains(&format!("timestamp={millis}")));
        assert!(req.url.contains("&sign="));

        // the sign query value is the url-encoded base64 signature
        let expected = dingtalk_sign("s3cret", millis).unwrap();
        assert!(req.url.ends_with(&urlencoding::encode(&expected).into_owned()));
    }

    #[test]
    fn dingtalk_without_secret_leaves_url_untouched() {
        let req = build_request(&config(WebhookProvider::Dingtalk, None), "hi", at()).unwrap();
        assert_eq!(req.url, "https://hooks.example.com/intake");
    }

    #[test]
    fn lark_headers_carry_signature() {
        let req = build_request(&config(WebhookProvider::Lark, Some("s3cret")), "hi", at()).unwrap();
        assert_eq!(req.body["msg_type"], "text");
        assert_eq!(req.body["content"]["text"], "hi");

        let ts = at().timestamp().to_string();
        let headers: std::collections::HashMap<_, _> = req.headers.iter().cloned().collect();
        assert_eq!(headers.get("X-Lark-Request-Timestamp"), Some(&ts));
        assert_eq!(
            headers.get("X-Lark-Request-Nonce"),
            Some(&"ticket-system".to_string())
        );
        assert_eq!(
            headers.get("X-Lark-Signature"),
            Some(&lark_sign("s3cret", at().timestamp()).unwrap())
        );
    }

    #[test]
    fn custom_body_carries_text_and_timestamp() {
        let req = build_request(&config(WebhookProvider::Custom, None), "ping", at()).unwrap();
        assert_eq!(req.body["text"], "ping");
        assert_eq!(req.body["timestamp"], at().timestamp());
    }

    #[test]
    fn empty_url_is_config_incomplete() {
        let mut cfg = config(WebhookProvider::Slack, None);
        cfg.url = "  ".into();
        let err = build_request(&cfg, "x", at()).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_INCOMPLETE");
    }

    #[test]
    fn signatures_are_deterministic_and_secret_sensitive() {
        let a = dingtalk_sign("alpha", 1700000000000).unwrap();
        let b = dingtalk_sign("alpha", 1700000000000).unwrap();
        let c = dingtalk_sign("beta", 1700000000000).unwrap();
        let d = dingtalk_sign("alpha", 1700000000001).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        // a base64-encoded SHA-256 MAC is 32 bytes
        assert_eq!(BASE64.decode(&a).unwrap().len(), 32);
        assert_eq!(BASE64.decode(lark_sign("alpha", 1700000000).unwrap()).unwrap().len(), 32);
    }

    #[test]
    fn hmac_matches_rfc4231_case_2() {
        // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?"
        let sig = hmac_base64(b"Jefe", b"what do ya want for nothing?").unwrap();
        let bytes = BASE64.decode(sig).unwrap();
        let expected: [u8; 32] = [
            0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08, 0x95,
            0x75, 0xc7, 0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec, 0x58, 0xb9,
            0x64, 0xec, 0x38, 0x43,
        ];
        assert_eq!(bytes, expected);
    }
}
