//! # Feature: Login Reporting
//!
//! Publishes the login QR code URL to a Feishu-style webhook so the bot can be
//! logged in from somewhere other than the server console.
//!
//! - **Version**: 1.0.0
//! - **Since**: 0.1.0
//! - **Toggleable**: true (unset `REPORT_URL` to log the URL instead)
//!
//! ## Changelog
//! - 1.0.0: Webhook text notifications with token derived from the report URL

use anyhow::{anyhow, Result};
use log::{error, info};
use serde_json::{json, Value};

/// Webhook endpoint prefix; the token is whatever follows it.
pub const WEBHOOK_BASE_URL: &str = "https://open.feishu.cn/open-apis/bot/v2/hook";

/// Derive the webhook token from a configured report URL by removing the
/// webhook base and one trailing `/`.
pub fn webhook_token(report_url: &str) -> Option<String> {
    let token = report_url.replacen(&format!("{}/", WEBHOOK_BASE_URL), "", 1);
    let token = token.strip_suffix('/').unwrap_or(&token);

    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Sends text messages to one webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl WebhookNotifier {
    pub fn new(token: impl Into<String>) -> Self {
        WebhookNotifier {
            client: reqwest::Client::new(),
            base_url: WEBHOOK_BASE_URL.to_string(),
            token: token.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.token)
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        let payload = json!({
            "msg_type": "text",
            "content": { "text": text },
        });

        let response = self
            .client
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("webhook request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("webhook rejected message: {}", e))?;

        // The webhook answers 200 with a non-zero code on logical errors.
        let body: Value = response.json().await.unwrap_or(Value::Null);
        match body.get("code").and_then(Value::as_i64) {
            Some(code) if code != 0 => Err(anyhow!(
                "webhook returned code {}: {}",
                code,
                body.get("msg").and_then(Value::as_str).unwrap_or("unknown error")
            )),
            _ => Ok(()),
        }
    }
}

/// Where the login QR URL goes once the transport issues it.
#[derive(Debug, Clone, Default)]
pub struct LoginReporter {
    report_url: Option<String>,
    notifier: Option<WebhookNotifier>,
}

impl LoginReporter {
    pub fn new(report_url: Option<String>) -> Self {
        let report_url = report_url.filter(|url| !url.is_empty());
        let notifier = report_url
            .as_deref()
            .and_then(webhook_token)
            .map(WebhookNotifier::new);

        LoginReporter {
            report_url,
            notifier,
        }
    }

    pub fn with_notifier(mut self, notifier: WebhookNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Publish `qrcode_url`. Failures are logged, never returned: a missed
    /// notification must not abort the login.
    pub async fn report(&self, qrcode_url: &str) {
        let Some(report_url) = &self.report_url else {
            info!("📷 Scan the QR code to log in:");
            info!("{}", qrcode_url);
            return;
        };

        info!("📤 Reporting login QR code to webhook: {}", report_url);
        let Some(notifier) = &self.notifier else {
            error!("❌ Invalid report webhook: {}", report_url);
            return;
        };

        let text = format!("Scan the QR code to log in: {}", qrcode_url);
        if let Err(e) = notifier.send_text(&text).await {
            error!("❌ Failed to report url {}: {}", report_url, e);
        }
    }
}
