use reqwest::Client;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Crit,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Crit => "CRIT",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Best-effort webhook notifier. Delivery is fire-and-forget on a spawned
/// task so a slow or dead webhook can never hold up trade execution.
#[derive(Clone)]
pub struct Notifier {
    http: Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            http: Client::new(),
            webhook_url,
        }
    }

    pub fn notify(&self, severity: Severity, template: &str, fields: &[(&str, String)]) {
        let rendered: Vec<String> = fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
        debug!(severity = %severity, template, fields = %rendered.join(" "), "notification");

        let Some(url) = self.webhook_url.clone() else {
            return;
        };

        let payload = json!({
            "severity": severity.as_str(),
            "template": template,
            "fields": fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<std::collections::HashMap<_, _>>(),
        });
        let http = self.http.clone();
        let template = template.to_string();

        tokio::spawn(async move {
            let result = http
                .post(&url)
                .timeout(Duration::from_secs(5))
                .json(&payload)
                .send()
                .await;
            if let Err(e) = result {
                warn!(template = %template, error = %e, "notification delivery failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_without_webhook_is_a_no_op() {
        let notifier = Notifier::new(None);
        notifier.notify(
            Severity::Warn,
            "risk_gate_blocked",
            &[("reason", "daily loss".to_string())],
        );
    }
}
