//! Email delivery collaborator.
//!
//! The provider is reached over HTTP (`EMAIL_CONNECTION_STRING` names the
//! endpoint). An unconfigured service refuses sends with `NotConfigured`;
//! the pipeline records the refusal on the delivery receipt instead of
//! failing the run.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use courier_domain::config::Config;

#[derive(thiserror::Error, Debug)]
pub enum EmailError {
    #[error("email service not configured")]
    NotConfigured,

    #[error("email transport: {0}")]
    Transport(String),
}

#[derive(Clone, Debug, Serialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Send one message, returning the provider message id.
    async fn send(&self, message: &EmailMessage) -> Result<String, EmailError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP provider client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpEmailSender {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpEmailSender {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<String, EmailError> {
        let address = |list: &[String]| -> Vec<serde_json::Value> {
            list.iter()
                .map(|a| serde_json::json!({ "address": a }))
                .collect()
        };
        let mut recipients = serde_json::json!({ "to": address(&message.to) });
        if !message.cc.is_empty() {
            recipients["cc"] = serde_json::Value::Array(address(&message.cc));
        }
        if !message.bcc.is_empty() {
            recipients["bcc"] = serde_json::Value::Array(address(&message.bcc));
        }
        let payload = serde_json::json!({
            "senderAddress": message.from,
            "recipients": recipients,
            "content": {
                "subject": message.subject,
                "plainText": message.text,
                "html": message.html,
            },
        });

        let response = self
            .client
            .post(format!("{}/emails:send", self.endpoint.trim_end_matches('/')))
            .json(&payload)
            .send()
            .await
            .map_err(|e| EmailError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Transport(format!(
                "provider returned {status}: {body}"
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({}));
        Ok(body
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EmailService
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EmailService {
    sender: Option<Arc<dyn EmailSender>>,
    from_address: String,
}

impl EmailService {
    pub fn from_config(config: &Config) -> Self {
        let sender: Option<Arc<dyn EmailSender>> = if config.email_connection_string.is_empty() {
            tracing::warn!("EMAIL_CONNECTION_STRING not configured, email sending disabled");
            None
        } else {
            Some(Arc::new(HttpEmailSender::new(
                config.email_connection_string.clone(),
            )))
        };
        Self {
            sender,
            from_address: config.email_from_address.clone(),
        }
    }

    pub fn with_sender(sender: Arc<dyn EmailSender>, from_address: impl Into<String>) -> Self {
        Self {
            sender: Some(sender),
            from_address: from_address.into(),
        }
    }

    pub fn disabled(from_address: impl Into<String>) -> Self {
        Self {
            sender: None,
            from_address: from_address.into(),
        }
    }

    /// Send a report delivery mail with the artifact link. Returns the
    /// provider message id.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_report_email(
        &self,
        to: Vec<String>,
        cc: Vec<String>,
        bcc: Vec<String>,
        subject: &str,
        report_name: &str,
        artifact_url: &str,
        execution_time: &str,
    ) -> Result<String, EmailError> {
        let sender = self.sender.as_ref().ok_or(EmailError::NotConfigured)?;
        let message = EmailMessage {
            from: self.from_address.clone(),
            to: to.clone(),
            cc,
            bcc,
            subject: subject.to_string(),
            html: build_report_html(report_name, execution_time, artifact_url),
            text: build_report_text(report_name, execution_time, artifact_url),
        };
        match sender.send(&message).await {
            Ok(message_id) => {
                tracing::info!(
                    message_id = %message_id,
                    recipients = to.len(),
                    subject,
                    "email sent"
                );
                Ok(message_id)
            }
            Err(e) => {
                tracing::error!(error = %e, subject, "failed to send email");
                Err(e)
            }
        }
    }
}

fn build_report_html(report_name: &str, execution_time: &str, artifact_url: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"></head>
<body style="font-family: Arial, sans-serif; margin: 24px; color: #222;">
  <h2 style="color: #1976D2;">Your report is ready</h2>
  <p><strong>{report_name}</strong> was generated at {execution_time}.</p>
  <p>
    <a href="{artifact_url}"
       style="background: #1976D2; color: #fff; padding: 10px 18px; text-decoration: none; border-radius: 4px;">
      Download report
    </a>
  </p>
  <p style="color: #666; font-size: 12px;">
    The download link expires; request a fresh one from the dashboard if needed.<br>
    This message was sent automatically by Courier.
  </p>
</body>
</html>"#
    )
}

fn build_report_text(report_name: &str, execution_time: &str, artifact_url: &str) -> String {
    format!(
        "Your report is ready.\n\n\
         Report: {report_name}\n\
         Generated: {execution_time}\n\
         Download: {artifact_url}\n\n\
         The download link expires; request a fresh one from the dashboard if needed.\n\
         This message was sent automatically by Courier.\n"
    )
}
