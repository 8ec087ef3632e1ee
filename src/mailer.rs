use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{config::MailConfig, error::NotificationError};

/// Template
///
/// Notifications this service sends. The provider renders the template; this
/// crate only supplies its id and variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    UserWelcome,
}

// 1. NotificationSender Contract
/// NotificationSender
///
/// Delivers a templated notification and returns the provider's status code.
/// Implementations retry transient failures a bounded number of times.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        template: Template,
        recipient_name: &str,
        recipient_address: &str,
        vars: Value,
    ) -> Result<u16, NotificationError>;
}

/// MailerState
pub type MailerState = Arc<dyn NotificationSender>;

// 2. The Real Implementation (SendGrid)
/// SendGridMailer
///
/// Sends through the SendGrid v3 API using dynamic templates. Sandbox mode is
/// switched on outside production so local runs never deliver real mail.
#[derive(Clone)]
pub struct SendGridMailer {
    client: reqwest::Client,
    endpoint: String,
    config: MailConfig,
    sandbox: bool,
}

const SENDGRID_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

impl SendGridMailer {
    pub fn new(config: MailConfig, sandbox: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: SENDGRID_ENDPOINT.to_string(),
            config,
            sandbox,
        }
    }

    /// with_endpoint
    ///
    /// Points the mailer at a different API base, e.g. a local stub server.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn template_id(&self, template: Template) -> &str {
        match template {
            Template::UserWelcome => &self.config.welcome_template_id,
        }
    }

    /// backoff
    ///
    /// Delay before retry number `attempt` (0-based): base, 2x base, 4x base...
    pub fn backoff(base: Duration, attempt: u32) -> Duration {
        base.saturating_mul(2u32.saturating_pow(attempt))
    }

    async fn send_once(&self, payload: &Value) -> Result<u16, String> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(format!("provider responded with {}", status))
        }
    }
}

#[async_trait]
impl NotificationSender for SendGridMailer {
    async fn send(
        &self,
        template: Template,
        recipient_name: &str,
        recipient_address: &str,
        vars: Value,
    ) -> Result<u16, NotificationError> {
        let payload = json!({
            "personalizations": [{
                "to": [{ "email": recipient_address, "name": recipient_name }],
                "dynamic_template_data": vars,
            }],
            "from": { "email": self.config.from_email, "name": self.config.from_name },
            "template_id": self.template_id(template),
            "mail_settings": { "sandbox_mode": { "enable": self.sandbox } },
        });

        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.send_once(&payload).await {
                Ok(status) => return Ok(status),
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, "mail delivery attempt failed: {}", e);
                    last_error = e;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Self::backoff(self.config.retry_base_delay, attempt))
                            .await;
                    }
                }
            }
        }

        Err(NotificationError::DeliveryFailed {
            attempts,
            reason: last_error,
        })
    }
}

// 3. The Mock Implementation (For Tests)
/// SentMail
///
/// A notification captured by `MockMailer`.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub template: Template,
    pub recipient_name: String,
    pub recipient_address: String,
    pub vars: Value,
}

/// MockMailer
///
/// Records every send so tests can assert on invitations without a network.
#[derive(Clone, Default)]
pub struct MockMailer {
    /// When true, every send fails as if all retries were exhausted.
    pub should_fail: bool,
    sent: Arc<Mutex<Vec<SentMail>>>,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSender for MockMailer {
    async fn send(
        &self,
        template: Template,
        recipient_name: &str,
        recipient_address: &str,
        vars: Value,
    ) -> Result<u16, NotificationError> {
        if self.should_fail {
            return Err(NotificationError::DeliveryFailed {
                attempts: 3,
                reason: "Mock Mailer Error: Simulation requested".to_string(),
            });
        }

        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentMail {
                template,
                recipient_name: recipient_name.to_string(),
                recipient_address: recipient_address.to_string(),
                vars,
            });
        }
        Ok(202)
    }
}
