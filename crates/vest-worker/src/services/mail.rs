//! Outgoing email: templates and transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::error::{WorkerError, WorkerResult};

/// A rendered message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Delivers rendered email.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Send the message, returning its message id.
    async fn send(&self, email: &OutgoingEmail) -> WorkerResult<String>;
}

/// Parse an address, rejecting malformed ones as permanent failures.
pub fn parse_mailbox(address: &str) -> WorkerResult<Mailbox> {
    address
        .trim()
        .parse::<Mailbox>()
        .map_err(|e| WorkerError::InvalidAddress(format!("{}: {}", address, e)))
}

fn new_message_id(from: &Mailbox) -> String {
    format!("<{}@{}>", Uuid::new_v4(), from.email.domain())
}

/// SMTP delivery through a relay.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig, from: &str) -> WorkerResult<Self> {
        let from = parse_mailbox(from).map_err(|e| WorkerError::Config(e.to_string()))?;

        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| WorkerError::Config(format!("Failed to create SMTP transport: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        let mut builder = builder.port(config.port).timeout(Some(config.timeout));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        info!(host = %config.host, port = config.port, "SMTP transport configured");
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn classify(err: lettre::transport::smtp::Error) -> WorkerError {
        if err.is_timeout() {
            WorkerError::Timeout(err.to_string())
        } else if err.is_transient() {
            WorkerError::Deferred(err.to_string())
        } else if err.is_permanent() {
            WorkerError::Rejected(err.to_string())
        } else {
            WorkerError::Connection(err.to_string())
        }
    }
}

#[async_trait]
impl EmailTransport for SmtpMailer {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, email: &OutgoingEmail) -> WorkerResult<String> {
        let message_id = new_message_id(&self.from);

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(email.subject.as_str())
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_PLAIN);
        for to in &email.to {
            builder = builder.to(parse_mailbox(to)?);
        }
        let message = builder
            .body(email.body.clone())
            .map_err(|e| WorkerError::Validation(format!("Failed to build email: {}", e)))?;

        self.transport.send(message).await.map_err(Self::classify)?;
        debug!(message_id = %message_id, recipients = email.to.len(), "Email sent");
        Ok(message_id)
    }
}

/// Logs email instead of sending it. Used when no relay is configured.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl EmailTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, email: &OutgoingEmail) -> WorkerResult<String> {
        let message_id = format!("<{}@localhost>", Uuid::new_v4());
        info!(
            message_id = %message_id,
            to = ?email.to,
            subject = %email.subject,
            "Email delivery skipped (no SMTP relay configured)"
        );
        Ok(message_id)
    }
}

/// Records messages in memory. Can be told to fail the next few sends.
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    sent: Mutex<Vec<OutgoingEmail>>,
    failures: AtomicUsize,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends with a connection error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl EmailTransport for MemoryMailbox {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(&self, email: &OutgoingEmail) -> WorkerResult<String> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(WorkerError::Connection("mail relay unavailable".to_string()));
        }

        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(email.clone());
        Ok(format!("<{}@memory>", Uuid::new_v4()))
    }
}

/// A named email template. `{{name}}` placeholders are filled from the job
/// context; a placeholder without a value is a template error.
#[derive(Debug, Clone)]
pub struct EmailTemplate {
    pub body: String,
}

/// Registered templates by name.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, EmailTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Templates used by the platform's own jobs.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_template(
                "welcome",
                "Hello {{name}},\n\nWelcome to Vest. Your account is ready.\n",
            )
            .with_template(
                "investment-confirmation",
                "Hello {{name}},\n\nYour investment of {{amount}} in {{propertyName}} has been confirmed.\n",
            )
            .with_template(
                "roi-distribution",
                "Hello {{name}},\n\nA distribution of {{amount}} from {{propertyName}} has been credited to your account for period {{periodId}}.\n",
            )
            .with_template(
                "report-ready",
                "Hello,\n\nYour {{reportType}} report is ready: {{location}}\n",
            )
    }

    pub fn with_template(mut self, name: impl Into<String>, body: impl Into<String>) -> Self {
        self.templates.insert(
            name.into(),
            EmailTemplate {
                body: body.into(),
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Render the named template against `context`.
    pub fn render(
        &self,
        name: &str,
        context: &serde_json::Map<String, serde_json::Value>,
    ) -> WorkerResult<String> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| WorkerError::Template(format!("unknown template '{}'", name)))?;
        render_str(&template.body, context)
    }
}

/// Substitute `{{key}}` placeholders.
pub fn render_str(
    source: &str,
    context: &serde_json::Map<String, serde_json::Value>,
) -> WorkerResult<String> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| WorkerError::Template("unclosed placeholder".to_string()))?;
        let key = after[..end].trim();

        match context.get(key) {
            Some(serde_json::Value::String(s)) => out.push_str(s),
            Some(serde_json::Value::Null) | None => {
                return Err(WorkerError::Template(format!("missing variable '{}'", key)))
            }
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}
