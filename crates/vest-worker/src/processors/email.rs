//! Email dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use validator::Validate;
use vest_models::{EmailPayload, QueueName};

use crate::error::WorkerResult;
use crate::processor::{JobContext, JobProcessor};
use crate::services::mail::{parse_mailbox, render_str, EmailTransport, OutgoingEmail, TemplateRegistry};

/// Renders a registered template and hands it to the transport.
pub struct EmailProcessor {
    transport: Arc<dyn EmailTransport>,
    templates: Arc<TemplateRegistry>,
}

impl EmailProcessor {
    pub fn new(transport: Arc<dyn EmailTransport>, templates: Arc<TemplateRegistry>) -> Self {
        Self {
            transport,
            templates,
        }
    }

    fn prepare(&self, payload: &EmailPayload) -> WorkerResult<OutgoingEmail> {
        payload.validate()?;
        for address in &payload.to {
            parse_mailbox(address)?;
        }

        Ok(OutgoingEmail {
            to: payload.to.clone(),
            subject: render_str(&payload.subject, &payload.context)?,
            body: self.templates.render(&payload.template, &payload.context)?,
        })
    }
}

#[async_trait]
impl JobProcessor for EmailProcessor {
    fn queue(&self) -> QueueName {
        QueueName::Email
    }

    async fn process(&self, ctx: &JobContext) -> WorkerResult<serde_json::Value> {
        let payload: EmailPayload = ctx.payload_as()?;
        let email = self.prepare(&payload)?;

        ctx.logger.log_progress(&format!(
            "sending '{}' to {} recipient(s) via {}",
            payload.template,
            email.to.len(),
            self.transport.name()
        ));
        let message_id = self.transport.send(&email).await?;

        Ok(json!({
            "messageId": message_id,
            "recipients": email.to.len(),
        }))
    }
}
