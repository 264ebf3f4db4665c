//! Email channel: renders the step template and sends it over SMTP (async lettre).

use std::sync::Arc;

use async_trait::async_trait;
use leadpulse_core::config::EmailChannelConfig;
use leadpulse_core::{
    ChannelDispatcher, DispatchError, DispatchReceipt, DispatchRequest, LeadPulseError, MessageRenderer,
    RenderedMessage, Result,
};
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

pub struct EmailDispatcher {
    from: Mailbox,
    renderer: Arc<dyn MessageRenderer>,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailDispatcher {
    pub fn new(config: &EmailChannelConfig, renderer: Arc<dyn MessageRenderer>) -> Result<Self> {
        let from_name = config.display_name.as_deref().unwrap_or("LeadPulse");
        let from: Mailbox = format!("{from_name} <{}>", config.from_address)
            .parse()
            .map_err(|e| LeadPulseError::Config(format!("invalid email from address: {e}")))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| LeadPulseError::Config(format!("SMTP relay: {e}")))?
            .port(config.smtp_port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            from,
            renderer,
            mailer: builder.build(),
        })
    }

    fn build_message(&self, request: &DispatchRequest, rendered: RenderedMessage) -> std::result::Result<(Message, String), DispatchError> {
        let to: Mailbox = rendered
            .recipient
            .parse()
            .map_err(|e| DispatchError::Permanent(format!("invalid recipient '{}': {e}", rendered.recipient)))?;
        let domain = self.from.email.domain().to_string();
        let message_id = format!("<{}@{domain}>", request.idempotency_token);
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(rendered.subject.unwrap_or_else(|| request.template_ref.clone()))
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_PLAIN)
            .body(rendered.body)
            .map_err(|e| DispatchError::Permanent(format!("build email: {e}")))?;
        Ok((message, message_id))
    }
}

#[async_trait]
impl ChannelDispatcher for EmailDispatcher {
    fn name(&self) -> &str {
        "email"
    }

    async fn dispatch(&self, request: &DispatchRequest) -> std::result::Result<DispatchReceipt, DispatchError> {
        let rendered = self.renderer.render(request).await?;
        let recipient = rendered.recipient.clone();
        let (message, message_id) = self.build_message(request, rendered)?;

        self.mailer.send(message).await.map_err(|e| {
            if e.is_permanent() {
                DispatchError::Permanent(format!("SMTP rejected: {e}"))
            } else {
                DispatchError::Retryable(format!("SMTP send: {e}"))
            }
        })?;

        tracing::info!("📤 Email sent to: {recipient}");
        Ok(DispatchReceipt {
            provider_message_id: Some(message_id),
        })
    }
}
