use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::Config;

/// SMTP notifier for completed scheduled reports. Delivery is best effort;
/// a send failure is logged and never fails the run that triggered it.
pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    dashboard_url: String,
}

impl Mailer {
    pub fn from_config(config: &Config) -> Option<Self> {
        let host = config.smtp_host.as_deref()?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .ok()?
            .credentials(Credentials::new(
                config.smtp_username.clone(),
                config.smtp_password.clone(),
            ))
            .build();
        Some(Self {
            transport,
            from: config.smtp_from.clone(),
            dashboard_url: config.dashboard_url.clone(),
        })
    }

    /// Notify a connection owner that a fresh scheduled report is ready.
    pub async fn send_report_ready(&self, to: &str, sheet_name: &str, report_title: &str) {
        let html = format!(
            "<div style=\"font-family: sans-serif; max-width: 600px;\">\
             <h2>Your scheduled report is ready</h2>\
             <p>A new analysis of <strong>{sheet_name}</strong> has completed:</p>\
             <p><strong>{report_title}</strong></p>\
             <p><a href=\"{}\">Open your dashboard</a> to view the results.</p>\
             </div>",
            self.dashboard_url
        );

        let message = Message::builder()
            .from(match self.from.parse() {
                Ok(mailbox) => mailbox,
                Err(e) => {
                    log::error!("invalid sender address {}: {e}", self.from);
                    return;
                }
            })
            .to(match to.parse() {
                Ok(mailbox) => mailbox,
                Err(e) => {
                    log::warn!("invalid recipient address {to}: {e}");
                    return;
                }
            })
            .subject(format!("Report ready: {report_title}"))
            .header(ContentType::TEXT_HTML)
            .body(html);

        match message {
            Ok(message) => {
                if let Err(e) = self.transport.send(message).await {
                    log::warn!("failed to send notification to {to}: {e}");
                }
            }
            Err(e) => log::warn!("failed to build notification email: {e}"),
        }
    }
}
