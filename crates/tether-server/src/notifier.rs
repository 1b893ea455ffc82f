//! Email notifications through an HTTP mail relay.

use crate::config::NotificationsConfig;
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{LogNotifier, NotificationBody, Notifier, NotifyError};
use tracing::{debug, info};

/// Request body accepted by the relay.
#[derive(Debug, Serialize)]
struct MailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: String,
    html: String,
}

/// Posts each notification as a JSON mail request to a relay endpoint.
pub struct MailRelayNotifier {
    client: reqwest::Client,
    relay_url: String,
    from: String,
    app_url: String,
    timeout: Duration,
}

impl MailRelayNotifier {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        relay_url: impl Into<String>,
        from: impl Into<String>,
        app_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            relay_url: relay_url.into(),
            from: from.into(),
            app_url: app_url.into(),
            timeout,
        })
    }

    fn render_text(&self, body: &NotificationBody) -> String {
        format!(
            "{} sent you a message: {}\n\nOpen Tether to reply: {}",
            body.sender_name, body.message, self.app_url
        )
    }

    fn render_html(&self, body: &NotificationBody) -> String {
        format!(
            concat!(
                "<div style=\"font-family: Arial, sans-serif; padding: 20px;\">",
                "<h2>New message from {sender}</h2>",
                "<p>You have received a new message on <strong>Tether</strong>:</p>",
                "<blockquote style=\"border-left: 4px solid #4e73df; padding-left: 15px;\">{message}</blockquote>",
                "<p><a href=\"{url}\">Open chat</a></p>",
                "<p style=\"font-size: 12px; color: #aaa;\">&copy; {year} Tether</p>",
                "</div>"
            ),
            sender = escape_html(&body.sender_name),
            message = escape_html(&body.message),
            url = escape_html(&self.app_url),
            year = Utc::now().year(),
        )
    }
}

#[async_trait]
impl Notifier for MailRelayNotifier {
    async fn send(
        &self,
        address: &str,
        subject: &str,
        body: &NotificationBody,
    ) -> Result<(), NotifyError> {
        let request = MailRequest {
            from: &self.from,
            to: address,
            subject,
            text: self.render_text(body),
            html: self.render_html(body),
        };

        let response = self
            .client
            .post(&self.relay_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotifyError::Timeout(self.timeout)
                } else {
                    NotifyError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(format!("relay returned {}", status)));
        }

        debug!(to = %address, status = %status, "Mail relay accepted notification");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mail_relay"
    }
}

/// Pick the notifier for the configuration.
///
/// # Errors
///
/// Returns an error if the relay client cannot be built.
pub fn from_config(config: &NotificationsConfig) -> Result<Arc<dyn Notifier>, reqwest::Error> {
    match &config.relay_url {
        Some(url) => {
            info!(relay = %url, "Sending notifications through mail relay");
            Ok(Arc::new(MailRelayNotifier::new(
                url.clone(),
                config.from.clone(),
                config.app_url.clone(),
                Duration::from_millis(config.timeout_ms),
            )?))
        }
        None => {
            info!("No mail relay configured; notifications are logged only");
            Ok(Arc::new(LogNotifier))
        }
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier() -> MailRelayNotifier {
        MailRelayNotifier::new(
            "http://127.0.0.1:9/send",
            "Tether <no-reply@tether.local>",
            "https://tether.example/",
            Duration::from_millis(200),
        )
        .unwrap()
    }

    fn body() -> NotificationBody {
        NotificationBody {
            sender_name: "Alice <script>".into(),
            message: "see you at 5 & bring snacks".into(),
        }
    }

    #[test]
    fn test_html_body_is_escaped() {
        let html = notifier().render_html(&body());
        assert!(html.contains("Alice &lt;script&gt;"));
        assert!(html.contains("5 &amp; bring snacks"));
        assert!(html.contains("https://tether.example/"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_text_body() {
        let text = notifier().render_text(&body());
        assert!(text.starts_with("Alice <script> sent you a message: see you at 5"));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a<b>\"c\"&'d'"), "a&lt;b&gt;&quot;c&quot;&amp;&#39;d&#39;");
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_a_transport_error() {
        let result = notifier()
            .send("bob@example.com", "New Message on Tether", &body())
            .await;
        assert!(matches!(
            result,
            Err(NotifyError::Transport(_)) | Err(NotifyError::Timeout(_))
        ));
    }

    #[test]
    fn test_log_notifier_without_relay() {
        let notifier = from_config(&NotificationsConfig::default()).unwrap();
        assert_eq!(notifier.name(), "log");

        let config = NotificationsConfig {
            relay_url: Some("http://mail.internal/send".into()),
            ..NotificationsConfig::default()
        };
        assert_eq!(from_config(&config).unwrap().name(), "mail_relay");
    }
}
