use async_trait::async_trait;
use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};
use aws_sdk_sesv2::Client as SesClient;
use chrono::Duration;
use tokio::sync::Mutex;

/// A rendered message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), String>;
}

/// Delivers through AWS SES v2.
#[derive(Debug, Clone)]
pub struct SesMailer {
    client: SesClient,
    from_email: String,
}

impl SesMailer {
    pub fn new(client: SesClient, from_email: impl Into<String>) -> Self {
        Self {
            client,
            from_email: from_email.into(),
        }
    }
}

#[async_trait]
impl Mailer for SesMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), String> {
        let destination = Destination::builder().to_addresses(&email.to).build();

        let subject = Content::builder()
            .data(&email.subject)
            .charset("UTF-8")
            .build()
            .map_err(|e| format!("Failed to build subject: {:?}", e))?;

        let html_content = Content::builder()
            .data(&email.html_body)
            .charset("UTF-8")
            .build()
            .map_err(|e| format!("Failed to build HTML content: {:?}", e))?;

        let text_content = Content::builder()
            .data(&email.text_body)
            .charset("UTF-8")
            .build()
            .map_err(|e| format!("Failed to build text content: {:?}", e))?;

        let body = Body::builder().html(html_content).text(text_content).build();
        let message = Message::builder().subject(subject).body(body).build();
        let email_content = EmailContent::builder().simple(message).build();

        self.client
            .send_email()
            .from_email_address(&self.from_email)
            .destination(destination)
            .content(email_content)
            .send()
            .await
            .map_err(|e| format!("Failed to send email: {:?}", e))?;

        Ok(())
    }
}

/// Keeps every message instead of sending it. Handy for tests and local runs.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    fail: bool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mailer whose every delivery fails.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub async fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), String> {
        if self.fail {
            return Err(format!("delivery to {} refused", email.to));
        }
        self.sent.lock().await.push(email.clone());
        Ok(())
    }
}

pub struct InvitationEmail<'a> {
    pub to: &'a str,
    pub inviter_name: &'a str,
    pub family_name: &'a str,
    pub accept_url: &'a str,
    pub app_name: &'a str,
    pub max_age: Duration,
}

impl InvitationEmail<'_> {
    pub fn render(&self) -> OutgoingEmail {
        let days = self.max_age.num_days();
        let subject = format!(
            "You're invited to join {} on {}",
            self.family_name, self.app_name
        );

        let text_body = format!(
            "Hi,\n\n\
             {inviter} has invited you to join {family} as a teacher on {app}.\n\n\
             Click the link below to accept:\n\
             {url}\n\n\
             This invitation expires in {days} days.\n\n\
             -- {app}",
            inviter = self.inviter_name,
            family = self.family_name,
            app = self.app_name,
            url = self.accept_url,
        );

        let html_body = format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body {{
            font-family: 'HelveticaNeue', Helvetica, Arial, sans-serif;
            line-height: 1.6;
            color: #333333;
            margin: 0;
            padding: 0;
        }}
        .container {{
            max-width: 600px;
            margin: 0 auto;
            padding: 48px 40px;
            border: 1px solid #e5e5e5;
        }}
        .button {{
            display: inline-block;
            padding: 16px 24px;
            background: #2f7d4f;
            color: #ffffff;
            text-decoration: none;
        }}
        .muted {{
            font-size: 13px;
            color: #666666;
        }}
    </style>
</head>
<body>
    <div class="container">
        <h1>{app}</h1>
        <p>{inviter} has invited you to join <strong>{family}</strong> as a teacher.</p>
        <p><a href="{url}" class="button">Accept invitation</a></p>
        <p class="muted">This invitation expires in {days} days. If you didn't expect this, you can safely ignore this email.</p>
    </div>
</body>
</html>"#,
            app = self.app_name,
            inviter = self.inviter_name,
            family = self.family_name,
            url = self.accept_url,
        );

        OutgoingEmail {
            to: self.to.to_string(),
            subject,
            text_body,
            html_body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invitation_email_names_family_and_link() {
        let email = InvitationEmail {
            to: "t@x.com",
            inviter_name: "Pat Lee",
            family_name: "Lee Family",
            accept_url: "https://app.test/invites/abc/accept",
            app_name: "Homeschool Hub",
            max_age: Duration::days(7),
        }
        .render();

        assert_eq!(email.to, "t@x.com");
        assert_eq!(email.subject, "You're invited to join Lee Family on Homeschool Hub");
        assert!(email
            .text_body
            .contains("Pat Lee has invited you to join Lee Family as a teacher"));
        assert!(email.text_body.contains("https://app.test/invites/abc/accept"));
        assert!(email.text_body.contains("expires in 7 days"));
        assert!(email.html_body.contains(r#"href="https://app.test/invites/abc/accept""#));
    }

    #[tokio::test]
    async fn recording_mailer_keeps_messages() {
        let mailer = RecordingMailer::new();
        let email = OutgoingEmail {
            to: "a@x.com".into(),
            subject: "s".into(),
            text_body: "t".into(),
            html_body: "h".into(),
        };
        mailer.send(&email).await.unwrap();
        assert_eq!(mailer.sent().await, vec![email]);

        assert!(RecordingMailer::failing().send(&OutgoingEmail {
            to: "b@x.com".into(),
            subject: String::new(),
            text_body: String::new(),
            html_body: String::new(),
        })
        .await
        .is_err());
    }
}
