//! Console mailer for development
//!
//! Prints lifecycle notices to stdout instead of sending them.
//!
//! # Security Warning
//!
//! Output may be captured by logging systems in containerized environments.
//! **Do not use in production.**

use crate::subscription::error::Result;
use crate::traits::mailer::{Email, Mailer};
use async_trait::async_trait;

/// A mailer that prints notices to stdout
///
/// By default the recipient and body are redacted. Use `with_full_output(true)`
/// to see full content in development.
///
/// # Example
///
/// ```rust,ignore
/// use subscription_gate::email::ConsoleMailer;
///
/// let mailer = ConsoleMailer::new();
/// let notices = NotificationScheduler::new(mailer, NotificationConfig::default());
/// ```
#[derive(Debug, Clone)]
pub struct ConsoleMailer {
    prefix: String,
    show_full_content: bool,
}

impl ConsoleMailer {
    pub fn new() -> Self {
        Self::with_prefix("[NOTICE]")
    }

    /// Create a console mailer with a custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            show_full_content: false,
        }
    }

    /// Enable or disable full output
    ///
    /// Default: `false` (recipient and body are redacted)
    pub fn with_full_output(mut self, enabled: bool) -> Self {
        if enabled {
            tracing::warn!(
                "ConsoleMailer: full output enabled - recipients and notice bodies will be visible in logs. \
                 Do not use in production!"
            );
        }
        self.show_full_content = enabled;
        self
    }

    fn render(&self, email: &Email) -> Vec<String> {
        let mut lines = vec![format!("{} ════════════════════════════════════════", self.prefix)];

        if self.show_full_content {
            lines.push(format!("{} To:      {}", self.prefix, email.to));
        } else {
            lines.push(format!("{} To:      [REDACTED]", self.prefix));
        }
        lines.push(format!("{} Subject: {}", self.prefix, email.subject));
        lines.push(format!("{} ────────────────────────────────────────", self.prefix));

        if self.show_full_content {
            lines.extend(email.body.lines().map(|line| format!("{} {}", self.prefix, line)));
        } else {
            lines.push(format!("{} {} bytes [REDACTED]", self.prefix, email.body.len()));
        }

        lines.push(format!("{} ════════════════════════════════════════", self.prefix));
        lines
    }
}

impl Default for ConsoleMailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mailer for ConsoleMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        email.validate()?;
        for line in self.render(email) {
            println!("{}", line);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice() -> Email {
        Email::new("owner@example.com", "Your trial has ended", "Secret body text")
    }

    #[tokio::test]
    async fn test_console_mailer_sends_without_error() {
        assert!(ConsoleMailer::new().send(&notice()).await.is_ok());
    }

    #[tokio::test]
    async fn test_console_mailer_validates_email() {
        let email = Email::new("owner@example.com", "Subject", "");
        assert!(ConsoleMailer::new().send(&email).await.is_err());
    }

    #[test]
    fn test_redacted_by_default() {
        let output = ConsoleMailer::new().render(&notice()).join("\n");
        assert!(output.contains("Your trial has ended"));
        assert!(!output.contains("owner@example.com"));
        assert!(!output.contains("Secret body text"));

        let output = ConsoleMailer::new().with_full_output(true).render(&notice()).join("\n");
        assert!(output.contains("owner@example.com"));
        assert!(output.contains("Secret body text"));
    }
}
