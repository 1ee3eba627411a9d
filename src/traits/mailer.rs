//! Mailer trait for lifecycle notices
//!
//! The lifecycle engine only needs to hand a rendered notice to something that
//! delivers it. SMTP, a transactional email API or the console mailer all fit.

use crate::subscription::error::{Result, SubscriptionError};
use async_trait::async_trait;

/// A rendered notice ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    /// Recipient address
    pub to: String,
    /// Subject line
    pub subject: String,
    /// Plain text body
    pub body: String,
}

impl Email {
    /// Create a new email
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Validate the email has the fields a backend needs
    pub fn validate(&self) -> Result<()> {
        let missing = if self.to.trim().is_empty() {
            Some("recipient")
        } else if !self.to.contains('@') {
            Some("valid recipient address")
        } else if self.subject.trim().is_empty() {
            Some("subject")
        } else if self.body.is_empty() {
            Some("body")
        } else {
            None
        };

        match missing {
            Some(field) => Err(SubscriptionError::Delivery {
                message: format!("email is missing a {}", field),
            }),
            None => Ok(()),
        }
    }
}

/// Delivery backend for lifecycle notices
///
/// # Example
///
/// ```rust,ignore
/// use subscription_gate::traits::mailer::{Email, Mailer};
/// use subscription_gate::subscription::Result;
/// use async_trait::async_trait;
///
/// struct MyMailer;
///
/// #[async_trait]
/// impl Mailer for MyMailer {
///     async fn send(&self, email: &Email) -> Result<()> {
///         // Hand off to your provider
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver an email
    ///
    /// Failures are reported as [`SubscriptionError::Delivery`].
    async fn send(&self, email: &Email) -> Result<()>;

    /// Check if the backend is reachable
    fn is_healthy(&self) -> bool {
        true
    }
}

#[async_trait]
impl<M: Mailer + ?Sized> Mailer for std::sync::Arc<M> {
    async fn send(&self, email: &Email) -> Result<()> {
        (**self).send(email).await
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Mailer that keeps every email it is asked to send.
    #[derive(Debug, Default, Clone)]
    pub struct RecordingMailer {
        sent: Arc<Mutex<Vec<Email>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl RecordingMailer {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every following send fail.
        pub fn fail_sends(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        /// Everything sent so far.
        pub fn sent(&self) -> Vec<Email> {
            self.sent.lock().unwrap().clone()
        }

        /// Sent emails whose subject contains `needle`.
        pub fn sent_matching(&self, needle: &str) -> Vec<Email> {
            self.sent()
                .into_iter()
                .filter(|e| e.subject.contains(needle))
                .collect()
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, email: &Email) -> Result<()> {
            email.validate()?;
            if *self.fail.lock().unwrap() {
                return Err(SubscriptionError::Delivery {
                    message: "mailer unavailable".to_string(),
                });
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }
}
