//! Subscription-specific error types.
//!
//! Every operation in the lifecycle engine reports failures through
//! [`SubscriptionError`]. The variants follow the engine's taxonomy
//! (validation, not found, processor, concurrency, permission) so callers can
//! decide whether to retry, surface a message, or record the failure and move on.

use std::fmt;

use super::record::SubscriptionStatus;

/// Whether a processor failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorFailure {
    /// Network trouble, timeouts, rate limiting or 5xx responses.
    Transient,
    /// The request itself is wrong (unknown or deleted subscription, other 4xx).
    Permanent,
}

/// Subscription lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    // Validation errors
    /// The tenant ID is malformed.
    InvalidTenantId { id: String, reason: String },
    /// The bulk action kind is not recognised.
    InvalidBulkAction { kind: String },
    /// The operation is not valid for the record's current status.
    InvalidTransition {
        tenant_id: String,
        status: SubscriptionStatus,
        operation: String,
    },
    /// A request argument is out of range.
    InvalidArgument { message: String },
    /// A record already exists where a new one was requested.
    AlreadyExists { tenant_id: String },
    /// The record has no processor subscription to act on.
    NoProcessorSubscription { tenant_id: String },
    /// A processor webhook failed signature verification or could not be parsed.
    InvalidWebhook { message: String },

    // Lookup errors
    /// No subscription record exists for the tenant.
    NoSubscription { tenant_id: String },

    // Processor errors
    /// The payment processor rejected or failed the call.
    Processor {
        operation: String,
        message: String,
        kind: ProcessorFailure,
        http_status: Option<u16>,
    },
    /// No payment processor is configured.
    ProcessorNotConfigured { operation: String },

    // Concurrency errors
    /// A conditional write lost the race twice in a row.
    ConcurrencyConflict { tenant_id: String },

    // Permission errors
    /// The caller may not perform this action.
    PermissionDenied { action: String },

    // Collaborator errors
    /// The subscription store failed.
    Storage { message: String },
    /// A notification could not be delivered.
    Delivery { message: String },
}

/// Result alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, SubscriptionError>;

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTenantId { id, reason } => {
                write!(f, "Invalid tenant ID '{}': {}", id, reason)
            }
            Self::InvalidBulkAction { kind } => {
                write!(f, "Unknown bulk action '{}'", kind)
            }
            Self::InvalidTransition { tenant_id, status, operation } => {
                write!(
                    f,
                    "Cannot {} for '{}' while subscription is {}",
                    operation, tenant_id, status
                )
            }
            Self::InvalidArgument { message } => {
                write!(f, "Invalid argument: {}", message)
            }
            Self::AlreadyExists { tenant_id } => {
                write!(f, "A subscription already exists for '{}'", tenant_id)
            }
            Self::NoProcessorSubscription { tenant_id } => {
                write!(f, "No processor subscription linked to '{}'", tenant_id)
            }
            Self::InvalidWebhook { message } => {
                write!(f, "Invalid webhook: {}", message)
            }
            Self::NoSubscription { tenant_id } => {
                write!(f, "No subscription found for '{}'", tenant_id)
            }
            Self::Processor { operation, message, kind, http_status } => {
                write!(f, "Payment processor error during '{}': {}", operation, message)?;
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                if *kind == ProcessorFailure::Transient {
                    write!(f, " (transient)")?;
                }
                Ok(())
            }
            Self::ProcessorNotConfigured { operation } => {
                write!(f, "No payment processor configured for '{}'", operation)
            }
            Self::ConcurrencyConflict { tenant_id } => {
                write!(f, "Concurrent modification detected for '{}', please retry", tenant_id)
            }
            Self::PermissionDenied { action } => {
                write!(f, "Not permitted to {}", action)
            }
            Self::Storage { message } => {
                write!(f, "Subscription storage error: {}", message)
            }
            Self::Delivery { message } => {
                write!(f, "Notification delivery failed: {}", message)
            }
        }
    }
}

impl std::error::Error for SubscriptionError {}

impl SubscriptionError {
    /// Build a processor error from an HTTP status, classifying it for retry.
    ///
    /// 408, 429 and 5xx are transient; everything else is permanent.
    #[must_use]
    pub fn from_http_status(operation: &str, http_status: u16, message: impl Into<String>) -> Self {
        let kind = if http_status == 408 || http_status == 429 || (500..600).contains(&http_status) {
            ProcessorFailure::Transient
        } else {
            ProcessorFailure::Permanent
        };
        Self::Processor {
            operation: operation.to_string(),
            message: message.into(),
            kind,
            http_status: Some(http_status),
        }
    }

    /// A transient processor failure without an HTTP status (connection reset, timeout).
    #[must_use]
    pub fn transient(operation: &str, message: impl Into<String>) -> Self {
        Self::Processor {
            operation: operation.to_string(),
            message: message.into(),
            kind: ProcessorFailure::Transient,
            http_status: None,
        }
    }

    /// A permanent processor failure without an HTTP status.
    #[must_use]
    pub fn permanent(operation: &str, message: impl Into<String>) -> Self {
        Self::Processor {
            operation: operation.to_string(),
            message: message.into(),
            kind: ProcessorFailure::Permanent,
            http_status: None,
        }
    }

    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Processor { kind: ProcessorFailure::Transient, .. }
        )
    }

    /// Check if this error came from the payment processor.
    #[must_use]
    pub fn is_processor_error(&self) -> bool {
        matches!(self, Self::Processor { .. } | Self::ProcessorNotConfigured { .. })
    }

    /// Check if the caller is at fault.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTenantId { .. }
                | Self::InvalidBulkAction { .. }
                | Self::InvalidTransition { .. }
                | Self::InvalidArgument { .. }
                | Self::AlreadyExists { .. }
                | Self::NoProcessorSubscription { .. }
                | Self::InvalidWebhook { .. }
                | Self::NoSubscription { .. }
                | Self::PermissionDenied { .. }
        )
    }

    /// Message safe to show an operator or tenant.
    ///
    /// Processor and storage details stay in the logs.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Processor { .. } => {
                "The payment processor could not complete the request. Please try again later."
                    .to_string()
            }
            Self::ProcessorNotConfigured { .. } => {
                "Payments are not configured. Please contact support.".to_string()
            }
            Self::ConcurrencyConflict { .. } => {
                "The subscription was changed by someone else. Please retry.".to_string()
            }
            Self::Storage { .. } | Self::Delivery { .. } => {
                "An internal error occurred. Please try again later.".to_string()
            }
            other => other.to_string(),
        }
    }
}
