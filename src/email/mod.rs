//! Notice delivery backends
//!
//! - `ConsoleMailer` - prints notices to stdout (for development)
//!
//! Production deployments implement [`Mailer`](crate::traits::mailer::Mailer)
//! for their provider.

mod console;

pub use console::ConsoleMailer;

pub use crate::traits::mailer::Email;
