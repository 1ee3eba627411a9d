//! Trait definitions for the collaborators the lifecycle engine consumes
//!
//! Swap implementations for caller identity, notice delivery and short-lived
//! key-value storage without touching the engine.

pub mod auth;
pub mod expiring;
pub mod mailer;
