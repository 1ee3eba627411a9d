//! HTTP surface for the subscription engine.
//!
//! [`routes`] exposes access checks, tenant self-service (cancel, checkout,
//! portal) and the operator endpoints. [`require_access`] guards page loads of
//! other routers with redirect semantics.

pub mod middleware;
pub mod routes;

pub use middleware::{AccessGuard, OWNER_TENANT_PARAM, require_access, track_impersonation};
pub use routes::routes;
