//! Request pipeline middleware
//!
//! Layer order on tenant routes, outermost first:
//! allow-list → credential → tenant → identity and permission set →
//! session → permission check.

pub mod allowlist;
pub mod authorize;
pub mod pipeline;
pub mod request_metrics;

pub use allowlist::check_application;
pub use authorize::{require_permission, ResourcePolicy};
pub use pipeline::{system_admin, tenant_pipeline};
pub use request_metrics::track_request;
