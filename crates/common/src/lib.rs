//! CareHub Common Library
//!
//! Shared code for the CareHub gateway including:
//! - Tenant resolution and the tenant registry
//! - Schema-bound database sessions
//! - Authentication and role-based authorization
//! - Tenant-partitioned realtime fan-out
//! - Error types, configuration and metrics

pub mod auth;
pub mod config;
pub mod context;
pub mod db;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod rbac;
pub mod session;
pub mod tenancy;

// Re-export commonly used types
pub use config::AppConfig;
pub use context::RequestContext;
pub use errors::{AppError, Result};
pub use session::{SchemaSessionManager, TenantDb, TenantSession};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
