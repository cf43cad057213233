//! Configuration management for CareHub services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Tenant resolution configuration
    pub tenancy: TenancyConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Realtime fan-out configuration
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,

    /// Maximum number of pooled connections, shared by every tenant
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long a request waits for a pooled connection, in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Neutral search_path a connection carries while it sits in the pool
    #[serde(default = "default_search_path")]
    pub default_search_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenancyConfig {
    /// Base domain; tenants are addressed as `<subdomain>.<base_domain>`
    pub base_domain: String,

    /// Tenant override header, honoured only for service callers
    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,

    /// Header carrying the service-to-service credential
    #[serde(default = "default_service_key_header")]
    pub service_key_header: String,

    /// SHA-256 hex digests of accepted service credentials
    #[serde(default)]
    pub service_key_hashes: Vec<String>,

    /// Labels that never name a tenant
    #[serde(default = "default_reserved_subdomains")]
    pub reserved_subdomains: Vec<String>,

    /// Application-identifying header checked before anything else
    #[serde(default = "default_app_header")]
    pub app_header: String,

    /// Accepted application identifiers (empty disables the check)
    #[serde(default)]
    pub allowed_apps: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Shared HMAC secret (used when no JWKS URL is configured)
    pub jwt_secret: Option<String>,

    /// Identity provider key set URL
    pub jwks_url: Option<String>,

    /// Expected `iss` claim
    pub issuer: Option<String>,

    /// Expected `aud` claim
    pub audience: Option<String>,

    /// Claim carrying the caller's groups
    #[serde(default = "default_groups_claim")]
    pub groups_claim: String,

    /// Claim naming the tenant the token was issued for
    #[serde(default = "default_tenant_claim")]
    pub tenant_claim: String,

    /// Create local users on first successful authentication
    #[serde(default)]
    pub jit_provisioning: bool,

    /// Development-only verification bypass; ignored outside `development`
    #[serde(default)]
    pub dev_bypass: bool,

    /// Clock skew tolerance in seconds
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,

    /// Minimum interval between JWKS refreshes in seconds
    #[serde(default = "default_jwks_refresh")]
    pub jwks_refresh_secs: u64,

    /// Upper bound on a single JWKS fetch in seconds
    #[serde(default = "default_jwks_timeout")]
    pub jwks_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RealtimeConfig {
    /// Outbound buffer per socket; events beyond it are dropped
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> u64 { 5 }
fn default_idle_timeout() -> u64 { 300 }
fn default_search_path() -> String { "public".to_string() }
fn default_tenant_header() -> String { "X-Tenant-ID".to_string() }
fn default_service_key_header() -> String { "X-Service-Key".to_string() }
fn default_reserved_subdomains() -> Vec<String> { vec!["www".to_string(), "api".to_string()] }
fn default_app_header() -> String { "X-App-Id".to_string() }
fn default_groups_claim() -> String { "groups".to_string() }
fn default_tenant_claim() -> String { "tenant".to_string() }
fn default_leeway() -> u64 { 30 }
fn default_jwks_refresh() -> u64 { 300 }
fn default_jwks_timeout() -> u64 { 5 }
fn default_channel_capacity() -> usize { 64 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "carehub".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/carehub".to_string(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            default_search_path: default_search_path(),
        }
    }
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            base_domain: "carehub.localhost".to_string(),
            tenant_header: default_tenant_header(),
            service_key_header: default_service_key_header(),
            service_key_hashes: Vec::new(),
            reserved_subdomains: default_reserved_subdomains(),
            app_header: default_app_header(),
            allowed_apps: Vec::new(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwks_url: None,
            issuer: None,
            audience: None,
            groups_claim: default_groups_claim(),
            tenant_claim: default_tenant_claim(),
            jit_provisioning: false,
            dev_bypass: false,
            leeway_secs: default_leeway(),
            jwks_refresh_secs: default_jwks_refresh(),
            jwks_timeout_secs: default_jwks_timeout(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

/// Deployment environment, read once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnv {
    Development,
    Staging,
    Production,
}

impl RuntimeEnv {
    /// Read `APP_ENV`; anything unrecognised is treated as production
    pub fn from_env() -> Self {
        let value = std::env::var("APP_ENV").unwrap_or_else(|_| "production".to_string());
        Self::parse(&value)
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => RuntimeEnv::Development,
            "staging" => RuntimeEnv::Staging,
            _ => RuntimeEnv::Production,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeEnv::Development => "development",
            RuntimeEnv::Staging => "staging",
            RuntimeEnv::Production => "production",
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load(env: RuntimeEnv) -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env.as_str())).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__TENANCY__BASE_DOMAIN=carehub.io
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("tenancy.service_key_hashes")
                    .with_list_parse_key("tenancy.reserved_subdomains")
                    .with_list_parse_key("tenancy.allowed_apps"),
            )

            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

impl DatabaseConfig {
    /// Get pool acquisition timeout as Duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            tenancy: TenancyConfig::default(),
            auth: AuthConfig::default(),
            realtime: RealtimeConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
