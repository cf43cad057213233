//! Tenant resolution
//!
//! Maps an inbound request to a tenant record:
//! 1. `X-Tenant-ID`, honoured only alongside a valid service credential
//! 2. the `Host` subdomain, `<subdomain>.<base_domain>`
//! 3. otherwise `TenantNotFound`
//!
//! Inactive and suspended tenants are refused with `TenantSuspended`.

use crate::auth::validate_api_key;
use crate::config::TenancyConfig;
use crate::db::models::Tenant;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Read access to the tenant registry
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tenant>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Tenant>>;
}

/// How a tenant was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantSource {
    ServiceHeader,
    Subdomain,
    Explicit,
}

impl TenantSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantSource::ServiceHeader => "service_header",
            TenantSource::Subdomain => "subdomain",
            TenantSource::Explicit => "explicit",
        }
    }
}

/// Extract the tenant label from a `Host` value.
///
/// Only hosts with exactly one label in front of `base_domain` qualify.
pub fn extract_subdomain(host: &str, base_domain: &str, reserved: &HashSet<String>) -> Option<String> {
    let host = host.trim().to_ascii_lowercase();
    let host = host.split(':').next().unwrap_or_default();
    let base = base_domain.trim().trim_start_matches('.').to_ascii_lowercase();

    let label = host.strip_suffix(&base)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') || reserved.contains(label) {
        return None;
    }
    Some(label.to_string())
}

/// Resolves requests to active tenants
#[derive(Clone)]
pub struct TenantResolver {
    store: Arc<dyn TenantStore>,
    base_domain: String,
    reserved: HashSet<String>,
    tenant_header: String,
    service_key_header: String,
    service_key_hashes: Arc<Vec<String>>,
}

impl TenantResolver {
    pub fn new(store: Arc<dyn TenantStore>, config: &TenancyConfig) -> Self {
        Self {
            store,
            base_domain: config.base_domain.clone(),
            reserved: config
                .reserved_subdomains
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            tenant_header: config.tenant_header.clone(),
            service_key_header: config.service_key_header.clone(),
            service_key_hashes: Arc::new(config.service_key_hashes.clone()),
        }
    }

    /// Resolve the tenant for an HTTP request
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Tenant> {
        let tenant_header = header_str(headers, &self.tenant_header);

        if let Some(service_key) = header_str(headers, &self.service_key_header) {
            if !self.is_service_caller(service_key) {
                return Err(AppError::unauthenticated("invalid service credential"));
            }
            if let Some(raw_id) = tenant_header {
                let id = Uuid::parse_str(raw_id.trim()).map_err(|_| {
                    metrics::record_tenant_resolution(TenantSource::ServiceHeader.as_str(), "not_found");
                    AppError::TenantNotFound
                })?;
                return self.load(id, TenantSource::ServiceHeader).await;
            }
        } else if tenant_header.is_some() {
            warn!(
                header = %self.tenant_header,
                "Ignoring tenant override from a caller without a service credential"
            );
        }

        let subdomain = header_str(headers, header::HOST.as_str())
            .and_then(|host| extract_subdomain(host, &self.base_domain, &self.reserved));

        let Some(subdomain) = subdomain else {
            metrics::record_tenant_resolution(TenantSource::Subdomain.as_str(), "not_found");
            return Err(AppError::TenantNotFound);
        };

        let tenant = self.store.find_by_subdomain(&subdomain).await?;
        self.admit(tenant, TenantSource::Subdomain)
    }

    /// Resolve an active tenant by id (realtime handshake)
    pub async fn resolve_by_id(&self, id: Uuid) -> Result<Tenant> {
        self.load(id, TenantSource::Explicit).await
    }

    /// Look a tenant up by id regardless of status.
    ///
    /// Only for routes that have already required the system-admin group.
    pub async fn resolve_explicit(&self, id: Uuid) -> Result<Tenant> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(AppError::TenantNotFound)
    }

    async fn load(&self, id: Uuid, source: TenantSource) -> Result<Tenant> {
        let tenant = self.store.find_by_id(id).await?;
        self.admit(tenant, source)
    }

    fn admit(&self, tenant: Option<Tenant>, source: TenantSource) -> Result<Tenant> {
        match tenant {
            None => {
                metrics::record_tenant_resolution(source.as_str(), "not_found");
                Err(AppError::TenantNotFound)
            }
            Some(tenant) if !tenant.is_active() => {
                metrics::record_tenant_resolution(source.as_str(), "suspended");
                Err(AppError::TenantSuspended { tenant_id: tenant.id })
            }
            Some(tenant) => {
                metrics::record_tenant_resolution(source.as_str(), "resolved");
                debug!(tenant_id = %tenant.id, source = source.as_str(), "Tenant resolved");
                Ok(tenant)
            }
        }
    }

    fn is_service_caller(&self, key: &str) -> bool {
        self.service_key_hashes
            .iter()
            .any(|hash| validate_api_key(key, hash))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
}
