//! In-memory registry
//!
//! Same contract as [`super::Repository`], held in process. Used by tests and
//! local development without PostgreSQL.

use crate::auth::UserDirectory;
use crate::db::models::{Tenant, TenantStatus, User};
use crate::errors::{AppError, Result};
use crate::rbac::{Permission, RoleGrant, RoleStore};
use crate::tenancy::TenantStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

#[derive(Default)]
struct RegistryState {
    tenants: HashMap<Uuid, Tenant>,
    users: HashMap<Uuid, User>,
    roles: HashMap<Uuid, RoleGrant>,
    assignments: Vec<(Uuid, Uuid, Uuid)>,
    fail_role_lookups: bool,
}

/// Registry tables held in memory
#[derive(Default)]
pub struct MemoryRegistry {
    state: RwLock<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&RegistryState) -> T) -> T {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut RegistryState) -> T) -> T {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn add_tenant(&self, name: &str, subdomain: &str, schema: &str, status: TenantStatus) -> Tenant {
        let now = chrono::Utc::now().into();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: name.to_string(),
            subdomain: subdomain.to_string(),
            schema_name: schema.to_string(),
            status: status.into(),
            created_at: now,
            updated_at: now,
        };
        self.write(|s| s.tenants.insert(tenant.id, tenant.clone()));
        tenant
    }

    pub fn set_tenant_status(&self, tenant_id: Uuid, status: TenantStatus) {
        self.write(|s| {
            if let Some(tenant) = s.tenants.get_mut(&tenant_id) {
                tenant.status = status.into();
                tenant.updated_at = chrono::Utc::now().into();
            }
        });
    }

    pub fn add_user(&self, tenant_id: Uuid, subject: &str, email: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            tenant_id,
            external_subject: subject.to_string(),
            email: email.to_string(),
            created_at: chrono::Utc::now().into(),
        };
        self.write(|s| s.users.insert(user.id, user.clone()));
        user
    }

    /// Define a role with `(resource, action)` permissions
    pub fn add_role(&self, name: &str, permissions: &[(&str, &str)]) -> Uuid {
        let id = Uuid::new_v4();
        let grant = RoleGrant {
            role: name.to_string(),
            permissions: permissions
                .iter()
                .map(|(resource, action)| Permission::new(*resource, *action))
                .collect(),
        };
        self.write(|s| s.roles.insert(id, grant));
        id
    }

    pub fn assign_role(&self, user_id: Uuid, role_id: Uuid, tenant_id: Uuid) {
        self.write(|s| s.assignments.push((user_id, role_id, tenant_id)));
    }

    /// Make role lookups fail, to exercise fail-closed authorization
    pub fn set_role_lookup_failure(&self, fail: bool) {
        self.write(|s| s.fail_role_lookups = fail);
    }

    pub fn user_count(&self, tenant_id: Uuid) -> usize {
        self.read(|s| s.users.values().filter(|u| u.tenant_id == tenant_id).count())
    }
}

#[async_trait]
impl TenantStore for MemoryRegistry {
    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tenant>> {
        Ok(self.read(|s| {
            s.tenants
                .values()
                .find(|t| t.subdomain == subdomain)
                .cloned()
        }))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Tenant>> {
        Ok(self.read(|s| s.tenants.get(&id).cloned()))
    }
}

#[async_trait]
impl UserDirectory for MemoryRegistry {
    async fn find_by_subject(&self, tenant_id: Uuid, subject: &str) -> Result<Option<User>> {
        Ok(self.read(|s| {
            s.users
                .values()
                .find(|u| u.tenant_id == tenant_id && u.external_subject == subject)
                .cloned()
        }))
    }

    async fn provision(&self, tenant_id: Uuid, subject: &str, email: &str) -> Result<User> {
        if let Some(existing) = self.find_by_subject(tenant_id, subject).await? {
            return Ok(existing);
        }
        Ok(self.add_user(tenant_id, subject, email))
    }
}

#[async_trait]
impl RoleStore for MemoryRegistry {
    async fn role_grants(&self, tenant_id: Uuid, user_id: Uuid) -> Result<Vec<RoleGrant>> {
        self.read(|s| {
            if s.fail_role_lookups {
                return Err(AppError::DatabaseUnavailable {
                    message: "role lookup failed".to_string(),
                });
            }
            Ok(s.assignments
                .iter()
                .filter(|(user, _, tenant)| *user == user_id && *tenant == tenant_id)
                .filter_map(|(_, role, _)| s.roles.get(role).cloned())
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_role_assignments_are_scoped_per_tenant() {
        let registry = MemoryRegistry::new();
        let a = registry.add_tenant("A", "a", "tenant_a", TenantStatus::Active);
        let b = registry.add_tenant("B", "b", "tenant_b", TenantStatus::Active);
        let user = registry.add_user(a.id, "sub-1", "nurse@a.test");
        let nurse = registry.add_role("nurse", &[("beds", "read")]);
        registry.assign_role(user.id, nurse, a.id);

        assert_eq!(registry.role_grants(a.id, user.id).await.unwrap().len(), 1);
        assert!(registry.role_grants(b.id, user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let registry = MemoryRegistry::new();
        let a = registry.add_tenant("A", "a", "tenant_a", TenantStatus::Active);

        let first = registry.provision(a.id, "sub-1", "x@a.test").await.unwrap();
        let second = registry.provision(a.id, "sub-1", "x@a.test").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(registry.user_count(a.id), 1);
    }
}
