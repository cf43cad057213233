//! Repository for registry access
//!
//! Everything here reads or writes the shared `public` tables through SeaORM.
//! Tenant-local data never goes through this type; it goes through a
//! [`crate::session::TenantSession`].

use crate::auth::UserDirectory;
use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::Result;
use crate::rbac::{Permission, RoleGrant, RoleStore};
use crate::tenancy::TenantStore;
use async_trait::async_trait;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

/// Repository over the registry tables
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> &DatabaseConnection {
        self.pool.registry()
    }

    // ========================================================================
    // Tenant Operations
    // ========================================================================

    /// Find tenant by subdomain label
    pub async fn find_tenant_by_subdomain(&self, subdomain: &str) -> Result<Option<Tenant>> {
        TenantEntity::find()
            .filter(TenantColumn::Subdomain.eq(subdomain))
            .one(self.conn())
            .await
            .map_err(Into::into)
    }

    /// Find tenant by ID
    pub async fn find_tenant_by_id(&self, id: Uuid) -> Result<Option<Tenant>> {
        TenantEntity::find_by_id(id)
            .one(self.conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // User Operations
    // ========================================================================

    /// Find the user bound to an external subject within a tenant
    pub async fn find_user_by_subject(&self, tenant_id: Uuid, subject: &str) -> Result<Option<User>> {
        UserEntity::find()
            .filter(UserColumn::TenantId.eq(tenant_id))
            .filter(UserColumn::ExternalSubject.eq(subject))
            .one(self.conn())
            .await
            .map_err(Into::into)
    }

    /// Create a user record on first sight of a subject
    pub async fn create_user(&self, tenant_id: Uuid, subject: &str, email: &str) -> Result<User> {
        let user = UserActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            external_subject: Set(subject.to_string()),
            email: Set(email.to_string()),
            created_at: Set(chrono::Utc::now().into()),
        };

        match user.insert(self.conn()).await {
            Ok(user) => {
                info!(tenant_id = %tenant_id, user_id = %user.id, "Provisioned user");
                Ok(user)
            }
            Err(e) => {
                // A concurrent request may have provisioned the same subject
                match self.find_user_by_subject(tenant_id, subject).await? {
                    Some(existing) => Ok(existing),
                    None => Err(e.into()),
                }
            }
        }
    }

    // ========================================================================
    // Role Operations
    // ========================================================================

    /// Roles held by a user in a tenant, with their permissions
    pub async fn find_role_grants(&self, tenant_id: Uuid, user_id: Uuid) -> Result<Vec<RoleGrant>> {
        let role_ids: Vec<Uuid> = UserRoleEntity::find()
            .filter(UserRoleColumn::TenantId.eq(tenant_id))
            .filter(UserRoleColumn::UserId.eq(user_id))
            .all(self.conn())
            .await?
            .into_iter()
            .map(|assignment| assignment.role_id)
            .collect();

        if role_ids.is_empty() {
            return Ok(Vec::new());
        }

        let roles = RoleEntity::find()
            .filter(RoleColumn::Id.is_in(role_ids.clone()))
            .all(self.conn())
            .await?;

        let links = RolePermissionEntity::find()
            .filter(RolePermissionColumn::RoleId.is_in(role_ids))
            .all(self.conn())
            .await?;

        let permission_ids: Vec<Uuid> = links.iter().map(|link| link.permission_id).collect();
        let permissions: HashMap<Uuid, PermissionRow> = if permission_ids.is_empty() {
            HashMap::new()
        } else {
            PermissionEntity::find()
                .filter(PermissionColumn::Id.is_in(permission_ids))
                .all(self.conn())
                .await?
                .into_iter()
                .map(|permission| (permission.id, permission))
                .collect()
        };

        let mut grouped: BTreeMap<String, Vec<Permission>> = BTreeMap::new();
        for role in &roles {
            let granted = links
                .iter()
                .filter(|link| link.role_id == role.id)
                .filter_map(|link| permissions.get(&link.permission_id))
                .map(|row| Permission::new(row.resource.clone(), row.action.clone()));
            grouped.entry(role.name.clone()).or_default().extend(granted);
        }

        debug!(
            tenant_id = %tenant_id,
            user_id = %user_id,
            roles = grouped.len(),
            "Loaded role grants"
        );

        Ok(grouped
            .into_iter()
            .map(|(role, permissions)| RoleGrant { role, permissions })
            .collect())
    }
}

#[async_trait]
impl TenantStore for Repository {
    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tenant>> {
        self.find_tenant_by_subdomain(subdomain).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Tenant>> {
        self.find_tenant_by_id(id).await
    }
}

#[async_trait]
impl UserDirectory for Repository {
    async fn find_by_subject(&self, tenant_id: Uuid, subject: &str) -> Result<Option<User>> {
        self.find_user_by_subject(tenant_id, subject).await
    }

    async fn provision(&self, tenant_id: Uuid, subject: &str, email: &str) -> Result<User> {
        self.create_user(tenant_id, subject, email).await
    }
}

#[async_trait]
impl RoleStore for Repository {
    async fn role_grants(&self, tenant_id: Uuid, user_id: Uuid) -> Result<Vec<RoleGrant>> {
        self.find_role_grants(tenant_id, user_id).await
    }
}
