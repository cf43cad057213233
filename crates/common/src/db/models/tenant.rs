//! Tenant registry entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Tenant lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Inactive,
    Suspended,
}

impl From<String> for TenantStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "active" => TenantStatus::Active,
            "inactive" => TenantStatus::Inactive,
            // Unknown values never grant access
            _ => TenantStatus::Suspended,
        }
    }
}

impl From<TenantStatus> for String {
    fn from(status: TenantStatus) -> Self {
        match status {
            TenantStatus::Active => "active".to_string(),
            TenantStatus::Inactive => "inactive".to_string(),
            TenantStatus::Suspended => "suspended".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "public", table_name = "tenants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub name: String,

    #[sea_orm(column_type = "Text", unique)]
    pub subdomain: String,

    /// Provisioned once, never renamed
    #[sea_orm(column_type = "Text")]
    pub schema_name: String,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Get the tenant status as an enum
    pub fn tenant_status(&self) -> TenantStatus {
        TenantStatus::from(self.status.clone())
    }

    /// Only active tenants may serve requests
    pub fn is_active(&self) -> bool {
        self.tenant_status() == TenantStatus::Active
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::user::Entity")]
    Users,

    #[sea_orm(has_many = "super::user_role::Entity")]
    UserRoles,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Users.def()
    }
}

impl Related<super::user_role::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserRoles.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
