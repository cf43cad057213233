//! SeaORM entity models
//!
//! Registry tables shared by every tenant. They live in the `public` schema and
//! are always addressed schema-qualified.

mod tenant;
mod user;
mod role;
mod permission;
mod role_permission;
mod user_role;

pub use tenant::{
    Entity as TenantEntity,
    Model as Tenant,
    ActiveModel as TenantActiveModel,
    Column as TenantColumn,
    TenantStatus,
};

pub use user::{
    Entity as UserEntity,
    Model as User,
    ActiveModel as UserActiveModel,
    Column as UserColumn,
};

pub use role::{
    Entity as RoleEntity,
    Model as Role,
    ActiveModel as RoleActiveModel,
    Column as RoleColumn,
};

pub use permission::{
    Entity as PermissionEntity,
    Model as PermissionRow,
    ActiveModel as PermissionActiveModel,
    Column as PermissionColumn,
};

pub use role_permission::{
    Entity as RolePermissionEntity,
    Model as RolePermission,
    ActiveModel as RolePermissionActiveModel,
    Column as RolePermissionColumn,
};

pub use user_role::{
    Entity as UserRoleEntity,
    Model as UserRole,
    ActiveModel as UserRoleActiveModel,
    Column as UserRoleColumn,
};
