//! Persistence contracts
//!
//! Repositories are tenant agnostic: services add tenant filters to their
//! queries and check ownership of rows fetched by id. Multi-row replacements
//! are atomic in every implementation.

pub mod memory;
pub mod sea;

use async_trait::async_trait;

use crate::entity::permission_resource::{self, Resource};
use crate::entity::{data_permission, department, permission, role, role_permission, user, user_role};
use crate::error::AppResult;
use crate::query::{PageResult, Query};

pub use memory::MemoryRepository;
pub use sea::SeaRepository;

#[async_trait]
pub trait DepartmentRepository: Send + Sync {
    /// Insert; the id is assigned by the store
    async fn create(&self, model: department::Model) -> AppResult<department::Model>;
    async fn update(&self, model: department::Model) -> AppResult<department::Model>;
    async fn delete(&self, id: i64) -> AppResult<()>;
    async fn get_by_id(&self, id: i64) -> AppResult<department::Model>;
    async fn get_by_code(&self, tenant_id: i64, code: &str) -> AppResult<Option<department::Model>>;
    async fn find(&self, query: &Query<department::Model>) -> AppResult<PageResult<department::Model>>;
    async fn count(&self, query: &Query<department::Model>) -> AppResult<u64>;
}

/// Rewrite of the materialized path prefix of a moved subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRewrite {
    pub from: String,
    pub to: String,
}

impl PathRewrite {
    pub fn apply(&self, path: &str) -> Option<String> {
        path.strip_prefix(&self.from)
            .map(|rest| format!("{}{}", self.to, rest))
    }
}

#[async_trait]
pub trait PermissionRepository: Send + Sync {
    async fn create(
        &self,
        model: permission::Model,
        resources: Vec<Resource>,
    ) -> AppResult<permission::Model>;

    /// Update one node. `resources` replaces its resource set when given;
    /// `rewrite` moves the `parent_path` of every descendant in the same
    /// transaction.
    async fn update(
        &self,
        model: permission::Model,
        resources: Option<Vec<Resource>>,
        rewrite: Option<PathRewrite>,
    ) -> AppResult<permission::Model>;

    /// Delete nodes with their resources and role bindings
    async fn delete_many(&self, ids: &[i64]) -> AppResult<u64>;

    async fn get_by_id(&self, id: i64) -> AppResult<permission::Model>;
    async fn find(&self, query: &Query<permission::Model>) -> AppResult<PageResult<permission::Model>>;
    async fn count(&self, query: &Query<permission::Model>) -> AppResult<u64>;

    /// Which of `ids` exist
    async fn existing_ids(&self, ids: &[i64]) -> AppResult<Vec<i64>>;

    async fn resources_by_permissions(
        &self,
        ids: &[i64],
    ) -> AppResult<Vec<permission_resource::Model>>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn create(&self, model: role::Model) -> AppResult<role::Model>;
    async fn update(&self, model: role::Model) -> AppResult<role::Model>;

    /// Delete the role with its permission bindings, data permission and
    /// user bindings
    async fn delete(&self, id: i64) -> AppResult<()>;

    async fn get_by_id(&self, id: i64) -> AppResult<role::Model>;
    async fn get_by_code(&self, tenant_id: i64, code: &str) -> AppResult<Option<role::Model>>;
    async fn find(&self, query: &Query<role::Model>) -> AppResult<PageResult<role::Model>>;
    async fn count(&self, query: &Query<role::Model>) -> AppResult<u64>;

    async fn permission_ids_by_role(&self, role_id: i64) -> AppResult<Vec<i64>>;

    /// Replace the whole permission set of a role
    async fn replace_permissions(
        &self,
        tenant_id: i64,
        role_id: i64,
        permission_ids: &[i64],
    ) -> AppResult<()>;

    /// Role-permission rows, optionally limited to one tenant
    async fn permission_bindings(
        &self,
        tenant_id: Option<i64>,
    ) -> AppResult<Vec<role_permission::Model>>;
}

#[async_trait]
pub trait DataPermissionRepository: Send + Sync {
    /// `NotFound` when the role has no data permission
    async fn get_by_role(&self, role_id: i64) -> AppResult<data_permission::Model>;

    /// Insert or replace the single row of `model.role_id`
    async fn upsert(&self, model: data_permission::Model) -> AppResult<data_permission::Model>;

    /// Returns whether a row was removed
    async fn delete_by_role(&self, role_id: i64) -> AppResult<bool>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, model: user::Model) -> AppResult<user::Model>;
    async fn get_by_id(&self, id: i64) -> AppResult<user::Model>;
    async fn role_ids_by_user(&self, user_id: i64) -> AppResult<Vec<i64>>;

    /// Replace the whole role set of a user
    async fn replace_roles(&self, tenant_id: i64, user_id: i64, role_ids: &[i64]) -> AppResult<()>;

    /// User-role rows, optionally limited to one tenant
    async fn role_bindings(&self, tenant_id: Option<i64>) -> AppResult<Vec<user_role::Model>>;
}
