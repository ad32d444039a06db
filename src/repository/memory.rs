//! In-memory repositories
//!
//! Backs the service tests and single-process setups without a database.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;

use super::{
    DataPermissionRepository, DepartmentRepository, PathRewrite, PermissionRepository,
    RoleRepository, UserRepository,
};
use crate::entity::permission_resource::{self, Resource};
use crate::entity::{data_permission, department, permission, role, role_permission, user, user_role};
use crate::error::{AppResult, OptionExt};
use crate::query::{PageResult, Query};

/// Every table in one place, keyed by id
#[derive(Debug)]
pub struct MemoryRepository {
    seq: AtomicI64,
    // Serializes multi-row writes
    write_lock: Mutex<()>,
    departments: DashMap<i64, department::Model>,
    permissions: DashMap<i64, permission::Model>,
    resources: DashMap<i64, permission_resource::Model>,
    roles: DashMap<i64, role::Model>,
    role_permissions: DashMap<i64, role_permission::Model>,
    // Keyed by role id
    data_permissions: DashMap<i64, data_permission::Model>,
    users: DashMap<i64, user::Model>,
    user_roles: DashMap<i64, user_role::Model>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self {
            seq: AtomicI64::new(1),
            write_lock: Mutex::new(()),
            departments: DashMap::new(),
            permissions: DashMap::new(),
            resources: DashMap::new(),
            roles: DashMap::new(),
            role_permissions: DashMap::new(),
            data_permissions: DashMap::new(),
            users: DashMap::new(),
            user_roles: DashMap::new(),
        }
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }
}

/// Rows ordered by id so unsorted queries stay deterministic
fn snapshot<M: Clone>(table: &DashMap<i64, M>) -> Vec<M> {
    let mut rows: Vec<(i64, M)> = table.iter().map(|r| (*r.key(), r.value().clone())).collect();
    rows.sort_by_key(|(id, _)| *id);
    rows.into_iter().map(|(_, m)| m).collect()
}

fn replace<M: Clone>(table: &DashMap<i64, M>, id: i64, model: M, what: &str) -> AppResult<M> {
    let mut slot = table.get_mut(&id).ok_or_not_found(format!("{} not found", what))?;
    *slot = model.clone();
    Ok(model)
}

#[async_trait]
impl DepartmentRepository for MemoryRepository {
    async fn create(&self, mut model: department::Model) -> AppResult<department::Model> {
        model.id = self.next_id();
        self.departments.insert(model.id, model.clone());
        Ok(model)
    }

    async fn update(&self, model: department::Model) -> AppResult<department::Model> {
        replace(&self.departments, model.id, model, "Department")
    }

    async fn delete(&self, id: i64) -> AppResult<()> {
        self.departments
            .remove(&id)
            .map(|_| ())
            .ok_or_not_found("Department not found")
    }

    async fn get_by_id(&self, id: i64) -> AppResult<department::Model> {
        self.departments
            .get(&id)
            .map(|d| d.clone())
            .ok_or_not_found("Department not found")
    }

    async fn get_by_code(&self, tenant_id: i64, code: &str) -> AppResult<Option<department::Model>> {
        Ok(self
            .departments
            .iter()
            .find(|d| d.tenant_id == tenant_id && d.code == code)
            .map(|d| d.clone()))
    }

    async fn find(&self, query: &Query<department::Model>) -> AppResult<PageResult<department::Model>> {
        Ok(query.apply(snapshot(&self.departments)))
    }

    async fn count(&self, query: &Query<department::Model>) -> AppResult<u64> {
        Ok(query.count(snapshot(&self.departments).iter()))
    }
}

#[async_trait]
impl PermissionRepository for MemoryRepository {
    async fn create(
        &self,
        mut model: permission::Model,
        resources: Vec<Resource>,
    ) -> AppResult<permission::Model> {
        let _guard = self.write_lock.lock().await;
        model.id = self.next_id();
        self.permissions.insert(model.id, model.clone());
        for res in resources {
            let id = self.next_id();
            self.resources.insert(
                id,
                permission_resource::Model {
                    id,
                    permission_id: model.id,
                    method: res.method,
                    path: res.path,
                },
            );
        }
        Ok(model)
    }

    async fn update(
        &self,
        model: permission::Model,
        resources: Option<Vec<Resource>>,
        rewrite: Option<PathRewrite>,
    ) -> AppResult<permission::Model> {
        let _guard = self.write_lock.lock().await;
        let model = replace(&self.permissions, model.id, model, "Permission")?;
        if let Some(resources) = resources {
            self.resources.retain(|_, r| r.permission_id != model.id);
            for res in resources {
                let id = self.next_id();
                self.resources.insert(
                    id,
                    permission_resource::Model {
                        id,
                        permission_id: model.id,
                        method: res.method,
                        path: res.path,
                    },
                );
            }
        }
        if let Some(rewrite) = rewrite {
            for mut node in self.permissions.iter_mut() {
                if let Some(path) = rewrite.apply(&node.parent_path) {
                    node.parent_path = path;
                }
            }
        }
        Ok(model)
    }

    async fn delete_many(&self, ids: &[i64]) -> AppResult<u64> {
        let _guard = self.write_lock.lock().await;
        let ids: HashSet<i64> = ids.iter().copied().collect();
        let before = self.permissions.len();
        self.permissions.retain(|id, _| !ids.contains(id));
        self.resources.retain(|_, r| !ids.contains(&r.permission_id));
        self.role_permissions
            .retain(|_, rp| !ids.contains(&rp.permission_id));
        Ok((before - self.permissions.len()) as u64)
    }

    async fn get_by_id(&self, id: i64) -> AppResult<permission::Model> {
        self.permissions
            .get(&id)
            .map(|p| p.clone())
            .ok_or_not_found("Permission not found")
    }

    async fn find(&self, query: &Query<permission::Model>) -> AppResult<PageResult<permission::Model>> {
        Ok(query.apply(snapshot(&self.permissions)))
    }

    async fn count(&self, query: &Query<permission::Model>) -> AppResult<u64> {
        Ok(query.count(snapshot(&self.permissions).iter()))
    }

    async fn existing_ids(&self, ids: &[i64]) -> AppResult<Vec<i64>> {
        Ok(ids
            .iter()
            .copied()
            .filter(|id| self.permissions.contains_key(id))
            .collect())
    }

    async fn resources_by_permissions(
        &self,
        ids: &[i64],
    ) -> AppResult<Vec<permission_resource::Model>> {
        let ids: HashSet<i64> = ids.iter().copied().collect();
        Ok(snapshot(&self.resources)
            .into_iter()
            .filter(|r| ids.contains(&r.permission_id))
            .collect())
    }
}

#[async_trait]
impl RoleRepository for MemoryRepository {
    async fn create(&self, mut model: role::Model) -> AppResult<role::Model> {
        model.id = self.next_id();
        self.roles.insert(model.id, model.clone());
        Ok(model)
    }

    async fn update(&self, model: role::Model) -> AppResult<role::Model> {
        replace(&self.roles, model.id, model, "Role")
    }

    async fn delete(&self, id: i64) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        self.roles.remove(&id).ok_or_not_found("Role not found")?;
        self.role_permissions.retain(|_, rp| rp.role_id != id);
        self.data_permissions.remove(&id);
        self.user_roles.retain(|_, ur| ur.role_id != id);
        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> AppResult<role::Model> {
        self.roles
            .get(&id)
            .map(|r| r.clone())
            .ok_or_not_found("Role not found")
    }

    async fn get_by_code(&self, tenant_id: i64, code: &str) -> AppResult<Option<role::Model>> {
        Ok(self
            .roles
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.code == code)
            .map(|r| r.clone()))
    }

    async fn find(&self, query: &Query<role::Model>) -> AppResult<PageResult<role::Model>> {
        Ok(query.apply(snapshot(&self.roles)))
    }

    async fn count(&self, query: &Query<role::Model>) -> AppResult<u64> {
        Ok(query.count(snapshot(&self.roles).iter()))
    }

    async fn permission_ids_by_role(&self, role_id: i64) -> AppResult<Vec<i64>> {
        Ok(snapshot(&self.role_permissions)
            .into_iter()
            .filter(|rp| rp.role_id == role_id)
            .map(|rp| rp.permission_id)
            .collect())
    }

    async fn replace_permissions(
        &self,
        tenant_id: i64,
        role_id: i64,
        permission_ids: &[i64],
    ) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        self.role_permissions.retain(|_, rp| rp.role_id != role_id);
        for permission_id in permission_ids {
            let id = self.next_id();
            self.role_permissions.insert(
                id,
                role_permission::Model {
                    id,
                    tenant_id,
                    role_id,
                    permission_id: *permission_id,
                },
            );
        }
        Ok(())
    }

    async fn permission_bindings(
        &self,
        tenant_id: Option<i64>,
    ) -> AppResult<Vec<role_permission::Model>> {
        Ok(snapshot(&self.role_permissions)
            .into_iter()
            .filter(|rp| tenant_id.map_or(true, |t| rp.tenant_id == t))
            .collect())
    }
}

#[async_trait]
impl DataPermissionRepository for MemoryRepository {
    async fn get_by_role(&self, role_id: i64) -> AppResult<data_permission::Model> {
        self.data_permissions
            .get(&role_id)
            .map(|d| d.clone())
            .ok_or_not_found("Data permission not found")
    }

    async fn upsert(&self, mut model: data_permission::Model) -> AppResult<data_permission::Model> {
        let _guard = self.write_lock.lock().await;
        match self.data_permissions.get(&model.role_id) {
            Some(existing) => {
                model.id = existing.id;
                model.created_at = existing.created_at;
            }
            None => model.id = self.next_id(),
        }
        self.data_permissions.insert(model.role_id, model.clone());
        Ok(model)
    }

    async fn delete_by_role(&self, role_id: i64) -> AppResult<bool> {
        Ok(self.data_permissions.remove(&role_id).is_some())
    }
}

#[async_trait]
impl UserRepository for MemoryRepository {
    async fn create(&self, mut model: user::Model) -> AppResult<user::Model> {
        model.id = self.next_id();
        self.users.insert(model.id, model.clone());
        Ok(model)
    }

    async fn get_by_id(&self, id: i64) -> AppResult<user::Model> {
        self.users
            .get(&id)
            .map(|u| u.clone())
            .ok_or_not_found("User not found")
    }

    async fn role_ids_by_user(&self, user_id: i64) -> AppResult<Vec<i64>> {
        Ok(snapshot(&self.user_roles)
            .into_iter()
            .filter(|ur| ur.user_id == user_id)
            .map(|ur| ur.role_id)
            .collect())
    }

    async fn replace_roles(&self, tenant_id: i64, user_id: i64, role_ids: &[i64]) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        self.user_roles.retain(|_, ur| ur.user_id != user_id);
        for role_id in role_ids {
            let id = self.next_id();
            self.user_roles.insert(
                id,
                user_role::Model {
                    id,
                    tenant_id,
                    user_id,
                    role_id: *role_id,
                },
            );
        }
        Ok(())
    }

    async fn role_bindings(&self, tenant_id: Option<i64>) -> AppResult<Vec<user_role::Model>> {
        Ok(snapshot(&self.user_roles)
            .into_iter()
            .filter(|ur| tenant_id.map_or(true, |t| ur.tenant_id == t))
            .collect())
    }
}
