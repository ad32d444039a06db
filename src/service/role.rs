//! Roles and their bindings
//!
//! Resource roles grant permissions (menus and APIs), data roles carry a
//! data permission. Users may hold both kinds at once.

use futures::future::join_all;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use super::permission::{build_granted_menu_tree, MenuNode};
use super::{check_len, require};
use crate::cache::{keys, CacheLayer, Invalidation};
use crate::config::QueryConfig;
use crate::context::Context;
use crate::enforcer::ApiEnforcer;
use crate::entity::role::{self, field, RoleType};
use crate::entity::{now, permission, user, Status};
use crate::error::{AppError, AppResult};
use crate::query::{PageResult, Query};
use crate::repository::{PermissionRepository, RoleRepository, UserRepository};

#[derive(Debug, Clone, Deserialize)]
pub struct RoleInput {
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub role_type: RoleType,
    #[serde(default)]
    pub localize: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sequence: i32,
    #[serde(default)]
    pub status: Option<Status>,
}

impl RoleInput {
    pub fn new(code: &str, name: &str, role_type: RoleType) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            role_type,
            localize: String::new(),
            description: String::new(),
            sequence: 0,
            status: None,
        }
    }

    fn validate(&self) -> AppResult<()> {
        require("code", &self.code)?;
        require("name", &self.name)?;
        check_len("code", &self.code, 64)?;
        check_len("name", &self.name, 64)?;
        check_len("localize", &self.localize, 128)?;
        check_len("description", &self.description, 1024)
    }
}

/// Keep the first occurrence of every id
fn dedup(ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

pub struct RoleService {
    roles: Arc<dyn RoleRepository>,
    users: Arc<dyn UserRepository>,
    permissions: Arc<dyn PermissionRepository>,
    cache: Arc<CacheLayer>,
    enforcer: Arc<ApiEnforcer>,
    limits: QueryConfig,
}

impl RoleService {
    pub fn new(
        roles: Arc<dyn RoleRepository>,
        users: Arc<dyn UserRepository>,
        permissions: Arc<dyn PermissionRepository>,
        cache: Arc<CacheLayer>,
        enforcer: Arc<ApiEnforcer>,
        limits: QueryConfig,
    ) -> Self {
        Self {
            roles,
            users,
            permissions,
            cache,
            enforcer,
            limits,
        }
    }

    async fn load(&self, ctx: &Context, id: i64) -> AppResult<role::Model> {
        let role = ctx.run(self.roles.get_by_id(id)).await?;
        match ctx.tenant_scope() {
            Some(tenant_id) if role.tenant_id != tenant_id => {
                Err(AppError::NotFound("Role not found".to_string()))
            }
            _ => Ok(role),
        }
    }

    async fn load_user(&self, ctx: &Context, id: i64) -> AppResult<user::Model> {
        let user = ctx.run(self.users.get_by_id(id)).await?;
        match ctx.tenant_scope() {
            Some(tenant_id) if user.tenant_id != tenant_id => {
                Err(AppError::NotFound("User not found".to_string()))
            }
            _ => Ok(user),
        }
    }

    async fn ensure_code_free(
        &self,
        ctx: &Context,
        tenant_id: i64,
        code: &str,
        except: Option<i64>,
    ) -> AppResult<()> {
        match ctx.run(self.roles.get_by_code(tenant_id, code)).await? {
            Some(other) if Some(other.id) != except => {
                Err(AppError::Conflict("role code already exists".to_string()))
            }
            _ => Ok(()),
        }
    }

    // A role change can alter menus, API grants and row visibility of
    // everyone holding it
    fn role_changed(role: &role::Model) -> Invalidation {
        Invalidation::new()
            .key(keys::role(role.tenant_id, role.id))
            .key(keys::roles_enabled(role.tenant_id))
            .prefix(keys::tenant_prefix(keys::USER_MENUS, role.tenant_id))
            .prefix(keys::tenant_prefix(keys::VISIBILITY, role.tenant_id))
    }

    pub async fn create(&self, ctx: &Context, input: RoleInput) -> AppResult<role::Model> {
        input.validate()?;
        let tenant_id = ctx.tenant_id();
        self.ensure_code_free(ctx, tenant_id, &input.code, None)
            .await?;
        ctx.check()?;

        let ts = now();
        let created = self
            .roles
            .create(role::Model {
                id: 0,
                tenant_id,
                code: input.code,
                name: input.name,
                role_type: input.role_type.into(),
                localize: input.localize,
                description: input.description,
                sequence: input.sequence,
                status: input.status.unwrap_or(Status::Enabled).into(),
                created_at: ts,
                updated_at: ts,
            })
            .await?;
        info!("Role created: id={}, tenant={}, code={}", created.id, tenant_id, created.code);
        self.cache.invalidate(Self::role_changed(&created)).await;
        Ok(created)
    }

    pub async fn update(&self, ctx: &Context, id: i64, input: RoleInput) -> AppResult<role::Model> {
        input.validate()?;
        let mut role = self.load(ctx, id).await?;
        if role.role_type() != input.role_type {
            return Err(AppError::Validation(
                "role type cannot be changed".to_string(),
            ));
        }
        if role.code != input.code {
            self.ensure_code_free(ctx, role.tenant_id, &input.code, Some(id))
                .await?;
        }
        ctx.check()?;

        role.code = input.code;
        role.name = input.name;
        role.localize = input.localize;
        role.description = input.description;
        role.sequence = input.sequence;
        if let Some(status) = input.status {
            role.status = status.into();
        }
        role.updated_at = now();
        let updated = self.roles.update(role).await?;
        self.cache.invalidate(Self::role_changed(&updated)).await;
        self.enforcer.mark_stale();
        Ok(updated)
    }

    pub async fn update_status(&self, ctx: &Context, id: i64, status: Status) -> AppResult<role::Model> {
        let mut role = self.load(ctx, id).await?;
        ctx.check()?;

        role.status = status.into();
        role.updated_at = now();
        let updated = self.roles.update(role).await?;
        info!("Role {} status set to {:?}", id, status);
        self.cache.invalidate(Self::role_changed(&updated)).await;
        self.enforcer.mark_stale();
        Ok(updated)
    }

    /// Delete a role with its permission set, data permission and user bindings
    pub async fn delete(&self, ctx: &Context, id: i64) -> AppResult<()> {
        let role = self.load(ctx, id).await?;
        ctx.check()?;

        self.roles.delete(id).await?;
        info!("Role deleted: id={}, tenant={}", id, role.tenant_id);
        let inv = Self::role_changed(&role)
            .key(keys::role_permissions(role.tenant_id, id))
            .key(keys::data_permission(role.tenant_id, id))
            .prefix(keys::tenant_prefix(keys::USER_ROLES, role.tenant_id));
        self.cache.invalidate(inv).await;
        self.enforcer.mark_stale();
        Ok(())
    }

    pub async fn get_by_id(&self, ctx: &Context, id: i64) -> AppResult<role::Model> {
        let key = keys::role(ctx.tenant_id(), id);
        self.cache.cached(ctx, &key, || self.load(ctx, id)).await
    }

    /// Enabled roles of the caller's tenant ordered by `(sequence, id)`
    pub async fn find_all_enabled(&self, ctx: &Context) -> AppResult<Vec<role::Model>> {
        let key = keys::roles_enabled(ctx.tenant_id());
        self.cache
            .cached(ctx, &key, || async {
                let mut query = Query::new()
                    .filter(field::STATUS.eq(i32::from(Status::Enabled)))
                    .order_by(field::SEQUENCE.asc())
                    .order_by(field::ID.asc());
                if let Some(tenant_id) = ctx.tenant_scope() {
                    query = query.filter(field::TENANT_ID.eq(tenant_id));
                }
                Ok(ctx.run(self.roles.find(&query)).await?.items)
            })
            .await
    }

    pub async fn list(&self, ctx: &Context, query: Query<role::Model>) -> AppResult<PageResult<role::Model>> {
        let mut query = query.clamped(&self.limits);
        if let Some(tenant_id) = ctx.tenant_scope() {
            query = query.filter(field::TENANT_ID.eq(tenant_id));
        }
        ctx.run(self.roles.find(&query)).await
    }

    /// Replace the whole permission set of a role
    pub async fn assign_permissions(
        &self,
        ctx: &Context,
        role_id: i64,
        permission_ids: &[i64],
    ) -> AppResult<()> {
        let role = self.load(ctx, role_id).await?;
        let wanted = dedup(permission_ids);
        let existing: HashSet<i64> = ctx
            .run(self.permissions.existing_ids(&wanted))
            .await?
            .into_iter()
            .collect();
        if let Some(missing) = wanted.iter().find(|id| !existing.contains(id)) {
            return Err(AppError::Validation(format!(
                "permission {} does not exist",
                missing
            )));
        }
        ctx.check()?;

        self.roles
            .replace_permissions(role.tenant_id, role_id, &wanted)
            .await?;
        info!("Role {} now grants {} permissions", role_id, wanted.len());
        let inv = Invalidation::new()
            .key(keys::role_permissions(role.tenant_id, role_id))
            .prefix(keys::tenant_prefix(keys::USER_MENUS, role.tenant_id));
        self.cache.invalidate(inv).await;
        self.enforcer.mark_stale();
        Ok(())
    }

    /// Permission ids granted by a role
    pub async fn get_permission_ids(&self, ctx: &Context, role_id: i64) -> AppResult<Vec<i64>> {
        let key = keys::role_permissions(ctx.tenant_id(), role_id);
        self.cache
            .cached(ctx, &key, || async {
                self.load(ctx, role_id).await?;
                ctx.run(self.roles.permission_ids_by_role(role_id)).await
            })
            .await
    }

    /// Replace the whole role set of a user
    pub async fn assign_roles(&self, ctx: &Context, user_id: i64, role_ids: &[i64]) -> AppResult<()> {
        let user = self.load_user(ctx, user_id).await?;
        let wanted = dedup(role_ids);
        for role_id in &wanted {
            match ctx.run(self.roles.get_by_id(*role_id)).await {
                Ok(role) if role.tenant_id == user.tenant_id => {}
                Ok(_) | Err(AppError::NotFound(_)) => {
                    return Err(AppError::Validation(format!(
                        "role {} does not belong to the tenant",
                        role_id
                    )))
                }
                Err(e) => return Err(e),
            }
        }
        ctx.check()?;

        self.users
            .replace_roles(user.tenant_id, user_id, &wanted)
            .await?;
        info!("User {} now holds roles {:?}", user_id, wanted);
        let inv = Invalidation::new()
            .key(keys::user_roles(user.tenant_id, user_id))
            .key(keys::user_menus(user.tenant_id, user_id))
            .key(keys::visibility(user.tenant_id, user_id));
        self.cache.invalidate(inv).await;
        self.enforcer.mark_stale();
        Ok(())
    }

    pub async fn user_role_ids(&self, ctx: &Context, user_id: i64) -> AppResult<Vec<i64>> {
        let key = keys::user_roles(ctx.tenant_id(), user_id);
        self.cache
            .cached(ctx, &key, || async {
                self.load_user(ctx, user_id).await?;
                ctx.run(self.users.role_ids_by_user(user_id)).await
            })
            .await
    }

    /// Enabled roles held by a user
    pub async fn user_roles(&self, ctx: &Context, user_id: i64) -> AppResult<Vec<role::Model>> {
        let ids = self.user_role_ids(ctx, user_id).await?;
        let loaded = join_all(ids.iter().map(|id| self.get_by_id(ctx, *id))).await;
        let mut roles = Vec::with_capacity(loaded.len());
        for result in loaded {
            match result {
                Ok(role) if role.is_enabled() => roles.push(role),
                Ok(_) | Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(roles)
    }

    /// Menu tree granted to a user by its enabled resource roles
    pub async fn user_menus(&self, ctx: &Context, user_id: i64) -> AppResult<Vec<MenuNode>> {
        let key = keys::user_menus(ctx.tenant_id(), user_id);
        self.cache
            .cached(ctx, &key, || async {
                let mut granted = HashSet::new();
                for role in self.user_roles(ctx, user_id).await? {
                    if role.role_type() == RoleType::Resource {
                        granted.extend(self.get_permission_ids(ctx, role.id).await?);
                    }
                }
                if granted.is_empty() {
                    return Ok(Vec::new());
                }
                let query = Query::new().filter(
                    permission::field::STATUS.eq(i32::from(Status::Enabled)),
                );
                let rows = ctx.run(self.permissions.find(&query)).await?.items;
                Ok(build_granted_menu_tree(rows, &granted))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::entity::permission::PermissionType;
    use crate::repository::MemoryRepository;
    use crate::service::permission::{PermissionInput, PermissionService};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        roles: RoleService,
        perms: PermissionService,
        repo: Arc<MemoryRepository>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryRepository::new());
        let cache = Arc::new(CacheLayer::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
        ));
        let enforcer = Arc::new(ApiEnforcer::new(repo.clone(), repo.clone(), repo.clone(), None));
        let roles = RoleService::new(
            repo.clone(),
            repo.clone(),
            repo.clone(),
            cache.clone(),
            enforcer.clone(),
            QueryConfig::default(),
        );
        let perms = PermissionService::new(repo.clone(), cache, enforcer, QueryConfig::default());
        Fixture { roles, perms, repo }
    }

    async fn user(repo: &MemoryRepository, tenant_id: i64) -> i64 {
        let created = UserRepository::create(
            repo,
            user::Model {
                id: 0,
                tenant_id,
                username: format!("u{}", tenant_id),
                department_id: 0,
                status: 1,
            },
        )
        .await
        .unwrap();
        created.id
    }

    #[tokio::test]
    async fn test_assign_permissions_replaces_set() {
        let f = fixture();
        let ctx = Context::new(1, 1);
        let role = assert_ok!(f.roles.create(&ctx, RoleInput::new("ops", "Ops", RoleType::Resource)).await);
        let mut ids = Vec::new();
        for code in ["a", "b", "c"] {
            let p = assert_ok!(f.perms.create(&ctx, PermissionInput::new(0, code, code, PermissionType::Menu)).await);
            ids.push(p.id);
        }

        assert_ok!(f.roles.assign_permissions(&ctx, role.id, &ids[..2]).await);
        assert_eq!(assert_ok!(f.roles.get_permission_ids(&ctx, role.id).await), ids[..2].to_vec());

        assert_ok!(f.roles.assign_permissions(&ctx, role.id, &[ids[2], ids[2]]).await);
        assert_eq!(assert_ok!(f.roles.get_permission_ids(&ctx, role.id).await), vec![ids[2]]);

        let err = assert_err!(f.roles.assign_permissions(&ctx, 4040, &ids).await);
        assert!(err.is_not_found());
        let err = assert_err!(f.roles.assign_permissions(&ctx, role.id, &[ids[0], 4040]).await);
        assert!(matches!(err, AppError::Validation(_)));
        // A rejected assignment leaves the previous set in place
        assert_eq!(assert_ok!(f.roles.get_permission_ids(&ctx, role.id).await), vec![ids[2]]);
    }

    #[tokio::test]
    async fn test_assign_roles_checks_tenant() {
        let f = fixture();
        let ctx = Context::new(1, 1);
        let mine = assert_ok!(f.roles.create(&ctx, RoleInput::new("a", "A", RoleType::Resource)).await);
        let theirs = assert_ok!(
            f.roles
                .create(&Context::new(2, 1), RoleInput::new("b", "B", RoleType::Resource))
                .await
        );
        let uid = user(&f.repo, 1).await;

        assert_ok!(f.roles.assign_roles(&ctx, uid, &[mine.id]).await);
        assert_eq!(assert_ok!(f.roles.user_role_ids(&ctx, uid).await), vec![mine.id]);

        let err = assert_err!(f.roles.assign_roles(&ctx, uid, &[mine.id, theirs.id]).await);
        assert!(matches!(err, AppError::Validation(_)));
        assert_ok!(f.roles.assign_roles(&ctx, uid, &[]).await);
        assert!(assert_ok!(f.roles.user_role_ids(&ctx, uid).await).is_empty());
    }

    #[tokio::test]
    async fn test_find_all_enabled_ordering() {
        let f = fixture();
        let ctx = Context::new(1, 1);
        let mut late = RoleInput::new("late", "Late", RoleType::Resource);
        late.sequence = 9;
        let late = assert_ok!(f.roles.create(&ctx, late).await);
        let early = assert_ok!(f.roles.create(&ctx, RoleInput::new("early", "Early", RoleType::Data)).await);
        let off = assert_ok!(f.roles.create(&ctx, RoleInput::new("off", "Off", RoleType::Resource)).await);
        assert_ok!(f.roles.create(&Context::new(2, 1), RoleInput::new("x", "X", RoleType::Resource)).await);

        let ids: Vec<i64> = assert_ok!(f.roles.find_all_enabled(&ctx).await).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, off.id, late.id]);

        assert_ok!(f.roles.update_status(&ctx, off.id, Status::Disabled).await);
        let ids: Vec<i64> = assert_ok!(f.roles.find_all_enabled(&ctx).await).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
    }

    #[tokio::test]
    async fn test_role_code_conflict_and_type_lock() {
        let f = fixture();
        let ctx = Context::new(1, 1);
        let role = assert_ok!(f.roles.create(&ctx, RoleInput::new("a", "A", RoleType::Resource)).await);
        let err = assert_err!(f.roles.create(&ctx, RoleInput::new("a", "A2", RoleType::Data)).await);
        assert!(matches!(err, AppError::Conflict(_)));

        let err = assert_err!(f.roles.update(&ctx, role.id, RoleInput::new("a", "A", RoleType::Data)).await);
        assert!(matches!(err, AppError::Validation(_)));
        let renamed = assert_ok!(f.roles.update(&ctx, role.id, RoleInput::new("a", "Admins", RoleType::Resource)).await);
        assert_eq!(renamed.name, "Admins");
        assert_eq!(assert_ok!(f.roles.get_by_id(&ctx, role.id).await).name, "Admins");
    }

    #[tokio::test]
    async fn test_user_menus_follow_bindings() {
        let f = fixture();
        let ctx = Context::new(1, 1);
        let sys = assert_ok!(f.perms.create(&ctx, PermissionInput::new(0, "sys", "System", PermissionType::Menu)).await);
        let dept = assert_ok!(f.perms.create(&ctx, PermissionInput::new(sys.id, "dept", "Departments", PermissionType::Page)).await);
        let logs = assert_ok!(f.perms.create(&ctx, PermissionInput::new(0, "logs", "Logs", PermissionType::Menu)).await);

        let viewer = assert_ok!(f.roles.create(&ctx, RoleInput::new("viewer", "Viewer", RoleType::Resource)).await);
        let data = assert_ok!(f.roles.create(&ctx, RoleInput::new("data", "Data", RoleType::Data)).await);
        assert_ok!(f.roles.assign_permissions(&ctx, viewer.id, &[dept.id]).await);
        // Permissions on a data role do not grant menus
        assert_ok!(f.roles.assign_permissions(&ctx, data.id, &[logs.id]).await);

        let uid = user(&f.repo, 1).await;
        assert!(assert_ok!(f.roles.user_menus(&ctx, uid).await).is_empty());
        assert_ok!(f.roles.assign_roles(&ctx, uid, &[viewer.id, data.id]).await);

        let menus = assert_ok!(f.roles.user_menus(&ctx, uid).await);
        assert_eq!(menus.len(), 1);
        assert_eq!(menus[0].id, sys.id);
        assert_eq!(menus[0].children[0].id, dept.id);

        assert_ok!(f.roles.assign_permissions(&ctx, viewer.id, &[dept.id, logs.id]).await);
        assert_eq!(assert_ok!(f.roles.user_menus(&ctx, uid).await).len(), 2);

        assert_ok!(f.roles.update_status(&ctx, viewer.id, Status::Disabled).await);
        assert!(assert_ok!(f.roles.user_menus(&ctx, uid).await).is_empty());
    }

    #[tokio::test]
    async fn test_delete_drops_bindings() {
        let f = fixture();
        let ctx = Context::new(1, 1);
        let role = assert_ok!(f.roles.create(&ctx, RoleInput::new("a", "A", RoleType::Resource)).await);
        let p = assert_ok!(f.perms.create(&ctx, PermissionInput::new(0, "p", "P", PermissionType::Menu)).await);
        let uid = user(&f.repo, 1).await;
        assert_ok!(f.roles.assign_permissions(&ctx, role.id, &[p.id]).await);
        assert_ok!(f.roles.assign_roles(&ctx, uid, &[role.id]).await);
        assert_eq!(assert_ok!(f.roles.user_role_ids(&ctx, uid).await), vec![role.id]);

        assert_ok!(f.roles.delete(&ctx, role.id).await);
        assert!(assert_err!(f.roles.get_by_id(&ctx, role.id).await).is_not_found());
        assert!(assert_err!(f.roles.get_permission_ids(&ctx, role.id).await).is_not_found());
        assert!(assert_ok!(f.roles.user_role_ids(&ctx, uid).await).is_empty());
    }
}
