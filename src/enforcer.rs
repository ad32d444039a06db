//! API gate using Casbin
//!
//! Policies are derived from the RBAC tables instead of being stored on their
//! own: every enabled resource role grants the method/path resources of its
//! enabled permissions, and user-role bindings become grouping policies.
//! The enforcer is rebuilt lazily after services mark it stale.

use casbin::{CoreApi, DefaultModel, Enforcer, MgmtApi};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::context::Context;
use crate::entity::permission;
use crate::entity::role::{self, RoleType};
use crate::entity::Status;
use crate::error::{AppError, AppResult};
use crate::query::Query;
use crate::repository::{PermissionRepository, RoleRepository, UserRepository};

/// Built-in model: role inheritance plus `:param` route patterns
const MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub) && keyMatch2(r.obj, p.obj) && r.act == p.act
"#;

/// Casbin subject of a role
pub fn role_subject(tenant_id: i64, role_id: i64) -> String {
    format!("t{}:r{}", tenant_id, role_id)
}

pub fn user_subject(tenant_id: i64, user_id: i64) -> String {
    format!("t{}:u{}", tenant_id, user_id)
}

fn casbin_err(e: casbin::Error) -> AppError {
    error!("Casbin error: {}", e);
    AppError::Internal(format!("casbin: {}", e))
}

pub struct ApiEnforcer {
    roles: Arc<dyn RoleRepository>,
    users: Arc<dyn UserRepository>,
    permissions: Arc<dyn PermissionRepository>,
    model_path: Option<PathBuf>,
    enforcer: RwLock<Option<Enforcer>>,
    stale: AtomicBool,
}

impl ApiEnforcer {
    /// The enforcer is loaded on the first check
    pub fn new(
        roles: Arc<dyn RoleRepository>,
        users: Arc<dyn UserRepository>,
        permissions: Arc<dyn PermissionRepository>,
        model_path: Option<PathBuf>,
    ) -> Self {
        Self {
            roles,
            users,
            permissions,
            model_path,
            enforcer: RwLock::new(None),
            stale: AtomicBool::new(true),
        }
    }

    /// Force a reload before the next check
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    async fn model(&self) -> AppResult<DefaultModel> {
        let model = match &self.model_path {
            Some(path) => DefaultModel::from_file(path).await,
            None => DefaultModel::from_str(MODEL).await,
        };
        model.map_err(casbin_err)
    }

    /// `(p, g)` rules for every tenant
    async fn policies(&self) -> AppResult<(Vec<Vec<String>>, Vec<Vec<String>>)> {
        let roles: HashMap<i64, role::Model> = self
            .roles
            .find(&Query::new().filter(role::field::ROLE_TYPE.eq(RoleType::Resource as i32)))
            .await?
            .items
            .into_iter()
            .filter(|r| r.is_enabled())
            .map(|r| (r.id, r))
            .collect();

        let enabled_perms: HashSet<i64> = self
            .permissions
            .find(&Query::new().filter(permission::field::STATUS.eq(i32::from(Status::Enabled))))
            .await?
            .items
            .iter()
            .map(|p| p.id)
            .collect();

        // permission id -> subjects of the roles granting it
        let mut granted: HashMap<i64, Vec<String>> = HashMap::new();
        for binding in self.roles.permission_bindings(None).await? {
            let Some(role) = roles.get(&binding.role_id) else {
                continue;
            };
            if enabled_perms.contains(&binding.permission_id) {
                granted
                    .entry(binding.permission_id)
                    .or_default()
                    .push(role_subject(role.tenant_id, role.id));
            }
        }

        let ids: Vec<i64> = granted.keys().copied().collect();
        let mut p_rules = Vec::new();
        if !ids.is_empty() {
            for resource in self.permissions.resources_by_permissions(&ids).await? {
                for subject in granted.get(&resource.permission_id).into_iter().flatten() {
                    p_rules.push(vec![
                        subject.clone(),
                        resource.path.clone(),
                        resource.method.to_uppercase(),
                    ]);
                }
            }
        }

        let g_rules = self
            .users
            .role_bindings(None)
            .await?
            .into_iter()
            .filter(|b| roles.contains_key(&b.role_id))
            .map(|b| {
                vec![
                    user_subject(b.tenant_id, b.user_id),
                    role_subject(b.tenant_id, b.role_id),
                ]
            })
            .collect();

        Ok((p_rules, g_rules))
    }

    async fn build(&self) -> AppResult<Enforcer> {
        let mut enforcer = Enforcer::new(self.model().await?, ()).await.map_err(casbin_err)?;
        let (p_rules, g_rules) = self.policies().await?;
        let (p_count, g_count) = (p_rules.len(), g_rules.len());
        if !p_rules.is_empty() {
            enforcer.add_policies(p_rules).await.map_err(casbin_err)?;
        }
        if !g_rules.is_empty() {
            enforcer
                .add_grouping_policies(g_rules)
                .await
                .map_err(casbin_err)?;
        }
        info!("API policies loaded: {} grants, {} bindings", p_count, g_count);
        Ok(enforcer)
    }

    async fn install(&self, slot: &mut Option<Enforcer>) -> AppResult<()> {
        match self.build().await {
            Ok(enforcer) => {
                *slot = Some(enforcer);
                Ok(())
            }
            Err(e) => {
                self.mark_stale();
                Err(e)
            }
        }
    }

    /// Rebuild from the store unconditionally
    pub async fn reload(&self) -> AppResult<()> {
        let mut guard = self.enforcer.write().await;
        self.stale.store(false, Ordering::Release);
        self.install(&mut guard).await
    }

    async fn refresh(&self) -> AppResult<()> {
        if !self.is_stale() {
            return Ok(());
        }
        let mut guard = self.enforcer.write().await;
        // Another caller may have reloaded while we waited for the lock
        if !self.stale.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.install(&mut guard).await
    }

    /// Whether the caller may invoke `method path`
    pub async fn allowed(&self, ctx: &Context, method: &str, path: &str) -> AppResult<bool> {
        // Reloads are not cancellable
        ctx.check()?;
        self.refresh().await?;
        let guard = self.enforcer.read().await;
        let Some(enforcer) = guard.as_ref() else {
            return Ok(false);
        };
        let subject = user_subject(ctx.tenant_id(), ctx.user_id());
        enforcer
            .enforce((subject.as_str(), path, method.to_uppercase().as_str()))
            .map_err(casbin_err)
    }

    /// `Forbidden` unless a resource role of the caller grants the endpoint
    pub async fn check(&self, ctx: &Context, method: &str, path: &str) -> AppResult<()> {
        if self.allowed(ctx, method, path).await? {
            return Ok(());
        }
        debug!(
            "API access denied: user={}, tenant={}, {} {}",
            ctx.user_id(),
            ctx.tenant_id(),
            method,
            path
        );
        Err(AppError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::permission::PermissionType;
    use crate::entity::permission_resource::Resource;
    use crate::entity::user;
    use crate::service::permission::PermissionInput;
    use crate::service::role::RoleInput;
    use crate::state::Engine;
    use tokio_test::{assert_err, assert_ok};

    async fn user_in(engine: &Engine, tenant_id: i64) -> i64 {
        engine
            .repos
            .users
            .create(user::Model {
                id: 0,
                tenant_id,
                username: "api".to_string(),
                department_id: 0,
                status: 1,
            })
            .await
            .unwrap()
            .id
    }

    /// A resource role granting `GET /api/departments/:id` to a new user
    async fn setup(engine: &Engine, ctx: &Context) -> (i64, i64, i64) {
        let mut input = PermissionInput::new(0, "dept", "Departments", PermissionType::Button);
        input.resources = Some(vec![Resource::new("get", "/api/departments/:id")]);
        let perm = engine.permissions.create(ctx, input).await.unwrap();
        let role = engine
            .roles
            .create(ctx, RoleInput::new("viewer", "Viewer", RoleType::Resource))
            .await
            .unwrap();
        engine.roles.assign_permissions(ctx, role.id, &[perm.id]).await.unwrap();
        let uid = user_in(engine, ctx.tenant_id()).await;
        engine.roles.assign_roles(ctx, uid, &[role.id]).await.unwrap();
        (perm.id, role.id, uid)
    }

    #[tokio::test]
    async fn test_granted_route_pattern() {
        let engine = Engine::in_memory();
        let admin = Context::new(1, 1);
        let (_, _, uid) = setup(&engine, &admin).await;

        let ctx = Context::new(1, uid);
        assert_ok!(engine.enforcer.check(&ctx, "GET", "/api/departments/42").await);
        assert_ok!(engine.enforcer.check(&ctx, "get", "/api/departments/7").await);
        let err = assert_err!(engine.enforcer.check(&ctx, "DELETE", "/api/departments/42").await);
        assert!(matches!(err, AppError::Forbidden));
        assert_err!(engine.enforcer.check(&ctx, "GET", "/api/roles/1").await);

        // Same user id in another tenant holds nothing
        assert_err!(engine.enforcer.check(&Context::new(2, uid), "GET", "/api/departments/42").await);
    }

    #[tokio::test]
    async fn test_reloads_after_binding_changes() {
        let engine = Engine::in_memory();
        let admin = Context::new(1, 1);
        let (perm_id, role_id, uid) = setup(&engine, &admin).await;
        let ctx = Context::new(1, uid);
        assert_ok!(engine.enforcer.check(&ctx, "GET", "/api/departments/1").await);

        assert_ok!(engine.roles.update_status(&admin, role_id, Status::Disabled).await);
        assert!(engine.enforcer.is_stale());
        assert_err!(engine.enforcer.check(&ctx, "GET", "/api/departments/1").await);

        assert_ok!(engine.roles.update_status(&admin, role_id, Status::Enabled).await);
        assert_ok!(engine.enforcer.check(&ctx, "GET", "/api/departments/1").await);

        assert_ok!(engine.roles.assign_roles(&admin, uid, &[]).await);
        assert_err!(engine.enforcer.check(&ctx, "GET", "/api/departments/1").await);

        assert_ok!(engine.roles.assign_roles(&admin, uid, &[role_id]).await);
        assert_ok!(engine.permissions.delete(&admin, perm_id).await);
        assert_err!(engine.enforcer.check(&ctx, "GET", "/api/departments/1").await);
    }

    #[tokio::test]
    async fn test_data_roles_grant_no_api() {
        let engine = Engine::in_memory();
        let admin = Context::new(1, 1);
        let mut input = PermissionInput::new(0, "dept", "Departments", PermissionType::Button);
        input.resources = Some(vec![Resource::new("GET", "/api/departments")]);
        let perm = assert_ok!(engine.permissions.create(&admin, input).await);
        let role = assert_ok!(
            engine
                .roles
                .create(&admin, RoleInput::new("rows", "Rows", RoleType::Data))
                .await
        );
        assert_ok!(engine.roles.assign_permissions(&admin, role.id, &[perm.id]).await);
        let uid = user_in(&engine, 1).await;
        assert_ok!(engine.roles.assign_roles(&admin, uid, &[role.id]).await);

        let ctx = Context::new(1, uid);
        assert_err!(engine.enforcer.check(&ctx, "GET", "/api/departments").await);
    }

    #[test]
    fn test_subjects() {
        assert_eq!(role_subject(3, 9), "t3:r9");
        assert_eq!(user_subject(3, 9), "t3:u9");
    }
}
