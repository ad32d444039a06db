//! Data permission resolver
//!
//! Turns a user's data roles into the set of rows the user may see. Several
//! data roles compose by union, so the most permissive one wins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::department::DepartmentService;
use super::role::RoleService;
use crate::cache::{keys, CacheLayer, Invalidation};
use crate::context::Context;
use crate::entity::data_permission::{self, encode_dept_ids, DataScope};
use crate::entity::role::RoleType;
use crate::entity::{now, user, ROOT_ID};
use crate::error::{AppError, AppResult, OptionalExt};
use crate::query::{Field, Filter, Query};
use crate::repository::{DataPermissionRepository, UserRepository};

/// Rows a user may read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Visibility {
    /// No row filter at all
    All,
    /// Every row of the caller's tenant (the tenant filter is applied anyway)
    Tenant,
    /// Rows of `depts`, plus the caller's own rows when `own_rows` is set
    Restricted {
        depts: BTreeSet<i64>,
        own_rows: bool,
    },
}

impl Visibility {
    /// Only the caller's own rows
    pub fn own_rows() -> Self {
        Visibility::Restricted {
            depts: BTreeSet::new(),
            own_rows: true,
        }
    }

    pub fn departments<I: IntoIterator<Item = i64>>(ids: I) -> Self {
        Visibility::Restricted {
            depts: ids.into_iter().collect(),
            own_rows: false,
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        !matches!(self, Visibility::Restricted { .. })
    }

    /// Visible departments, `None` when there is no department filter
    pub fn department_ids(&self) -> Option<&BTreeSet<i64>> {
        match self {
            Visibility::Restricted { depts, .. } => Some(depts),
            _ => None,
        }
    }

    /// Most permissive combination of two grants
    pub fn union(self, other: Visibility) -> Visibility {
        match (self, other) {
            (Visibility::All, _) | (_, Visibility::All) => Visibility::All,
            (Visibility::Tenant, _) | (_, Visibility::Tenant) => Visibility::Tenant,
            (
                Visibility::Restricted { mut depts, own_rows },
                Visibility::Restricted {
                    depts: more,
                    own_rows: own_more,
                },
            ) => {
                depts.extend(more);
                Visibility::Restricted {
                    depts,
                    own_rows: own_rows || own_more,
                }
            }
        }
    }

    /// Lower to a row filter over `dept` / `owner` columns.
    ///
    /// `None` means no filter. A restriction that grants nothing yields a
    /// filter matching no row.
    pub fn to_filter<R>(
        &self,
        dept: Field<R, i64>,
        owner: Field<R, i64>,
        user_id: i64,
    ) -> Option<Filter<R>> {
        let Visibility::Restricted { depts, own_rows } = self else {
            return None;
        };
        let by_dept = (!depts.is_empty()).then(|| dept.is_in(depts.iter().copied()));
        let by_owner = own_rows.then(|| owner.eq(user_id));
        Some(match (by_dept, by_owner) {
            (Some(d), Some(o)) => d.or(o),
            (Some(d), None) => d,
            (None, Some(o)) => o,
            (None, None) => dept.is_in(Vec::<i64>::new()),
        })
    }

    /// Add the row filter (if any) to a query
    pub fn restrict<R>(
        &self,
        query: Query<R>,
        dept: Field<R, i64>,
        owner: Field<R, i64>,
        user_id: i64,
    ) -> Query<R> {
        match self.to_filter(dept, owner, user_id) {
            Some(filter) => query.filter(filter),
            None => query,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignDataPermission {
    pub role_id: i64,
    pub scope: DataScope,
    /// Only used by the custom scope
    #[serde(default)]
    pub dept_ids: Vec<i64>,
}

pub struct DataScopeService {
    data: Arc<dyn DataPermissionRepository>,
    users: Arc<dyn UserRepository>,
    roles: Arc<RoleService>,
    departments: Arc<DepartmentService>,
    cache: Arc<CacheLayer>,
}

impl DataScopeService {
    pub fn new(
        data: Arc<dyn DataPermissionRepository>,
        users: Arc<dyn UserRepository>,
        roles: Arc<RoleService>,
        departments: Arc<DepartmentService>,
        cache: Arc<CacheLayer>,
    ) -> Self {
        Self {
            data,
            users,
            roles,
            departments,
            cache,
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

    fn changed(tenant_id: i64, role_id: i64) -> Invalidation {
        Invalidation::new()
            .key(keys::data_permission(tenant_id, role_id))
            .prefix(keys::tenant_prefix(keys::VISIBILITY, tenant_id))
    }

    /// Upsert the data permission of a data role
    pub async fn assign_data_permission(
        &self,
        ctx: &Context,
        input: AssignDataPermission,
    ) -> AppResult<data_permission::Model> {
        let role = self.roles.get_by_id(ctx, input.role_id).await?;
        if role.role_type() != RoleType::Data {
            return Err(AppError::Validation(
                "data permissions can only be assigned to data roles".to_string(),
            ));
        }
        let mut dept_ids: Vec<i64> = Vec::new();
        if input.scope == DataScope::Custom {
            for id in &input.dept_ids {
                if dept_ids.contains(id) {
                    continue;
                }
                match self.departments.get_by_id(ctx, *id).await {
                    Ok(dept) if dept.tenant_id == role.tenant_id => dept_ids.push(*id),
                    Ok(_) | Err(AppError::NotFound(_)) => {
                        return Err(AppError::Validation(format!(
                            "department {} does not belong to the tenant",
                            id
                        )))
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        ctx.check()?;

        let ts = now();
        let saved = self
            .data
            .upsert(data_permission::Model {
                id: 0,
                tenant_id: role.tenant_id,
                role_id: role.id,
                scope: input.scope.as_str().to_string(),
                dept_ids: encode_dept_ids(&dept_ids),
                created_at: ts,
                updated_at: ts,
            })
            .await?;
        info!(
            "Data permission of role {} set to {}",
            role.id,
            input.scope.as_str()
        );
        self.cache.invalidate(Self::changed(role.tenant_id, role.id)).await;
        Ok(saved)
    }

    /// Drop the data permission of a role; removing an absent one is a no-op
    pub async fn remove_data_permission(&self, ctx: &Context, role_id: i64) -> AppResult<()> {
        let role = self.roles.get_by_id(ctx, role_id).await?;
        ctx.check()?;

        if self.data.delete_by_role(role_id).await? {
            info!("Data permission of role {} removed", role_id);
        } else {
            debug!("Role {} had no data permission", role_id);
        }
        self.cache.invalidate(Self::changed(role.tenant_id, role_id)).await;
        Ok(())
    }

    /// `NotFound` when the role has none
    pub async fn get_data_permission(
        &self,
        ctx: &Context,
        role_id: i64,
    ) -> AppResult<data_permission::Model> {
        let key = keys::data_permission(ctx.tenant_id(), role_id);
        self.cache
            .cached(ctx, &key, || async {
                self.roles.get_by_id(ctx, role_id).await?;
                ctx.run(self.data.get_by_role(role_id)).await
            })
            .await
    }

    /// Rows visible to `user_id` under its enabled data roles.
    ///
    /// Roles without a data permission contribute nothing; a user left with
    /// no contribution at all sees only its own rows.
    pub async fn resolve(&self, ctx: &Context, user_id: i64) -> AppResult<Visibility> {
        let key = keys::visibility(ctx.tenant_id(), user_id);
        self.cache
            .cached(ctx, &key, || async {
                let user = self.load_user(ctx, user_id).await?;
                let mut resolved: Option<Visibility> = None;
                for role in self.roles.user_roles(ctx, user_id).await? {
                    if role.role_type() != RoleType::Data {
                        continue;
                    }
                    let Some(grant) = self.get_data_permission(ctx, role.id).await.optional()? else {
                        continue;
                    };
                    let visibility = self.grant_visibility(ctx, &user, &grant).await?;
                    resolved = Some(match resolved {
                        Some(acc) => acc.union(visibility),
                        None => visibility,
                    });
                }
                Ok(resolved.unwrap_or_else(Visibility::own_rows))
            })
            .await
    }

    /// Visibility granted to `user` by one role's data permission
    pub async fn grant_visibility(
        &self,
        ctx: &Context,
        user: &user::Model,
        grant: &data_permission::Model,
    ) -> AppResult<Visibility> {
        let own_dept = user.department_id;
        let visibility = match grant.scope() {
            DataScope::All => Visibility::All,
            DataScope::Tenant => Visibility::Tenant,
            DataScope::SelfOnly => Visibility::own_rows(),
            DataScope::Custom => Visibility::departments(grant.dept_ids()),
            // Users outside any department can only see their own rows
            DataScope::Dept | DataScope::DeptTree if own_dept == ROOT_ID => Visibility::own_rows(),
            DataScope::Dept => Visibility::departments([own_dept]),
            DataScope::DeptTree => {
                let mut ids = self.departments.descendant_ids(ctx, own_dept).await?;
                ids.push(own_dept);
                Visibility::departments(ids)
            }
        };
        Ok(visibility)
    }

    /// Row filter for list queries run on behalf of `user_id`
    pub async fn filter_for<R>(
        &self,
        ctx: &Context,
        user_id: i64,
        dept: Field<R, i64>,
        owner: Field<R, i64>,
    ) -> AppResult<Option<Filter<R>>> {
        Ok(self.resolve(ctx, user_id).await?.to_filter(dept, owner, user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Value;
    use crate::service::department::CreateDepartment;
    use crate::service::role::RoleInput;
    use crate::state::Engine;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Debug, Clone)]
    struct Row {
        dept_id: i64,
        owner_id: i64,
    }

    const DEPT: Field<Row, i64> = Field::new("dept_id", |r: &Row| Value::from(r.dept_id));
    const OWNER: Field<Row, i64> = Field::new("owner_id", |r: &Row| Value::from(r.owner_id));

    async fn dept(engine: &Engine, ctx: &Context, parent_id: i64, code: &str) -> i64 {
        let input = CreateDepartment {
            parent_id,
            code: code.to_string(),
            name: code.to_string(),
            ..Default::default()
        };
        engine.departments.create(ctx, input).await.unwrap().id
    }

    async fn user_in(engine: &Engine, tenant_id: i64, department_id: i64) -> i64 {
        engine
            .repos
            .users
            .create(user::Model {
                id: 0,
                tenant_id,
                username: "someone".to_string(),
                department_id,
                status: 1,
            })
            .await
            .unwrap()
            .id
    }

    async fn data_role(engine: &Engine, ctx: &Context, code: &str, scope: DataScope, dept_ids: Vec<i64>) -> i64 {
        let role = engine
            .roles
            .create(ctx, RoleInput::new(code, code, RoleType::Data))
            .await
            .unwrap();
        let input = AssignDataPermission {
            role_id: role.id,
            scope,
            dept_ids,
        };
        engine.data_scopes.assign_data_permission(ctx, input).await.unwrap();
        role.id
    }

    #[tokio::test]
    async fn test_custom_scope_ignores_own_department() {
        let engine = Engine::in_memory();
        let ctx = Context::new(1, 1);
        let d1 = dept(&engine, &ctx, 0, "d1").await;
        let d2 = dept(&engine, &ctx, 0, "d2").await;
        let d3 = dept(&engine, &ctx, 0, "d3").await;
        let role = data_role(&engine, &ctx, "custom", DataScope::Custom, vec![d1, d2]).await;
        let uid = user_in(&engine, 1, d3).await;
        assert_ok!(engine.roles.assign_roles(&ctx, uid, &[role]).await);

        let visibility = assert_ok!(engine.data_scopes.resolve(&ctx, uid).await);
        assert_eq!(visibility, Visibility::departments([d1, d2]));
    }

    #[tokio::test]
    async fn test_dept_tree_scope() {
        let engine = Engine::in_memory();
        let ctx = Context::new(1, 1);
        let d = dept(&engine, &ctx, 0, "d").await;
        let d1 = dept(&engine, &ctx, d, "d1").await;
        let d11 = dept(&engine, &ctx, d1, "d1.1").await;
        dept(&engine, &ctx, 0, "elsewhere").await;
        let role = data_role(&engine, &ctx, "tree", DataScope::DeptTree, vec![]).await;
        let uid = user_in(&engine, 1, d).await;
        assert_ok!(engine.roles.assign_roles(&ctx, uid, &[role]).await);

        let visibility = assert_ok!(engine.data_scopes.resolve(&ctx, uid).await);
        assert_eq!(visibility, Visibility::departments([d, d1, d11]));

        // A department moved under the tree becomes visible
        let late = dept(&engine, &ctx, 0, "late").await;
        assert_ok!(engine.departments.move_to(&ctx, late, d11).await);
        let visibility = assert_ok!(engine.data_scopes.resolve(&ctx, uid).await);
        assert_eq!(visibility, Visibility::departments([d, d1, d11, late]));
    }

    #[tokio::test]
    async fn test_no_data_role_means_own_rows() {
        let engine = Engine::in_memory();
        let ctx = Context::new(1, 1);
        let d = dept(&engine, &ctx, 0, "d").await;
        let uid = user_in(&engine, 1, d).await;
        let resource = assert_ok!(engine.roles.create(&ctx, RoleInput::new("r", "R", RoleType::Resource)).await);
        assert_ok!(engine.roles.assign_roles(&ctx, uid, &[resource.id]).await);

        let visibility = assert_ok!(engine.data_scopes.resolve(&ctx, uid).await);
        assert_eq!(visibility, Visibility::own_rows());

        // A data role without a data permission adds nothing
        let bare = assert_ok!(engine.roles.create(&ctx, RoleInput::new("bare", "Bare", RoleType::Data)).await);
        assert_ok!(engine.roles.assign_roles(&ctx, uid, &[resource.id, bare.id]).await);
        assert_eq!(assert_ok!(engine.data_scopes.resolve(&ctx, uid).await), Visibility::own_rows());

        let other = dept(&engine, &ctx, 0, "other").await;
        let custom = data_role(&engine, &ctx, "custom", DataScope::Custom, vec![other]).await;
        assert_ok!(engine.roles.assign_roles(&ctx, uid, &[bare.id, custom]).await);
        assert_eq!(
            assert_ok!(engine.data_scopes.resolve(&ctx, uid).await),
            Visibility::departments([other])
        );
    }

    #[tokio::test]
    async fn test_roles_compose_by_union() {
        let engine = Engine::in_memory();
        let ctx = Context::new(1, 1);
        let d1 = dept(&engine, &ctx, 0, "d1").await;
        let d2 = dept(&engine, &ctx, 0, "d2").await;
        let own = data_role(&engine, &ctx, "own", DataScope::Dept, vec![]).await;
        let custom = data_role(&engine, &ctx, "custom", DataScope::Custom, vec![d2]).await;
        let me = data_role(&engine, &ctx, "me", DataScope::SelfOnly, vec![]).await;
        let all = data_role(&engine, &ctx, "all", DataScope::All, vec![]).await;
        let uid = user_in(&engine, 1, d1).await;

        assert_ok!(engine.roles.assign_roles(&ctx, uid, &[own, custom, me]).await);
        let visibility = assert_ok!(engine.data_scopes.resolve(&ctx, uid).await);
        assert_eq!(
            visibility,
            Visibility::Restricted {
                depts: BTreeSet::from([d1, d2]),
                own_rows: true,
            }
        );

        assert_ok!(engine.roles.assign_roles(&ctx, uid, &[own, all]).await);
        assert_eq!(assert_ok!(engine.data_scopes.resolve(&ctx, uid).await), Visibility::All);
    }

    #[tokio::test]
    async fn test_remove_falls_back_to_own_rows() {
        let engine = Engine::in_memory();
        let ctx = Context::new(1, 1);
        let d = dept(&engine, &ctx, 0, "d").await;
        let role = data_role(&engine, &ctx, "tenant", DataScope::Tenant, vec![]).await;
        let uid = user_in(&engine, 1, d).await;
        assert_ok!(engine.roles.assign_roles(&ctx, uid, &[role]).await);
        assert_eq!(assert_ok!(engine.data_scopes.resolve(&ctx, uid).await), Visibility::Tenant);

        assert_ok!(engine.data_scopes.remove_data_permission(&ctx, role).await);
        assert!(assert_err!(engine.data_scopes.get_data_permission(&ctx, role).await).is_not_found());
        assert_eq!(assert_ok!(engine.data_scopes.resolve(&ctx, uid).await), Visibility::own_rows());
        // Removing again is harmless
        assert_ok!(engine.data_scopes.remove_data_permission(&ctx, role).await);

        // Re-assigning replaces the single row
        let input = AssignDataPermission {
            role_id: role,
            scope: DataScope::Dept,
            dept_ids: vec![],
        };
        let first = assert_ok!(engine.data_scopes.assign_data_permission(&ctx, input.clone()).await);
        let again = assert_ok!(engine.data_scopes.assign_data_permission(&ctx, input).await);
        assert_eq!(first.id, again.id);
        assert_eq!(assert_ok!(engine.data_scopes.resolve(&ctx, uid).await), Visibility::departments([d]));
    }

    #[tokio::test]
    async fn test_assign_validation() {
        let engine = Engine::in_memory();
        let ctx = Context::new(1, 1);
        let resource = assert_ok!(engine.roles.create(&ctx, RoleInput::new("r", "R", RoleType::Resource)).await);
        let err = assert_err!(
            engine
                .data_scopes
                .assign_data_permission(
                    &ctx,
                    AssignDataPermission {
                        role_id: resource.id,
                        scope: DataScope::All,
                        dept_ids: vec![],
                    },
                )
                .await
        );
        assert!(matches!(err, AppError::Validation(_)));

        let foreign = dept(&engine, &Context::new(2, 1), 0, "x").await;
        let data = assert_ok!(engine.roles.create(&ctx, RoleInput::new("d", "D", RoleType::Data)).await);
        let err = assert_err!(
            engine
                .data_scopes
                .assign_data_permission(
                    &ctx,
                    AssignDataPermission {
                        role_id: data.id,
                        scope: DataScope::Custom,
                        dept_ids: vec![foreign],
                    },
                )
                .await
        );
        assert!(matches!(err, AppError::Validation(_)));

        let err = assert_err!(
            engine
                .data_scopes
                .assign_data_permission(
                    &ctx,
                    AssignDataPermission {
                        role_id: 4040,
                        scope: DataScope::All,
                        dept_ids: vec![],
                    },
                )
                .await
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_filter_lowering() {
        let rows = vec![
            Row { dept_id: 1, owner_id: 10 },
            Row { dept_id: 2, owner_id: 11 },
            Row { dept_id: 3, owner_id: 7 },
        ];
        let visible = |v: &Visibility| -> Vec<i64> {
            let query = v.restrict(Query::new(), DEPT, OWNER, 7);
            query.apply(rows.clone()).items.iter().map(|r| r.dept_id).collect()
        };

        assert_eq!(visible(&Visibility::All), vec![1, 2, 3]);
        assert_eq!(visible(&Visibility::Tenant), vec![1, 2, 3]);
        assert_eq!(visible(&Visibility::departments([2])), vec![2]);
        assert_eq!(visible(&Visibility::own_rows()), vec![3]);
        assert_eq!(
            visible(&Visibility::departments([1]).union(Visibility::own_rows())),
            vec![1, 3]
        );
        assert!(visible(&Visibility::departments(Vec::new())).is_empty());
    }
}
