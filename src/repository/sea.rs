//! Relational repositories on SeaORM

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, NotSet,
    PaginatorTrait, QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};

use super::{
    DataPermissionRepository, DepartmentRepository, PathRewrite, PermissionRepository,
    RoleRepository, UserRepository,
};
use crate::entity::permission_resource::{self, Resource};
use crate::entity::{
    data_permission, department, now, permission, role, role_permission, user, user_role,
};
use crate::error::{AppError, AppResult, OptionExt};
use crate::query::{PageResult, Query};

#[derive(Clone)]
pub struct SeaRepository {
    db: DatabaseConnection,
}

impl SeaRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn store_err(op: &'static str) -> impl Fn(DbErr) -> AppError {
    move |err| {
        let sql = err.sql_err();
        classify(op, err, sql)
    }
}

/// Unique-key violations surface as `Conflict`, everything else as a store failure
fn classify(op: &str, err: DbErr, sql: Option<SqlErr>) -> AppError {
    if let Some(SqlErr::UniqueConstraintViolation(detail)) = sql {
        tracing::warn!("{} rejected by unique key: {}", op, detail);
        return AppError::Conflict(format!("{}: record already exists", op));
    }
    tracing::error!("{} failed: {}", op, err);
    AppError::Database(err).context(op)
}

fn update_err(op: &'static str, what: &'static str) -> impl Fn(DbErr) -> AppError {
    move |err| match err {
        DbErr::RecordNotUpdated => AppError::NotFound(format!("{} not found", what)),
        err => store_err(op)(err),
    }
}

fn department_active(m: department::Model) -> department::ActiveModel {
    department::ActiveModel {
        id: Set(m.id),
        tenant_id: Set(m.tenant_id),
        parent_id: Set(m.parent_id),
        code: Set(m.code),
        name: Set(m.name),
        sequence: Set(m.sequence),
        leader: Set(m.leader),
        phone: Set(m.phone),
        email: Set(m.email),
        status: Set(m.status),
        description: Set(m.description),
        created_at: Set(m.created_at),
        updated_at: Set(m.updated_at),
    }
}

fn permission_active(m: permission::Model) -> permission::ActiveModel {
    permission::ActiveModel {
        id: Set(m.id),
        code: Set(m.code),
        name: Set(m.name),
        localize: Set(m.localize),
        icon: Set(m.icon),
        sequence: Set(m.sequence),
        perm_type: Set(m.perm_type),
        path: Set(m.path),
        properties: Set(m.properties),
        status: Set(m.status),
        parent_id: Set(m.parent_id),
        parent_path: Set(m.parent_path),
        created_at: Set(m.created_at),
        updated_at: Set(m.updated_at),
    }
}

fn role_active(m: role::Model) -> role::ActiveModel {
    role::ActiveModel {
        id: Set(m.id),
        tenant_id: Set(m.tenant_id),
        code: Set(m.code),
        name: Set(m.name),
        role_type: Set(m.role_type),
        localize: Set(m.localize),
        description: Set(m.description),
        sequence: Set(m.sequence),
        status: Set(m.status),
        created_at: Set(m.created_at),
        updated_at: Set(m.updated_at),
    }
}

fn resource_active(permission_id: i64, res: Resource) -> permission_resource::ActiveModel {
    permission_resource::ActiveModel {
        id: NotSet,
        permission_id: Set(permission_id),
        method: Set(res.method),
        path: Set(res.path),
    }
}

#[async_trait]
impl DepartmentRepository for SeaRepository {
    async fn create(&self, model: department::Model) -> AppResult<department::Model> {
        let mut active = department_active(model);
        active.id = NotSet;
        active
            .insert(&self.db)
            .await
            .map_err(store_err("insert department"))
    }

    async fn update(&self, model: department::Model) -> AppResult<department::Model> {
        department_active(model)
            .update(&self.db)
            .await
            .map_err(update_err("update department", "Department"))
    }

    async fn delete(&self, id: i64) -> AppResult<()> {
        let res = department::Entity::delete_by_id(id)
            .exec(&self.db)
            .await
            .map_err(store_err("delete department"))?;
        if res.rows_affected == 0 {
            return Err(AppError::NotFound("Department not found".to_string()));
        }
        Ok(())
    }

    async fn get_by_id(&self, id: i64) -> AppResult<department::Model> {
        department::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(store_err("get department"))?
            .ok_or_not_found("Department not found")
    }

    async fn get_by_code(&self, tenant_id: i64, code: &str) -> AppResult<Option<department::Model>> {
        department::Entity::find()
            .filter(department::Column::TenantId.eq(tenant_id))
            .filter(department::Column::Code.eq(code))
            .one(&self.db)
            .await
            .map_err(store_err("get department by code"))
    }

    async fn find(&self, query: &Query<department::Model>) -> AppResult<PageResult<department::Model>> {
        let mut select = query.lower(department::Entity::find())?;
        if !query.has_sort() {
            select = select.order_by_asc(department::Column::Id);
        }
        let items = select
            .all(&self.db)
            .await
            .map_err(store_err("find departments"))?;
        let total = match query.page_spec() {
            Some(_) => DepartmentRepository::count(self, query).await?,
            None => items.len() as u64,
        };
        Ok(PageResult { items, total })
    }

    async fn count(&self, query: &Query<department::Model>) -> AppResult<u64> {
        query
            .filter_select(department::Entity::find())?
            .count(&self.db)
            .await
            .map_err(store_err("count departments"))
    }
}

#[async_trait]
impl PermissionRepository for SeaRepository {
    async fn create(
        &self,
        model: permission::Model,
        resources: Vec<Resource>,
    ) -> AppResult<permission::Model> {
        let txn = self.db.begin().await.map_err(store_err("begin"))?;
        let mut active = permission_active(model);
        active.id = NotSet;
        let created = active
            .insert(&txn)
            .await
            .map_err(store_err("insert permission"))?;
        for res in resources {
            resource_active(created.id, res)
                .insert(&txn)
                .await
                .map_err(store_err("insert permission resource"))?;
        }
        txn.commit().await.map_err(store_err("commit"))?;
        Ok(created)
    }

    async fn update(
        &self,
        model: permission::Model,
        resources: Option<Vec<Resource>>,
        rewrite: Option<PathRewrite>,
    ) -> AppResult<permission::Model> {
        let txn = self.db.begin().await.map_err(store_err("begin"))?;
        let updated = permission_active(model)
            .update(&txn)
            .await
            .map_err(update_err("update permission", "Permission"))?;

        if let Some(resources) = resources {
            permission_resource::Entity::delete_many()
                .filter(permission_resource::Column::PermissionId.eq(updated.id))
                .exec(&txn)
                .await
                .map_err(store_err("delete permission resources"))?;
            for res in resources {
                resource_active(updated.id, res)
                    .insert(&txn)
                    .await
                    .map_err(store_err("insert permission resource"))?;
            }
        }

        if let Some(rewrite) = rewrite {
            let nodes = permission::Entity::find()
                .filter(permission::Column::ParentPath.starts_with(&rewrite.from))
                .all(&txn)
                .await
                .map_err(store_err("find permission subtree"))?;
            let ts = now();
            for node in nodes {
                if let Some(path) = rewrite.apply(&node.parent_path) {
                    permission::ActiveModel {
                        id: Set(node.id),
                        parent_path: Set(path),
                        updated_at: Set(ts),
                        ..Default::default()
                    }
                    .update(&txn)
                    .await
                    .map_err(store_err("rewrite permission path"))?;
                }
            }
        }

        txn.commit().await.map_err(store_err("commit"))?;
        Ok(updated)
    }

    async fn delete_many(&self, ids: &[i64]) -> AppResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin().await.map_err(store_err("begin"))?;
        role_permission::Entity::delete_many()
            .filter(role_permission::Column::PermissionId.is_in(ids.to_vec()))
            .exec(&txn)
            .await
            .map_err(store_err("delete permission bindings"))?;
        permission_resource::Entity::delete_many()
            .filter(permission_resource::Column::PermissionId.is_in(ids.to_vec()))
            .exec(&txn)
            .await
            .map_err(store_err("delete permission resources"))?;
        let res = permission::Entity::delete_many()
            .filter(permission::Column::Id.is_in(ids.to_vec()))
            .exec(&txn)
            .await
            .map_err(store_err("delete permissions"))?;
        txn.commit().await.map_err(store_err("commit"))?;
        Ok(res.rows_affected)
    }

    async fn get_by_id(&self, id: i64) -> AppResult<permission::Model> {
        permission::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(store_err("get permission"))?
            .ok_or_not_found("Permission not found")
    }

    async fn find(&self, query: &Query<permission::Model>) -> AppResult<PageResult<permission::Model>> {
        let mut select = query.lower(permission::Entity::find())?;
        if !query.has_sort() {
            select = select.order_by_asc(permission::Column::Id);
        }
        let items = select
            .all(&self.db)
            .await
            .map_err(store_err("find permissions"))?;
        let total = match query.page_spec() {
            Some(_) => PermissionRepository::count(self, query).await?,
            None => items.len() as u64,
        };
        Ok(PageResult { items, total })
    }

    async fn count(&self, query: &Query<permission::Model>) -> AppResult<u64> {
        query
            .filter_select(permission::Entity::find())?
            .count(&self.db)
            .await
            .map_err(store_err("count permissions"))
    }

    async fn existing_ids(&self, ids: &[i64]) -> AppResult<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = permission::Entity::find()
            .filter(permission::Column::Id.is_in(ids.to_vec()))
            .all(&self.db)
            .await
            .map_err(store_err("find permissions by id"))?;
        Ok(rows.into_iter().map(|p| p.id).collect())
    }

    async fn resources_by_permissions(
        &self,
        ids: &[i64],
    ) -> AppResult<Vec<permission_resource::Model>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        permission_resource::Entity::find()
            .filter(permission_resource::Column::PermissionId.is_in(ids.to_vec()))
            .order_by_asc(permission_resource::Column::Id)
            .all(&self.db)
            .await
            .map_err(store_err("find permission resources"))
    }
}

#[async_trait]
impl RoleRepository for SeaRepository {
    async fn create(&self, model: role::Model) -> AppResult<role::Model> {
        let mut active = role_active(model);
        active.id = NotSet;
        active.insert(&self.db).await.map_err(store_err("insert role"))
    }

    async fn update(&self, model: role::Model) -> AppResult<role::Model> {
        role_active(model)
            .update(&self.db)
            .await
            .map_err(update_err("update role", "Role"))
    }

    async fn delete(&self, id: i64) -> AppResult<()> {
        let txn = self.db.begin().await.map_err(store_err("begin"))?;
        role_permission::Entity::delete_many()
            .filter(role_permission::Column::RoleId.eq(id))
            .exec(&txn)
            .await
            .map_err(store_err("delete role permissions"))?;
        data_permission::Entity::delete_many()
            .filter(data_permission::Column::RoleId.eq(id))
            .exec(&txn)
            .await
            .map_err(store_err("delete role data permission"))?;
        user_role::Entity::delete_many()
            .filter(user_role::Column::RoleId.eq(id))
            .exec(&txn)
            .await
            .map_err(store_err("delete role bindings"))?;
        let res = role::Entity::delete_by_id(id)
            .exec(&txn)
            .await
            .map_err(store_err("delete role"))?;
        if res.rows_affected == 0 {
            // Dropping the transaction rolls it back
            return Err(AppError::NotFound("Role not found".to_string()));
        }
        txn.commit().await.map_err(store_err("commit"))
    }

    async fn get_by_id(&self, id: i64) -> AppResult<role::Model> {
        role::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(store_err("get role"))?
            .ok_or_not_found("Role not found")
    }

    async fn get_by_code(&self, tenant_id: i64, code: &str) -> AppResult<Option<role::Model>> {
        role::Entity::find()
            .filter(role::Column::TenantId.eq(tenant_id))
            .filter(role::Column::Code.eq(code))
            .one(&self.db)
            .await
            .map_err(store_err("get role by code"))
    }

    async fn find(&self, query: &Query<role::Model>) -> AppResult<PageResult<role::Model>> {
        let mut select = query.lower(role::Entity::find())?;
        if !query.has_sort() {
            select = select.order_by_asc(role::Column::Id);
        }
        let items = select.all(&self.db).await.map_err(store_err("find roles"))?;
        let total = match query.page_spec() {
            Some(_) => RoleRepository::count(self, query).await?,
            None => items.len() as u64,
        };
        Ok(PageResult { items, total })
    }

    async fn count(&self, query: &Query<role::Model>) -> AppResult<u64> {
        query
            .filter_select(role::Entity::find())?
            .count(&self.db)
            .await
            .map_err(store_err("count roles"))
    }

    async fn permission_ids_by_role(&self, role_id: i64) -> AppResult<Vec<i64>> {
        let rows = role_permission::Entity::find()
            .filter(role_permission::Column::RoleId.eq(role_id))
            .order_by_asc(role_permission::Column::Id)
            .all(&self.db)
            .await
            .map_err(store_err("find role permissions"))?;
        Ok(rows.into_iter().map(|rp| rp.permission_id).collect())
    }

    async fn replace_permissions(
        &self,
        tenant_id: i64,
        role_id: i64,
        permission_ids: &[i64],
    ) -> AppResult<()> {
        let txn = self.db.begin().await.map_err(store_err("begin"))?;
        role_permission::Entity::delete_many()
            .filter(role_permission::Column::RoleId.eq(role_id))
            .exec(&txn)
            .await
            .map_err(store_err("delete role permissions"))?;
        if !permission_ids.is_empty() {
            let rows = permission_ids.iter().map(|pid| role_permission::ActiveModel {
                id: NotSet,
                tenant_id: Set(tenant_id),
                role_id: Set(role_id),
                permission_id: Set(*pid),
            });
            role_permission::Entity::insert_many(rows)
                .exec(&txn)
                .await
                .map_err(store_err("insert role permissions"))?;
        }
        txn.commit().await.map_err(store_err("commit"))
    }

    async fn permission_bindings(
        &self,
        tenant_id: Option<i64>,
    ) -> AppResult<Vec<role_permission::Model>> {
        let mut select = role_permission::Entity::find();
        if let Some(tenant_id) = tenant_id {
            select = select.filter(role_permission::Column::TenantId.eq(tenant_id));
        }
        select
            .order_by_asc(role_permission::Column::Id)
            .all(&self.db)
            .await
            .map_err(store_err("find role permissions"))
    }
}

#[async_trait]
impl DataPermissionRepository for SeaRepository {
    async fn get_by_role(&self, role_id: i64) -> AppResult<data_permission::Model> {
        data_permission::Entity::find()
            .filter(data_permission::Column::RoleId.eq(role_id))
            .one(&self.db)
            .await
            .map_err(store_err("get data permission"))?
            .ok_or_not_found("Data permission not found")
    }

    async fn upsert(&self, model: data_permission::Model) -> AppResult<data_permission::Model> {
        let txn = self.db.begin().await.map_err(store_err("begin"))?;
        let existing = data_permission::Entity::find()
            .filter(data_permission::Column::RoleId.eq(model.role_id))
            .one(&txn)
            .await
            .map_err(store_err("get data permission"))?;
        let saved = match existing {
            Some(current) => data_permission::ActiveModel {
                id: Set(current.id),
                tenant_id: Set(model.tenant_id),
                role_id: Set(model.role_id),
                scope: Set(model.scope),
                dept_ids: Set(model.dept_ids),
                created_at: Set(current.created_at),
                updated_at: Set(model.updated_at),
            }
            .update(&txn)
            .await
            .map_err(store_err("update data permission"))?,
            None => data_permission::ActiveModel {
                id: NotSet,
                tenant_id: Set(model.tenant_id),
                role_id: Set(model.role_id),
                scope: Set(model.scope),
                dept_ids: Set(model.dept_ids),
                created_at: Set(model.created_at),
                updated_at: Set(model.updated_at),
            }
            .insert(&txn)
            .await
            .map_err(store_err("insert data permission"))?,
        };
        txn.commit().await.map_err(store_err("commit"))?;
        Ok(saved)
    }

    async fn delete_by_role(&self, role_id: i64) -> AppResult<bool> {
        let res = data_permission::Entity::delete_many()
            .filter(data_permission::Column::RoleId.eq(role_id))
            .exec(&self.db)
            .await
            .map_err(store_err("delete data permission"))?;
        Ok(res.rows_affected > 0)
    }
}

#[async_trait]
impl UserRepository for SeaRepository {
    async fn create(&self, model: user::Model) -> AppResult<user::Model> {
        user::ActiveModel {
            id: NotSet,
            tenant_id: Set(model.tenant_id),
            username: Set(model.username),
            department_id: Set(model.department_id),
            status: Set(model.status),
        }
        .insert(&self.db)
        .await
        .map_err(store_err("insert user"))
    }

    async fn get_by_id(&self, id: i64) -> AppResult<user::Model> {
        user::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(store_err("get user"))?
            .ok_or_not_found("User not found")
    }

    async fn role_ids_by_user(&self, user_id: i64) -> AppResult<Vec<i64>> {
        let rows = user_role::Entity::find()
            .filter(user_role::Column::UserId.eq(user_id))
            .order_by_asc(user_role::Column::Id)
            .all(&self.db)
            .await
            .map_err(store_err("find user roles"))?;
        Ok(rows.into_iter().map(|ur| ur.role_id).collect())
    }

    async fn replace_roles(&self, tenant_id: i64, user_id: i64, role_ids: &[i64]) -> AppResult<()> {
        let txn = self.db.begin().await.map_err(store_err("begin"))?;
        user_role::Entity::delete_many()
            .filter(user_role::Column::UserId.eq(user_id))
            .exec(&txn)
            .await
            .map_err(store_err("delete user roles"))?;
        if !role_ids.is_empty() {
            let rows = role_ids.iter().map(|rid| user_role::ActiveModel {
                id: NotSet,
                tenant_id: Set(tenant_id),
                user_id: Set(user_id),
                role_id: Set(*rid),
            });
            user_role::Entity::insert_many(rows)
                .exec(&txn)
                .await
                .map_err(store_err("insert user roles"))?;
        }
        txn.commit().await.map_err(store_err("commit"))
    }

    async fn role_bindings(&self, tenant_id: Option<i64>) -> AppResult<Vec<user_role::Model>> {
        let mut select = user_role::Entity::find();
        if let Some(tenant_id) = tenant_id {
            select = select.filter(user_role::Column::TenantId.eq(tenant_id));
        }
        select
            .order_by_asc(user_role::Column::Id)
            .all(&self.db)
            .await
            .map_err(store_err("find user roles"))
    }
}
