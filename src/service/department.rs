//! Department hierarchy
//!
//! Departments are tenant scoped rows linked by `parent_id`. Reads go through
//! the cache layer; every command evicts the views it could have changed.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::{check_len, require};
use crate::cache::{keys, CacheLayer, Invalidation};
use crate::config::QueryConfig;
use crate::context::Context;
use crate::entity::department::{self, field, DepartmentTree};
use crate::entity::{now, Status, ROOT_ID};
use crate::error::{AppError, AppResult};
use crate::query::{PageResult, Query};
use crate::repository::DepartmentRepository;
use crate::tree;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateDepartment {
    #[serde(default)]
    pub parent_id: i64,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub sequence: i32,
    #[serde(default)]
    pub leader: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BasicInfo {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub sequence: i32,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactInfo {
    #[serde(default)]
    pub leader: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
}

fn validate_basic(code: &str, name: &str, description: &str) -> AppResult<()> {
    require("code", code)?;
    require("name", name)?;
    check_len("code", code, 64)?;
    check_len("name", name, 64)?;
    check_len("description", description, 1024)
}

fn validate_contact(leader: &str, phone: &str, email: &str) -> AppResult<()> {
    check_len("leader", leader, 64)?;
    check_len("phone", phone, 32)?;
    check_len("email", email, 128)?;
    if !email.is_empty() && !email.contains('@') {
        return Err(AppError::Validation("email is not valid".to_string()));
    }
    Ok(())
}

pub struct DepartmentService {
    repo: Arc<dyn DepartmentRepository>,
    cache: Arc<CacheLayer>,
    limits: QueryConfig,
}

impl DepartmentService {
    pub fn new(
        repo: Arc<dyn DepartmentRepository>,
        cache: Arc<CacheLayer>,
        limits: QueryConfig,
    ) -> Self {
        Self { repo, cache, limits }
    }

    fn scoped(ctx: &Context, query: Query<department::Model>) -> Query<department::Model> {
        match ctx.tenant_scope() {
            Some(tenant_id) => query.filter(field::TENANT_ID.eq(tenant_id)),
            None => query,
        }
    }

    /// Load a row the caller's tenant owns, bypassing the cache
    async fn load(&self, ctx: &Context, id: i64) -> AppResult<department::Model> {
        let dept = ctx.run(self.repo.get_by_id(id)).await?;
        match ctx.tenant_scope() {
            Some(tenant_id) if dept.tenant_id != tenant_id => {
                Err(AppError::NotFound("Department not found".to_string()))
            }
            _ => Ok(dept),
        }
    }

    async fn all(&self, ctx: &Context) -> AppResult<Vec<department::Model>> {
        let query = Self::scoped(ctx, Query::new());
        Ok(ctx.run(self.repo.find(&query)).await?.items)
    }

    async fn ensure_code_free(
        &self,
        ctx: &Context,
        tenant_id: i64,
        code: &str,
        except: Option<i64>,
    ) -> AppResult<()> {
        match ctx.run(self.repo.get_by_code(tenant_id, code)).await? {
            Some(other) if Some(other.id) != except => Err(AppError::Conflict(
                "department code already exists".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn touched(dept: &department::Model) -> Invalidation {
        Invalidation::new()
            .key(keys::department(dept.tenant_id, dept.id))
            .key(keys::department_children(dept.tenant_id, dept.parent_id))
            .prefix(keys::tenant_prefix(keys::DEPARTMENT_TREE, dept.tenant_id))
    }

    fn restructured(dept: &department::Model) -> Invalidation {
        Self::touched(dept).prefix(keys::tenant_prefix(keys::VISIBILITY, dept.tenant_id))
    }

    pub async fn create(&self, ctx: &Context, input: CreateDepartment) -> AppResult<department::Model> {
        validate_basic(&input.code, &input.name, &input.description)?;
        validate_contact(&input.leader, &input.phone, &input.email)?;
        let tenant_id = ctx.tenant_id();
        if input.parent_id != ROOT_ID {
            let parent = ctx.run(self.repo.get_by_id(input.parent_id)).await;
            match parent {
                Ok(p) if p.tenant_id == tenant_id => {}
                Ok(_) | Err(AppError::NotFound(_)) => {
                    return Err(AppError::Validation(
                        "parent department does not exist".to_string(),
                    ))
                }
                Err(e) => return Err(e),
            }
        }
        self.ensure_code_free(ctx, tenant_id, &input.code, None).await?;
        ctx.check()?;

        let ts = now();
        let created = self
            .repo
            .create(department::Model {
                id: 0,
                tenant_id,
                parent_id: input.parent_id,
                code: input.code,
                name: input.name,
                sequence: input.sequence,
                leader: input.leader,
                phone: input.phone,
                email: input.email,
                status: Status::Enabled.into(),
                description: input.description,
                created_at: ts,
                updated_at: ts,
            })
            .await?;
        info!(
            "Department created: id={}, tenant={}, parent={}",
            created.id, created.tenant_id, created.parent_id
        );
        self.cache.invalidate(Self::restructured(&created)).await;
        Ok(created)
    }

    pub async fn update_basic_info(
        &self,
        ctx: &Context,
        id: i64,
        info: BasicInfo,
    ) -> AppResult<department::Model> {
        validate_basic(&info.code, &info.name, &info.description)?;
        let mut dept = self.load(ctx, id).await?;
        if dept.code != info.code {
            self.ensure_code_free(ctx, dept.tenant_id, &info.code, Some(id))
                .await?;
        }
        ctx.check()?;

        dept.code = info.code;
        dept.name = info.name;
        dept.sequence = info.sequence;
        dept.description = info.description;
        dept.updated_at = now();
        let updated = self.repo.update(dept).await?;
        self.cache.invalidate(Self::touched(&updated)).await;
        Ok(updated)
    }

    pub async fn update_contact_info(
        &self,
        ctx: &Context,
        id: i64,
        contact: ContactInfo,
    ) -> AppResult<department::Model> {
        validate_contact(&contact.leader, &contact.phone, &contact.email)?;
        let mut dept = self.load(ctx, id).await?;
        ctx.check()?;

        dept.leader = contact.leader;
        dept.phone = contact.phone;
        dept.email = contact.email;
        dept.updated_at = now();
        let updated = self.repo.update(dept).await?;
        self.cache.invalidate(Self::touched(&updated)).await;
        Ok(updated)
    }

    pub async fn update_status(
        &self,
        ctx: &Context,
        id: i64,
        status: Status,
    ) -> AppResult<department::Model> {
        let mut dept = self.load(ctx, id).await?;
        ctx.check()?;

        dept.status = status.into();
        dept.updated_at = now();
        let updated = self.repo.update(dept).await?;
        info!("Department {} status set to {:?}", id, status);
        self.cache.invalidate(Self::touched(&updated)).await;
        Ok(updated)
    }

    /// Reparent `id` under `target` (`0` makes it a root)
    pub async fn move_to(&self, ctx: &Context, id: i64, target: i64) -> AppResult<department::Model> {
        if target == id {
            return Err(AppError::InvalidOperation(
                "cannot move a department under itself".to_string(),
            ));
        }
        let mut dept = self.load(ctx, id).await?;
        if target != ROOT_ID {
            let tenant_rows = Query::new().filter(field::TENANT_ID.eq(dept.tenant_id));
            let rows = ctx.run(self.repo.find(&tenant_rows)).await?.items;
            let parents: HashMap<i64, i64> = rows.iter().map(|d| (d.id, d.parent_id)).collect();
            if !parents.contains_key(&target) {
                return Err(AppError::Validation(
                    "target department does not exist".to_string(),
                ));
            }
            if tree::ancestry_contains(&parents, target, id) {
                return Err(AppError::InvalidOperation(
                    "cannot move a department under its own descendant".to_string(),
                ));
            }
        }
        if dept.parent_id == target {
            return Ok(dept);
        }
        ctx.check()?;

        let old_parent = dept.parent_id;
        dept.parent_id = target;
        dept.updated_at = now();
        let moved = self.repo.update(dept).await?;
        info!("Department {} moved from {} to {}", id, old_parent, target);
        let invalidation = Self::restructured(&moved)
            .key(keys::department_children(moved.tenant_id, old_parent));
        self.cache.invalidate(invalidation).await;
        Ok(moved)
    }

    /// Delete a department without children
    pub async fn delete(&self, ctx: &Context, id: i64) -> AppResult<()> {
        let dept = self.load(ctx, id).await?;
        let children = Query::new()
            .filter(field::TENANT_ID.eq(dept.tenant_id))
            .filter(field::PARENT_ID.eq(id));
        if ctx.run(self.repo.count(&children)).await? > 0 {
            return Err(AppError::InvalidOperation(
                "department has children".to_string(),
            ));
        }
        ctx.check()?;

        self.repo.delete(id).await?;
        info!("Department deleted: id={}, tenant={}", id, dept.tenant_id);
        self.cache.invalidate(Self::restructured(&dept)).await;
        Ok(())
    }

    pub async fn get_by_id(&self, ctx: &Context, id: i64) -> AppResult<department::Model> {
        let key = keys::department(ctx.tenant_id(), id);
        self.cache.cached(ctx, &key, || self.load(ctx, id)).await
    }

    /// `None` returns the whole forest, `Some(p)` the one-node forest rooted at `p`
    pub async fn get_tree(&self, ctx: &Context, parent_id: Option<i64>) -> AppResult<Vec<DepartmentTree>> {
        let root = parent_id.filter(|p| *p != ROOT_ID);
        let key = match root {
            Some(p) => keys::department_subtree(ctx.tenant_id(), p),
            None => keys::department_tree(ctx.tenant_id()),
        };
        self.cache
            .cached(ctx, &key, || async {
                let nodes: Vec<DepartmentTree> =
                    self.all(ctx).await?.into_iter().map(DepartmentTree::from).collect();
                match root {
                    Some(p) => {
                        let forest = tree::build_subtree(nodes, p);
                        if forest.is_empty() {
                            return Err(AppError::NotFound("Department not found".to_string()));
                        }
                        Ok(forest)
                    }
                    None => Ok(tree::build_forest(nodes)),
                }
            })
            .await
    }

    /// Direct children ordered by `(sequence, id)`
    pub async fn children(&self, ctx: &Context, parent_id: i64) -> AppResult<Vec<department::Model>> {
        let key = keys::department_children(ctx.tenant_id(), parent_id);
        self.cache
            .cached(ctx, &key, || async {
                let query = Self::scoped(ctx, Query::new())
                    .filter(field::PARENT_ID.eq(parent_id))
                    .order_by(field::SEQUENCE.asc())
                    .order_by(field::ID.asc());
                Ok(ctx.run(self.repo.find(&query)).await?.items)
            })
            .await
    }

    pub async fn list(
        &self,
        ctx: &Context,
        query: Query<department::Model>,
    ) -> AppResult<PageResult<department::Model>> {
        let query = Self::scoped(ctx, query).clamped(&self.limits);
        ctx.run(self.repo.find(&query)).await
    }

    /// Every descendant of `id`, excluding `id`
    pub async fn descendant_ids(&self, ctx: &Context, id: i64) -> AppResult<Vec<i64>> {
        let edges: Vec<(i64, i64)> = self
            .all(ctx)
            .await?
            .iter()
            .map(|d| (d.id, d.parent_id))
            .collect();
        Ok(tree::descendant_ids(&edges, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::repository::MemoryRepository;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn service() -> DepartmentService {
        let cache = CacheLayer::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        DepartmentService::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(cache),
            QueryConfig::default(),
        )
    }

    fn input(parent_id: i64, code: &str, sequence: i32) -> CreateDepartment {
        CreateDepartment {
            parent_id,
            code: code.to_string(),
            name: code.to_uppercase(),
            sequence,
            ..Default::default()
        }
    }

    fn collect_ids(forest: &[DepartmentTree]) -> Vec<i64> {
        let mut ids = Vec::new();
        tree::walk(forest, &mut |n: &DepartmentTree, _| ids.push(n.id));
        ids
    }

    #[tokio::test]
    async fn test_create_tree_delete_scenario() {
        let svc = service();
        let ctx = Context::new(1, 1);
        let a = assert_ok!(svc.create(&ctx, input(0, "a", 1)).await);
        let b = assert_ok!(svc.create(&ctx, input(a.id, "b", 1)).await);

        let forest = assert_ok!(svc.get_tree(&ctx, None).await);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].id, a.id);
        assert_eq!(forest[0].children.len(), 1);
        assert_eq!(forest[0].children[0].id, b.id);

        let err = assert_err!(svc.delete(&ctx, a.id).await);
        assert!(matches!(err, AppError::InvalidOperation(_)));

        assert_ok!(svc.delete(&ctx, b.id).await);
        assert_ok!(svc.delete(&ctx, a.id).await);
        assert!(assert_ok!(svc.get_tree(&ctx, None).await).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_code_conflicts() {
        let svc = service();
        let ctx = Context::new(1, 1);
        assert_ok!(svc.create(&ctx, input(0, "sales", 1)).await);
        let err = assert_err!(svc.create(&ctx, input(0, "sales", 2)).await);
        assert_eq!(err.public_message(), "department code already exists");

        // Other tenants may reuse it
        assert_ok!(svc.create(&Context::new(2, 1), input(0, "sales", 1)).await);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let svc = service();
        let ctx = Context::new(1, 1);
        let err = assert_err!(svc.create(&ctx, input(0, "", 1)).await);
        assert!(matches!(err, AppError::Validation(_)));
        let err = assert_err!(svc.create(&ctx, input(0, &"x".repeat(65), 1)).await);
        assert!(matches!(err, AppError::Validation(_)));
        let err = assert_err!(svc.create(&ctx, input(999, "orphan", 1)).await);
        assert!(matches!(err, AppError::Validation(_)));

        // A parent from another tenant is as good as missing
        let foreign = assert_ok!(svc.create(&Context::new(2, 1), input(0, "f", 1)).await);
        let err = assert_err!(svc.create(&ctx, input(foreign.id, "x", 1)).await);
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_move_rejects_self_and_descendants() {
        let svc = service();
        let ctx = Context::new(1, 1);
        let d = assert_ok!(svc.create(&ctx, input(0, "d", 1)).await);
        let d1 = assert_ok!(svc.create(&ctx, input(d.id, "d1", 1)).await);
        let d11 = assert_ok!(svc.create(&ctx, input(d1.id, "d11", 1)).await);
        let other = assert_ok!(svc.create(&ctx, input(0, "other", 2)).await);

        for target in [d.id, d1.id, d11.id] {
            let err = assert_err!(svc.move_to(&ctx, d.id, target).await);
            assert!(matches!(err, AppError::InvalidOperation(_)));
        }

        assert_ok!(svc.move_to(&ctx, d.id, other.id).await);
        assert_eq!(assert_ok!(svc.get_by_id(&ctx, d.id).await).parent_id, other.id);

        // The subtree moves along
        let forest = assert_ok!(svc.get_tree(&ctx, None).await);
        assert_eq!(forest.len(), 1);
        assert_eq!(collect_ids(&forest), vec![other.id, d.id, d1.id, d11.id]);

        assert_ok!(svc.move_to(&ctx, d1.id, ROOT_ID).await);
        assert_eq!(assert_ok!(svc.get_by_id(&ctx, d1.id).await).parent_id, ROOT_ID);
    }

    #[tokio::test]
    async fn test_random_moves_keep_forest_acyclic() {
        let svc = service();
        let ctx = Context::new(1, 1);
        let mut ids = Vec::new();
        for i in 0..12 {
            let parent = if i == 0 { 0 } else { ids[(i * 7) % ids.len()] };
            let dept = assert_ok!(svc.create(&ctx, input(parent, &format!("n{}", i), i as i32)).await);
            ids.push(dept.id);
        }

        // Deterministic pseudo-random walk of move attempts
        let mut seed: u64 = 42;
        for _ in 0..200 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let id = ids[(seed >> 33) as usize % ids.len()];
            let target = match (seed >> 13) as usize % (ids.len() + 1) {
                n if n == ids.len() => ROOT_ID,
                n => ids[n],
            };
            match svc.move_to(&ctx, id, target).await {
                Ok(moved) => assert_eq!(moved.parent_id, target),
                Err(e) => assert!(matches!(e, AppError::InvalidOperation(_))),
            }

            let forest = assert_ok!(svc.get_tree(&ctx, None).await);
            let seen = collect_ids(&forest);
            let unique: HashSet<i64> = seen.iter().copied().collect();
            assert_eq!(seen.len(), unique.len());
            assert_eq!(seen.len(), ids.len());
        }
    }

    #[tokio::test]
    async fn test_tree_ordering_and_subtree() {
        let svc = service();
        let ctx = Context::new(1, 1);
        let root = assert_ok!(svc.create(&ctx, input(0, "root", 1)).await);
        let late = assert_ok!(svc.create(&ctx, input(root.id, "late", 2)).await);
        let early = assert_ok!(svc.create(&ctx, input(root.id, "early", 1)).await);
        let tie = assert_ok!(svc.create(&ctx, input(root.id, "tie", 1)).await);

        let forest = assert_ok!(svc.get_tree(&ctx, Some(root.id)).await);
        assert_eq!(forest.len(), 1);
        let kids: Vec<i64> = forest[0].children.iter().map(|c| c.id).collect();
        assert_eq!(kids, vec![early.id, tie.id, late.id]);

        let children = assert_ok!(svc.children(&ctx, root.id).await);
        let kids: Vec<i64> = children.iter().map(|c| c.id).collect();
        assert_eq!(kids, vec![early.id, tie.id, late.id]);

        let err = assert_err!(svc.get_tree(&ctx, Some(9999)).await);
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cached_views_follow_writes() {
        let svc = service();
        let ctx = Context::new(1, 1);
        let a = assert_ok!(svc.create(&ctx, input(0, "a", 1)).await);
        let b = assert_ok!(svc.create(&ctx, input(0, "b", 2)).await);

        // Populate every view, then mutate
        assert_ok!(svc.get_by_id(&ctx, b.id).await);
        assert_eq!(assert_ok!(svc.get_tree(&ctx, None).await).len(), 2);
        assert!(assert_ok!(svc.children(&ctx, a.id).await).is_empty());
        assert_eq!(assert_ok!(svc.children(&ctx, ROOT_ID).await).len(), 2);

        assert_ok!(svc.move_to(&ctx, b.id, a.id).await);
        assert_eq!(assert_ok!(svc.get_by_id(&ctx, b.id).await).parent_id, a.id);
        assert_eq!(assert_ok!(svc.get_tree(&ctx, None).await).len(), 1);
        assert_eq!(assert_ok!(svc.children(&ctx, a.id).await).len(), 1);
        assert_eq!(assert_ok!(svc.children(&ctx, ROOT_ID).await).len(), 1);

        let info = BasicInfo {
            code: "b".to_string(),
            name: "Bravo".to_string(),
            sequence: 5,
            description: String::new(),
        };
        assert_ok!(svc.update_basic_info(&ctx, b.id, info).await);
        assert_eq!(assert_ok!(svc.get_by_id(&ctx, b.id).await).name, "Bravo");

        let contact = ContactInfo {
            leader: "Kim".to_string(),
            phone: "555".to_string(),
            email: "kim@example.com".to_string(),
        };
        assert_ok!(svc.update_contact_info(&ctx, b.id, contact).await);
        assert_eq!(assert_ok!(svc.get_by_id(&ctx, b.id).await).leader, "Kim");

        assert_ok!(svc.update_status(&ctx, b.id, Status::Disabled).await);
        let forest = assert_ok!(svc.get_tree(&ctx, None).await);
        assert_eq!(forest[0].children[0].status, i32::from(Status::Disabled));
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let svc = service();
        let t1 = Context::new(1, 1);
        let t2 = Context::new(2, 1);
        let a = assert_ok!(svc.create(&t1, input(0, "a", 1)).await);

        assert!(assert_err!(svc.get_by_id(&t2, a.id).await).is_not_found());
        assert!(assert_err!(svc.delete(&t2, a.id).await).is_not_found());
        assert!(assert_ok!(svc.get_tree(&t2, None).await).is_empty());

        let admin = Context::new(2, 1).ignoring_tenant();
        assert_eq!(assert_ok!(svc.get_by_id(&admin, a.id).await).id, a.id);
    }

    #[tokio::test]
    async fn test_list_and_descendants() {
        let svc = service();
        let ctx = Context::new(1, 1);
        let d = assert_ok!(svc.create(&ctx, input(0, "d", 1)).await);
        let d1 = assert_ok!(svc.create(&ctx, input(d.id, "d1", 1)).await);
        let d11 = assert_ok!(svc.create(&ctx, input(d1.id, "d11", 1)).await);
        assert_ok!(svc.create(&Context::new(2, 1), input(0, "x", 1)).await);

        let mut desc = assert_ok!(svc.descendant_ids(&ctx, d.id).await);
        desc.sort();
        assert_eq!(desc, vec![d1.id, d11.id]);

        let query = Query::new()
            .filter(field::CODE.like("d%"))
            .order_by(field::ID.desc())
            .page(crate::query::Page::new(0, 2));
        let page = assert_ok!(svc.list(&ctx, query).await);
        assert_eq!(page.total, 3);
        let ids: Vec<i64> = page.items.iter().map(|x| x.id).collect();
        assert_eq!(ids, vec![d11.id, d1.id]);
    }
}
