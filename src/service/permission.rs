//! Permission tree builder and permission commands
//!
//! Permissions are global menu / page / button nodes. `parent_path` holds
//! the ancestor ids of each node so subtrees can be selected with a prefix
//! match instead of a recursive walk.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;

use super::{check_len, require};
use crate::cache::{keys, CacheLayer, Invalidation};
use crate::config::QueryConfig;
use crate::context::Context;
use crate::enforcer::ApiEnforcer;
use crate::entity::permission::{self, child_path, field, PermissionType};
use crate::entity::permission_resource::{self, Resource};
use crate::entity::{now, Status, ROOT_ID};
use crate::error::{AppError, AppResult};
use crate::query::{PageResult, Query};
use crate::repository::{PathRewrite, PermissionRepository};
use crate::tree::{self, TreeNode};

/// Full permission node with its API resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionTree {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub localize: String,
    pub icon: String,
    pub sequence: i32,
    #[serde(rename = "type")]
    pub perm_type: String,
    pub path: String,
    pub properties: serde_json::Value,
    pub status: i32,
    pub parent_id: i64,
    pub parent_path: String,
    pub resources: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<PermissionTree>,
}

impl PermissionTree {
    fn new(model: permission::Model, resources: Vec<Resource>) -> Self {
        let properties = if model.properties.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&model.properties).unwrap_or(serde_json::Value::Null)
        };
        Self {
            id: model.id,
            code: model.code,
            name: model.name,
            localize: model.localize,
            icon: model.icon,
            sequence: model.sequence,
            perm_type: model.perm_type,
            path: model.path,
            properties,
            status: model.status,
            parent_id: model.parent_id,
            parent_path: model.parent_path,
            resources,
            children: Vec::new(),
        }
    }
}

impl TreeNode for PermissionTree {
    fn id(&self) -> i64 {
        self.id
    }

    fn parent_id(&self) -> i64 {
        self.parent_id
    }

    fn sequence(&self) -> i32 {
        self.sequence
    }

    fn children(&self) -> &[Self] {
        &self.children
    }

    fn set_children(&mut self, children: Vec<Self>) {
        self.children = children;
    }
}

/// Slim node for menu rendering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuNode {
    pub id: i64,
    pub parent_id: i64,
    pub code: String,
    pub name: String,
    pub localize: String,
    pub icon: String,
    pub path: String,
    #[serde(rename = "type")]
    pub perm_type: String,
    pub sequence: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MenuNode>,
}

impl From<permission::Model> for MenuNode {
    fn from(model: permission::Model) -> Self {
        Self {
            id: model.id,
            parent_id: model.parent_id,
            code: model.code,
            name: model.name,
            localize: model.localize,
            icon: model.icon,
            path: model.path,
            perm_type: model.perm_type,
            sequence: model.sequence,
            children: Vec::new(),
        }
    }
}

impl TreeNode for MenuNode {
    fn id(&self) -> i64 {
        self.id
    }

    fn parent_id(&self) -> i64 {
        self.parent_id
    }

    fn sequence(&self) -> i32 {
        self.sequence
    }

    fn children(&self) -> &[Self] {
        &self.children
    }

    fn set_children(&mut self, children: Vec<Self>) {
        self.children = children;
    }
}

/// Build the full permission forest. Nodes whose parent is not in `rows`
/// are dropped.
pub fn build_permission_tree(
    rows: Vec<permission::Model>,
    resources: Vec<permission_resource::Model>,
) -> Vec<PermissionTree> {
    let mut by_permission: HashMap<i64, Vec<Resource>> = HashMap::new();
    for res in resources {
        by_permission
            .entry(res.permission_id)
            .or_default()
            .push(Resource::from(res));
    }
    let nodes = rows
        .into_iter()
        .map(|row| {
            let res = by_permission.remove(&row.id).unwrap_or_default();
            PermissionTree::new(row, res)
        })
        .collect();
    tree::build_forest(nodes)
}

/// Build the menu forest with the same ordering rules as the full tree
pub fn build_menu_tree(rows: Vec<permission::Model>) -> Vec<MenuNode> {
    tree::build_forest(rows.into_iter().map(MenuNode::from).collect())
}

/// Menu forest of the `granted` permissions plus every ancestor needed to
/// reach them from a root
pub fn build_granted_menu_tree(rows: Vec<permission::Model>, granted: &HashSet<i64>) -> Vec<MenuNode> {
    let mut keep: HashSet<i64> = HashSet::new();
    for row in rows.iter().filter(|r| granted.contains(&r.id)) {
        keep.insert(row.id);
        keep.extend(row.ancestor_ids());
    }
    build_menu_tree(rows.into_iter().filter(|r| keep.contains(&r.id)).collect())
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionInput {
    #[serde(default)]
    pub parent_id: i64,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub localize: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub sequence: i32,
    #[serde(rename = "type")]
    pub perm_type: PermissionType,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<Status>,
    /// `None` keeps the current resources on update
    #[serde(default)]
    pub resources: Option<Vec<Resource>>,
}

impl PermissionInput {
    pub fn new(parent_id: i64, code: &str, name: &str, perm_type: PermissionType) -> Self {
        Self {
            parent_id,
            code: code.to_string(),
            name: name.to_string(),
            localize: String::new(),
            icon: String::new(),
            sequence: 0,
            perm_type,
            path: String::new(),
            properties: None,
            status: None,
            resources: None,
        }
    }

    fn validate(&self) -> AppResult<()> {
        require("code", &self.code)?;
        require("name", &self.name)?;
        check_len("code", &self.code, 64)?;
        check_len("name", &self.name, 128)?;
        check_len("localize", &self.localize, 128)?;
        check_len("icon", &self.icon, 128)?;
        check_len("path", &self.path, 255)?;
        for res in self.resources.iter().flatten() {
            require("resource method", &res.method)?;
            require("resource path", &res.path)?;
        }
        Ok(())
    }

    fn properties_text(&self) -> AppResult<String> {
        match &self.properties {
            None | Some(serde_json::Value::Null) => Ok(String::new()),
            Some(value) => Ok(serde_json::to_string(value)?),
        }
    }

    fn normalized_resources(&self) -> Option<Vec<Resource>> {
        self.resources.as_ref().map(|list| {
            list.iter()
                .map(|r| Resource::new(r.method.clone(), r.path.clone()))
                .collect()
        })
    }
}

pub struct PermissionService {
    repo: Arc<dyn PermissionRepository>,
    cache: Arc<CacheLayer>,
    enforcer: Arc<ApiEnforcer>,
    limits: QueryConfig,
}

impl PermissionService {
    pub fn new(
        repo: Arc<dyn PermissionRepository>,
        cache: Arc<CacheLayer>,
        enforcer: Arc<ApiEnforcer>,
        limits: QueryConfig,
    ) -> Self {
        Self {
            repo,
            cache,
            enforcer,
            limits,
        }
    }

    // Permission trees feed every user's menu, in every tenant
    fn touched(ids: &[i64]) -> Invalidation {
        let mut inv = Invalidation::new()
            .key(keys::permission_tree())
            .key(keys::menu_tree())
            .prefix(keys::entity_prefix(keys::USER_MENUS));
        for id in ids {
            inv = inv.key(keys::permission(*id));
        }
        inv
    }

    async fn parent(&self, ctx: &Context, parent_id: i64) -> AppResult<Option<permission::Model>> {
        if parent_id == ROOT_ID {
            return Ok(None);
        }
        match ctx.run(self.repo.get_by_id(parent_id)).await {
            Ok(p) => Ok(Some(p)),
            Err(AppError::NotFound(_)) => Err(AppError::Validation(
                "parent permission does not exist".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    async fn ensure_code_free(
        &self,
        ctx: &Context,
        parent_id: i64,
        code: &str,
        except: Option<i64>,
    ) -> AppResult<()> {
        let query = Query::new()
            .filter(field::PARENT_ID.eq(parent_id))
            .filter(field::CODE.eq(code));
        let clash = ctx
            .run(self.repo.find(&query))
            .await?
            .items
            .into_iter()
            .any(|p| Some(p.id) != except);
        if clash {
            return Err(AppError::Conflict(
                "permission code already exists".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn create(&self, ctx: &Context, input: PermissionInput) -> AppResult<permission::Model> {
        input.validate()?;
        let properties = input.properties_text()?;
        let parent = self.parent(ctx, input.parent_id).await?;
        self.ensure_code_free(ctx, input.parent_id, &input.code, None)
            .await?;
        ctx.check()?;

        let ts = now();
        let resources = input.normalized_resources().unwrap_or_default();
        let model = permission::Model {
            id: 0,
            code: input.code,
            name: input.name,
            localize: input.localize,
            icon: input.icon,
            sequence: input.sequence,
            perm_type: input.perm_type.as_str().to_string(),
            path: input.path,
            properties,
            status: input.status.unwrap_or(Status::Enabled).into(),
            parent_id: input.parent_id,
            parent_path: child_path(parent.as_ref()),
            created_at: ts,
            updated_at: ts,
        };
        let created = self.repo.create(model, resources).await?;
        info!("Permission created: id={}, code={}", created.id, created.code);
        self.cache.invalidate(Self::touched(&[created.id])).await;
        self.enforcer.mark_stale();
        Ok(created)
    }

    /// Update a node; a new `parent_id` moves the whole subtree
    pub async fn update(
        &self,
        ctx: &Context,
        id: i64,
        input: PermissionInput,
    ) -> AppResult<permission::Model> {
        input.validate()?;
        let properties = input.properties_text()?;
        let current = ctx.run(self.repo.get_by_id(id)).await?;

        let mut rewrite = None;
        let mut parent_path = current.parent_path.clone();
        if input.parent_id != current.parent_id {
            if input.parent_id == id {
                return Err(AppError::InvalidOperation(
                    "cannot move a permission under itself".to_string(),
                ));
            }
            let parent = self.parent(ctx, input.parent_id).await?;
            if let Some(p) = &parent {
                if p.ancestor_ids().contains(&id) {
                    return Err(AppError::InvalidOperation(
                        "cannot move a permission under its own descendant".to_string(),
                    ));
                }
            }
            parent_path = child_path(parent.as_ref());
            rewrite = Some(PathRewrite {
                from: current.subtree_path(),
                to: format!("{}{}.", parent_path, id),
            });
        }
        if input.parent_id != current.parent_id || input.code != current.code {
            self.ensure_code_free(ctx, input.parent_id, &input.code, Some(id))
                .await?;
        }
        // A move rewrites the path of every descendant
        let mut touched_ids = vec![id];
        if rewrite.is_some() {
            touched_ids.extend(self.descendant_ids(ctx, &current).await?);
        }
        ctx.check()?;

        let resources = input.normalized_resources();
        let model = permission::Model {
            id,
            code: input.code,
            name: input.name,
            localize: input.localize,
            icon: input.icon,
            sequence: input.sequence,
            perm_type: input.perm_type.as_str().to_string(),
            path: input.path,
            properties,
            status: input.status.map(i32::from).unwrap_or(current.status),
            parent_id: input.parent_id,
            parent_path,
            created_at: current.created_at,
            updated_at: now(),
        };
        let updated = self.repo.update(model, resources, rewrite).await?;
        info!("Permission updated: id={}", id);
        self.cache.invalidate(Self::touched(&touched_ids)).await;
        self.enforcer.mark_stale();
        Ok(updated)
    }

    /// Ids below `node`, found through the materialized path
    async fn descendant_ids(&self, ctx: &Context, node: &permission::Model) -> AppResult<Vec<i64>> {
        let subtree = Query::new().filter(field::PARENT_PATH.like(format!("{}%", node.subtree_path())));
        Ok(ctx
            .run(self.repo.find(&subtree))
            .await?
            .items
            .into_iter()
            .map(|p| p.id)
            .collect())
    }

    /// Delete a node with all of its descendants
    pub async fn delete(&self, ctx: &Context, id: i64) -> AppResult<u64> {
        let node = ctx.run(self.repo.get_by_id(id)).await?;
        let mut ids = vec![id];
        ids.extend(self.descendant_ids(ctx, &node).await?);
        ctx.check()?;

        let removed = self.repo.delete_many(&ids).await?;
        info!("Permission {} deleted with {} descendants", id, ids.len() - 1);
        let inv = Self::touched(&ids).prefix(keys::entity_prefix(keys::ROLE_PERMISSIONS));
        self.cache.invalidate(inv).await;
        self.enforcer.mark_stale();
        Ok(removed)
    }

    /// Single node with its resources
    pub async fn get_by_id(&self, ctx: &Context, id: i64) -> AppResult<PermissionTree> {
        self.cache
            .cached(ctx, &keys::permission(id), || async {
                let model = ctx.run(self.repo.get_by_id(id)).await?;
                let resources = ctx.run(self.repo.resources_by_permissions(&[id])).await?;
                Ok(PermissionTree::new(
                    model,
                    resources.into_iter().map(Resource::from).collect(),
                ))
            })
            .await
    }

    pub async fn get_tree(&self, ctx: &Context) -> AppResult<Vec<PermissionTree>> {
        self.cache
            .cached(ctx, &keys::permission_tree(), || async {
                let rows = self.all(ctx).await?;
                let ids: Vec<i64> = rows.iter().map(|p| p.id).collect();
                let resources = ctx.run(self.repo.resources_by_permissions(&ids)).await?;
                Ok(build_permission_tree(rows, resources))
            })
            .await
    }

    /// Menu tree of every enabled permission
    pub async fn get_menu_tree(&self, ctx: &Context) -> AppResult<Vec<MenuNode>> {
        self.cache
            .cached(ctx, &keys::menu_tree(), || async {
                Ok(build_menu_tree(self.enabled(ctx).await?))
            })
            .await
    }

    pub async fn list(
        &self,
        ctx: &Context,
        query: Query<permission::Model>,
    ) -> AppResult<PageResult<permission::Model>> {
        let query = query.clamped(&self.limits);
        ctx.run(self.repo.find(&query)).await
    }

    pub async fn all(&self, ctx: &Context) -> AppResult<Vec<permission::Model>> {
        Ok(ctx.run(self.repo.find(&Query::new())).await?.items)
    }

    pub async fn enabled(&self, ctx: &Context) -> AppResult<Vec<permission::Model>> {
        let query = Query::new().filter(field::STATUS.eq(i32::from(Status::Enabled)));
        Ok(ctx.run(self.repo.find(&query)).await?.items)
    }
}
