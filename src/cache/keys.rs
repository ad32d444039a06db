//! Cache key layout: `<entity>:<tenant>:<id-or-qualifier>`

use std::fmt::Display;

/// Tenant slot used for global (not tenant scoped) entries
pub const GLOBAL: i64 = 0;

pub const DEPARTMENT: &str = "department";
pub const DEPARTMENT_TREE: &str = "department_tree";
pub const DEPARTMENT_CHILDREN: &str = "department_children";
pub const PERMISSION: &str = "permission";
pub const PERMISSION_TREE: &str = "permission_tree";
pub const MENU_TREE: &str = "menu_tree";
pub const ROLE: &str = "role";
pub const ROLE_ENABLED: &str = "role_enabled";
pub const ROLE_PERMISSIONS: &str = "role_permissions";
pub const USER_ROLES: &str = "user_roles";
pub const USER_MENUS: &str = "user_menus";
pub const DATA_PERMISSION: &str = "data_permission";
pub const VISIBILITY: &str = "visibility";

pub fn key(entity: &str, tenant: i64, qualifier: impl Display) -> String {
    format!("{}:{}:{}", entity, tenant, qualifier)
}

/// Prefix matching every key of one kind for one tenant
pub fn tenant_prefix(entity: &str, tenant: i64) -> String {
    format!("{}:{}:", entity, tenant)
}

/// Prefix matching every key of one kind across tenants
pub fn entity_prefix(entity: &str) -> String {
    format!("{}:", entity)
}

pub fn department(tenant: i64, id: i64) -> String {
    key(DEPARTMENT, tenant, id)
}

pub fn department_tree(tenant: i64) -> String {
    key(DEPARTMENT_TREE, tenant, "all")
}

pub fn department_subtree(tenant: i64, root: i64) -> String {
    key(DEPARTMENT_TREE, tenant, root)
}

pub fn department_children(tenant: i64, parent: i64) -> String {
    key(DEPARTMENT_CHILDREN, tenant, parent)
}

pub fn permission(id: i64) -> String {
    key(PERMISSION, GLOBAL, id)
}

pub fn permission_tree() -> String {
    key(PERMISSION_TREE, GLOBAL, "all")
}

pub fn menu_tree() -> String {
    key(MENU_TREE, GLOBAL, "all")
}

pub fn role(tenant: i64, id: i64) -> String {
    key(ROLE, tenant, id)
}

pub fn roles_enabled(tenant: i64) -> String {
    key(ROLE_ENABLED, tenant, "all")
}

pub fn role_permissions(tenant: i64, role_id: i64) -> String {
    key(ROLE_PERMISSIONS, tenant, role_id)
}

pub fn user_roles(tenant: i64, user_id: i64) -> String {
    key(USER_ROLES, tenant, user_id)
}

pub fn user_menus(tenant: i64, user_id: i64) -> String {
    key(USER_MENUS, tenant, user_id)
}

pub fn data_permission(tenant: i64, role_id: i64) -> String {
    key(DATA_PERMISSION, tenant, role_id)
}

pub fn visibility(tenant: i64, user_id: i64) -> String {
    key(VISIBILITY, tenant, user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes_do_not_bleed() {
        let prefix = tenant_prefix(DEPARTMENT, 1);
        assert!(department(1, 9).starts_with(&prefix));
        assert!(!department(12, 9).starts_with(&prefix));
        assert!(!department_tree(1).starts_with(&prefix));
        assert!(!department_children(1, 0).starts_with(&entity_prefix(DEPARTMENT)));
    }
}
