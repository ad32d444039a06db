//! DataPermission entity - row-level visibility policy of a data role
//!
//! One row per role.
//! Table: sys_data_permission

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Row visibility granted by a data role
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataScope {
    /// No filter at all
    All,
    /// Every row of the caller's tenant
    Tenant,
    /// The caller's own department
    Dept,
    /// The caller's department and all of its descendants
    DeptTree,
    /// Rows owned by the caller
    #[serde(rename = "self")]
    SelfOnly,
    /// An explicit department list
    Custom,
}

impl DataScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataScope::All => "all",
            DataScope::Tenant => "tenant",
            DataScope::Dept => "dept",
            DataScope::DeptTree => "dept_tree",
            DataScope::SelfOnly => "self",
            DataScope::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(DataScope::All),
            "tenant" => Some(DataScope::Tenant),
            "dept" => Some(DataScope::Dept),
            "dept_tree" => Some(DataScope::DeptTree),
            "self" => Some(DataScope::SelfOnly),
            "custom" => Some(DataScope::Custom),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sys_data_permission")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub tenant_id: i64,

    #[sea_orm(unique)]
    pub role_id: i64,

    /// all | tenant | dept | dept_tree | self | custom
    #[sea_orm(column_type = "String(Some(16))")]
    pub scope: String,

    /// JSON array of department ids, only used by the custom scope
    #[sea_orm(column_type = "Text")]
    pub dept_ids: String,

    pub created_at: i64,

    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Unknown scope strings fall back to the most restrictive scope
    pub fn scope(&self) -> DataScope {
        DataScope::parse(&self.scope).unwrap_or(DataScope::SelfOnly)
    }

    pub fn dept_ids(&self) -> Vec<i64> {
        if self.dept_ids.is_empty() {
            return Vec::new();
        }
        serde_json::from_str(&self.dept_ids).unwrap_or_else(|e| {
            tracing::warn!("Malformed dept_ids on data permission {}: {}", self.id, e);
            Vec::new()
        })
    }
}

pub fn encode_dept_ids(ids: &[i64]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}
