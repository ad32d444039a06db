//! Permission entity - menu / page / button node of the permission tree
//!
//! Table: sys_permission

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::{Status, ROOT_ID};

/// Permission node type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionType {
    Menu,
    Page,
    Button,
}

impl PermissionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionType::Menu => "menu",
            PermissionType::Page => "page",
            PermissionType::Button => "button",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "menu" => Some(PermissionType::Menu),
            "page" => Some(PermissionType::Page),
            "button" => Some(PermissionType::Button),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sys_permission")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Unique among siblings
    #[sea_orm(column_type = "String(Some(64))")]
    pub code: String,

    #[sea_orm(column_type = "String(Some(128))")]
    pub name: String,

    /// i18n key for the display name
    #[sea_orm(column_type = "String(Some(128))")]
    pub localize: String,

    #[sea_orm(column_type = "String(Some(128))")]
    pub icon: String,

    pub sequence: i32,

    /// menu | page | button
    #[sea_orm(column_type = "String(Some(16))")]
    pub perm_type: String,

    /// Front-end route
    #[sea_orm(column_type = "String(Some(255))")]
    pub path: String,

    /// Free-form JSON properties for the front-end
    #[sea_orm(column_type = "Text")]
    pub properties: String,

    pub status: i32,

    pub parent_id: i64,

    /// Materialized path: ancestor ids, each followed by '.'
    #[sea_orm(column_type = "String(Some(255))")]
    pub parent_path: String,

    pub created_at: i64,

    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn status(&self) -> Status {
        Status::from(self.status)
    }

    pub fn perm_type(&self) -> Option<PermissionType> {
        PermissionType::parse(&self.perm_type)
    }

    /// Path prefix shared by every descendant of this node
    pub fn subtree_path(&self) -> String {
        format!("{}{}.", self.parent_path, self.id)
    }

    /// Ancestor ids encoded in `parent_path`, root first
    pub fn ancestor_ids(&self) -> Vec<i64> {
        parse_path(&self.parent_path)
    }
}

/// Build the materialized path of a child of `parent` (None for roots)
pub fn child_path(parent: Option<&Model>) -> String {
    match parent {
        Some(p) if p.id != ROOT_ID => p.subtree_path(),
        _ => String::new(),
    }
}

pub fn parse_path(path: &str) -> Vec<i64> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Query fields
pub mod field {
    use super::Model;
    use crate::query::{Field, Value};

    pub const ID: Field<Model, i64> = Field::new("id", |m: &Model| Value::from(m.id));
    pub const CODE: Field<Model, String> =
        Field::new("code", |m: &Model| Value::from(m.code.clone()));
    pub const NAME: Field<Model, String> =
        Field::new("name", |m: &Model| Value::from(m.name.clone()));
    pub const PERM_TYPE: Field<Model, String> =
        Field::new("perm_type", |m: &Model| Value::from(m.perm_type.clone()));
    pub const SEQUENCE: Field<Model, i32> =
        Field::new("sequence", |m: &Model| Value::from(m.sequence));
    pub const STATUS: Field<Model, i32> =
        Field::new("status", |m: &Model| Value::from(m.status));
    pub const PARENT_ID: Field<Model, i64> =
        Field::new("parent_id", |m: &Model| Value::from(m.parent_id));
    pub const PARENT_PATH: Field<Model, String> =
        Field::new("parent_path", |m: &Model| Value::from(m.parent_path.clone()));
}
