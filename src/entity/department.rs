//! Department entity - organizational unit
//!
//! Table: sys_department

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::Status;
use crate::tree::TreeNode;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sys_department")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub tenant_id: i64,

    /// Parent department id (0 for top-level departments)
    pub parent_id: i64,

    /// Unique within the tenant
    #[sea_orm(column_type = "String(Some(64))")]
    pub code: String,

    #[sea_orm(column_type = "String(Some(64))")]
    pub name: String,

    pub sequence: i32,

    #[sea_orm(column_type = "String(Some(64))")]
    pub leader: String,

    #[sea_orm(column_type = "String(Some(32))")]
    pub phone: String,

    #[sea_orm(column_type = "String(Some(128))")]
    pub email: String,

    /// 1 = enabled, 2 = disabled
    pub status: i32,

    #[sea_orm(column_type = "String(Some(1024))")]
    pub description: String,

    pub created_at: i64,

    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

// Parent/child links are resolved in memory, see crate::tree

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn status(&self) -> Status {
        Status::from(self.status)
    }
}

/// Query fields
pub mod field {
    use super::Model;
    use crate::query::{Field, Value};

    pub const ID: Field<Model, i64> = Field::new("id", |m: &Model| Value::from(m.id));
    pub const TENANT_ID: Field<Model, i64> =
        Field::new("tenant_id", |m: &Model| Value::from(m.tenant_id));
    pub const PARENT_ID: Field<Model, i64> =
        Field::new("parent_id", |m: &Model| Value::from(m.parent_id));
    pub const CODE: Field<Model, String> =
        Field::new("code", |m: &Model| Value::from(m.code.clone()));
    pub const NAME: Field<Model, String> =
        Field::new("name", |m: &Model| Value::from(m.name.clone()));
    pub const SEQUENCE: Field<Model, i32> =
        Field::new("sequence", |m: &Model| Value::from(m.sequence));
    pub const STATUS: Field<Model, i32> =
        Field::new("status", |m: &Model| Value::from(m.status));
}

/// Department tree node (transient projection)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentTree {
    pub id: i64,
    pub tenant_id: i64,
    pub parent_id: i64,
    pub code: String,
    pub name: String,
    pub sequence: i32,
    pub leader: String,
    pub phone: String,
    pub email: String,
    pub status: i32,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DepartmentTree>,
}

impl From<Model> for DepartmentTree {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            tenant_id: model.tenant_id,
            parent_id: model.parent_id,
            code: model.code,
            name: model.name,
            sequence: model.sequence,
            leader: model.leader,
            phone: model.phone,
            email: model.email,
            status: model.status,
            description: model.description,
            children: Vec::new(),
        }
    }
}

impl TreeNode for DepartmentTree {
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
