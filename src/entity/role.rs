//! Role entity
//!
//! Table: sys_role

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::Status;

/// Resource roles gate menus and APIs, data roles gate rows
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleType {
    Resource = 1,
    Data = 2,
}

impl From<i32> for RoleType {
    fn from(value: i32) -> Self {
        match value {
            2 => RoleType::Data,
            _ => RoleType::Resource,
        }
    }
}

impl From<RoleType> for i32 {
    fn from(role_type: RoleType) -> Self {
        role_type as i32
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sys_role")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub tenant_id: i64,

    /// Unique within the tenant
    #[sea_orm(column_type = "String(Some(64))")]
    pub code: String,

    #[sea_orm(column_type = "String(Some(64))")]
    pub name: String,

    /// 1 = resource role, 2 = data role
    pub role_type: i32,

    #[sea_orm(column_type = "String(Some(128))")]
    pub localize: String,

    #[sea_orm(column_type = "String(Some(1024))")]
    pub description: String,

    pub sequence: i32,

    pub status: i32,

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

    pub fn role_type(&self) -> RoleType {
        RoleType::from(self.role_type)
    }

    pub fn is_enabled(&self) -> bool {
        self.status() == Status::Enabled
    }
}

/// Query fields
pub mod field {
    use super::Model;
    use crate::query::{Field, Value};

    pub const ID: Field<Model, i64> = Field::new("id", |m: &Model| Value::from(m.id));
    pub const TENANT_ID: Field<Model, i64> =
        Field::new("tenant_id", |m: &Model| Value::from(m.tenant_id));
    pub const CODE: Field<Model, String> =
        Field::new("code", |m: &Model| Value::from(m.code.clone()));
    pub const NAME: Field<Model, String> =
        Field::new("name", |m: &Model| Value::from(m.name.clone()));
    pub const ROLE_TYPE: Field<Model, i32> =
        Field::new("role_type", |m: &Model| Value::from(m.role_type));
    pub const SEQUENCE: Field<Model, i32> =
        Field::new("sequence", |m: &Model| Value::from(m.sequence));
    pub const STATUS: Field<Model, i32> =
        Field::new("status", |m: &Model| Value::from(m.status));
}
