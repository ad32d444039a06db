//! User entity - subject of role bindings and data-scope resolution
//!
//! Accounts are managed elsewhere; this table carries only what
//! authorization needs.
//! Table: sys_user

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// User status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    /// Not yet activated
    Inactive = 0,
    Active = 1,
    Disabled = 2,
}

impl From<i32> for UserStatus {
    fn from(value: i32) -> Self {
        match value {
            1 => UserStatus::Active,
            2 => UserStatus::Disabled,
            _ => UserStatus::Inactive,
        }
    }
}

impl From<UserStatus> for i32 {
    fn from(status: UserStatus) -> Self {
        status as i32
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sys_user")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub tenant_id: i64,

    #[sea_orm(column_type = "String(Some(64))")]
    pub username: String,

    /// Department the user belongs to (0 when unassigned)
    pub department_id: i64,

    /// 0 = inactive, 1 = active, 2 = disabled
    pub status: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn status(&self) -> UserStatus {
        UserStatus::from(self.status)
    }
}
