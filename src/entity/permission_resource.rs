//! PermissionResource entity - protected API endpoint bound to a permission
//!
//! Table: sys_permission_resource

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sys_permission_resource")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub permission_id: i64,

    /// HTTP method, upper case
    #[sea_orm(column_type = "String(Some(16))")]
    pub method: String,

    /// Route pattern, e.g. /api/v1/departments/:id
    #[sea_orm(column_type = "String(Some(255))")]
    pub path: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Method/path pair as exposed on permission trees
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub method: String,
    pub path: String,
}

impl Resource {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            path: path.into(),
        }
    }
}

impl From<Model> for Resource {
    fn from(model: Model) -> Self {
        Self {
            method: model.method,
            path: model.path,
        }
    }
}
