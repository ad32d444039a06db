//! Entity module - SeaORM entity definitions
//!
//! Rows are stored flat and keyed by id; trees are projections built on read.

use serde::{Deserialize, Serialize};

pub mod data_permission;
pub mod department;
pub mod permission;
pub mod permission_resource;
pub mod role;
pub mod role_permission;
pub mod user;
pub mod user_role;

/// Parent id of root nodes
pub const ROOT_ID: i64 = 0;

/// Row status shared by departments, permissions and roles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Enabled = 1,
    Disabled = 2,
}

impl From<i32> for Status {
    fn from(value: i32) -> Self {
        match value {
            1 => Status::Enabled,
            _ => Status::Disabled,
        }
    }
}

impl From<Status> for i32 {
    fn from(status: Status) -> Self {
        status as i32
    }
}

/// Current time as a unix timestamp
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
