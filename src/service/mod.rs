//! Engine services
//!
//! Commands validate first, write through their repository, then evict the
//! cache keys they touched. Queries read through the cache layer.

pub mod data_scope;
pub mod department;
pub mod permission;
pub mod role;

use crate::error::{AppError, AppResult};

pub use data_scope::{DataScopeService, Visibility};
pub use department::DepartmentService;
pub use permission::PermissionService;
pub use role::RoleService;

pub(crate) fn require(name: &str, value: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{} is required", name)));
    }
    Ok(())
}

pub(crate) fn check_len(name: &str, value: &str, max: usize) -> AppResult<()> {
    if value.chars().count() > max {
        return Err(AppError::Validation(format!(
            "{} must not exceed {} characters",
            name, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_counts_chars() {
        assert!(check_len("name", "研发部", 3).is_ok());
        assert!(check_len("name", "研发部门", 3).is_err());
        assert!(require("code", "  ").is_err());
    }
}
