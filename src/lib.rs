//! Orgauth - Multi-tenant RBAC and department data-scope engine
//!
//! This crate provides department hierarchies, permission trees, role
//! bindings and row-level data scopes, with a read-through cache kept
//! coherent by the services that write.

pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod enforcer;
pub mod entity;
pub mod error;
pub mod query;
pub mod repository;
pub mod service;
pub mod state;
pub mod token;
pub mod tree;

// Re-export commonly used types
pub use config::Config;
pub use context::Context;
pub use error::{AppError, AppResult};
pub use state::Engine;
