use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheLayer, CacheStore, MemoryStore, RedisStore};
use crate::config::{CacheBackend, Config};
use crate::context::Context;
use crate::db;
use crate::enforcer::ApiEnforcer;
use crate::error::{AppError, AppResult};
use crate::repository::{
    DataPermissionRepository, DepartmentRepository, MemoryRepository, PermissionRepository,
    RoleRepository, SeaRepository, UserRepository,
};
use crate::service::{DataScopeService, DepartmentService, PermissionService, RoleService};

/// One handle per table family
#[derive(Clone)]
pub struct Repositories {
    pub departments: Arc<dyn DepartmentRepository>,
    pub permissions: Arc<dyn PermissionRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub data: Arc<dyn DataPermissionRepository>,
    pub users: Arc<dyn UserRepository>,
}

impl Repositories {
    /// Process-local tables
    pub fn memory() -> Self {
        let repo = Arc::new(MemoryRepository::new());
        Self {
            departments: repo.clone(),
            permissions: repo.clone(),
            roles: repo.clone(),
            data: repo.clone(),
            users: repo,
        }
    }

    pub fn sea(db: DatabaseConnection) -> Self {
        let repo = Arc::new(SeaRepository::new(db));
        Self {
            departments: repo.clone(),
            permissions: repo.clone(),
            roles: repo.clone(),
            data: repo.clone(),
            users: repo,
        }
    }
}

/// Engine state shared by every caller
#[derive(Clone)]
pub struct Engine {
    /// Database connection pool (None for the in-memory engine)
    pub db: Option<DatabaseConnection>,
    pub config: Arc<Config>,
    pub repos: Repositories,
    pub cache: Arc<CacheLayer>,
    pub enforcer: Arc<ApiEnforcer>,
    pub departments: Arc<DepartmentService>,
    pub permissions: Arc<PermissionService>,
    pub roles: Arc<RoleService>,
    pub data_scopes: Arc<DataScopeService>,
}

impl Engine {
    /// Wire the services over the given repositories and cache store
    pub fn new(
        config: Config,
        repos: Repositories,
        store: Arc<dyn CacheStore>,
        db: Option<DatabaseConnection>,
    ) -> Self {
        let cache = Arc::new(CacheLayer::new(store, config.cache.ttl()));
        let enforcer = Arc::new(ApiEnforcer::new(
            repos.roles.clone(),
            repos.users.clone(),
            repos.permissions.clone(),
            config.casbin_conf.clone(),
        ));
        let limits = config.query.clone();

        let departments = Arc::new(DepartmentService::new(
            repos.departments.clone(),
            cache.clone(),
            limits.clone(),
        ));
        let permissions = Arc::new(PermissionService::new(
            repos.permissions.clone(),
            cache.clone(),
            enforcer.clone(),
            limits.clone(),
        ));
        let roles = Arc::new(RoleService::new(
            repos.roles.clone(),
            repos.users.clone(),
            repos.permissions.clone(),
            cache.clone(),
            enforcer.clone(),
            limits,
        ));
        let data_scopes = Arc::new(DataScopeService::new(
            repos.data.clone(),
            repos.users.clone(),
            roles.clone(),
            departments.clone(),
            cache.clone(),
        ));

        Self {
            db,
            config: Arc::new(config),
            repos,
            cache,
            enforcer,
            departments,
            permissions,
            roles,
            data_scopes,
        }
    }

    /// In-memory tables and cache with default configuration
    pub fn in_memory() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self::new(config, Repositories::memory(), Arc::new(MemoryStore::new()), None)
    }

    /// Connect the database (running auto-migration) and the configured cache
    pub async fn connect(config: Config) -> AppResult<Self> {
        let db = db::init_database(&config.database)
            .await
            .map_err(|e| AppError::Database(e).context("connect database"))?;

        let store: Arc<dyn CacheStore> = match config.cache.backend {
            CacheBackend::Redis => Arc::new(RedisStore::connect(&config.cache.redis_url).await?),
            CacheBackend::Memory => Arc::new(MemoryStore::new()),
        };
        info!("Cache backend: {:?}", config.cache.backend);

        let engine = Self::new(config, Repositories::sea(db.clone()), store, Some(db));
        engine.enforcer.reload().await?;
        Ok(engine)
    }

    /// Get database connection, returns None for the in-memory engine
    pub fn get_db(&self) -> Option<&DatabaseConnection> {
        self.db.as_ref()
    }

    /// API gate for `method path` on behalf of the context's user
    pub async fn check_api(&self, ctx: &Context, method: &str, path: &str) -> AppResult<()> {
        self.enforcer.check(ctx, method, path).await
    }
}
