use sea_orm::sea_query::{Index, IndexCreateStatement, TableCreateStatement};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, Schema};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::entity::{
    data_permission, department, permission, permission_resource, role, role_permission, user,
    user_role,
};

/// Initialize database connection and auto-migrate tables
pub async fn init_database(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let database_url = config.connection_url();

    info!("Connecting to database: {}:{}/{}", config.host, config.port, config.name);

    let mut opt = ConnectOptions::new(&database_url);
    opt.max_connections(config.max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .idle_timeout(Duration::from_secs(300))
        .sqlx_logging(true)
        .sqlx_logging_level(tracing::log::LevelFilter::Debug)
        .set_schema_search_path("public");

    let db = Database::connect(opt).await?;
    info!("Database connection established");

    auto_migrate(&db).await?;

    Ok(db)
}

/// Test database connection
pub async fn test_connection(config: &DatabaseConfig) -> Result<(), DbErr> {
    let mut opt = ConnectOptions::new(config.connection_url());
    opt.connect_timeout(Duration::from_secs(5));

    let db = Database::connect(opt).await?;
    db.ping().await?;

    Ok(())
}

/// Create missing tables and unique indexes
async fn auto_migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    info!("Running auto-migration for all entities...");

    create_table_if_not_exists(db, backend, schema.create_table_from_entity(department::Entity)).await?;
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(permission::Entity)).await?;
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(permission_resource::Entity)).await?;
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(role::Entity)).await?;
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(role_permission::Entity)).await?;
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(data_permission::Entity)).await?;
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(user::Entity)).await?;
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(user_role::Entity)).await?;

    for stmt in unique_indexes() {
        create_index_if_not_exists(db, backend, stmt).await?;
    }

    info!("Auto-migration completed successfully");
    Ok(())
}

/// Natural keys the services rely on
fn unique_indexes() -> Vec<IndexCreateStatement> {
    vec![
        Index::create()
            .name("uk_department_tenant_code")
            .table(department::Entity)
            .col(department::Column::TenantId)
            .col(department::Column::Code)
            .unique()
            .to_owned(),
        Index::create()
            .name("uk_permission_parent_code")
            .table(permission::Entity)
            .col(permission::Column::ParentId)
            .col(permission::Column::Code)
            .unique()
            .to_owned(),
        Index::create()
            .name("uk_role_tenant_code")
            .table(role::Entity)
            .col(role::Column::TenantId)
            .col(role::Column::Code)
            .unique()
            .to_owned(),
        Index::create()
            .name("uk_role_permission")
            .table(role_permission::Entity)
            .col(role_permission::Column::RoleId)
            .col(role_permission::Column::PermissionId)
            .unique()
            .to_owned(),
        Index::create()
            .name("uk_user_role")
            .table(user_role::Entity)
            .col(user_role::Column::UserId)
            .col(user_role::Column::RoleId)
            .unique()
            .to_owned(),
    ]
}

/// Create a table if it doesn't exist
async fn create_table_if_not_exists(
    db: &DatabaseConnection,
    backend: DbBackend,
    mut stmt: TableCreateStatement,
) -> Result<(), DbErr> {
    stmt.if_not_exists();
    db.execute(backend.build(&stmt)).await?;
    Ok(())
}

async fn create_index_if_not_exists(
    db: &DatabaseConnection,
    backend: DbBackend,
    mut stmt: IndexCreateStatement,
) -> Result<(), DbErr> {
    stmt.if_not_exists();
    db.execute(backend.build(&stmt)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_sql() {
        let mut stmt = unique_indexes().remove(0);
        stmt.if_not_exists();
        let sql = DbBackend::Postgres.build(&stmt).to_string();
        assert!(sql.contains("CREATE UNIQUE INDEX IF NOT EXISTS \"uk_department_tenant_code\""));
        assert!(sql.contains("\"sys_department\""));
    }

    #[test]
    fn test_every_table_named_sys() {
        let schema = Schema::new(DbBackend::Postgres);
        let sql = DbBackend::Postgres
            .build(&schema.create_table_from_entity(data_permission::Entity))
            .to_string();
        assert!(sql.contains("\"sys_data_permission\""));
    }
}
