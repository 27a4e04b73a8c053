use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
use crate::db::{DatabaseError, RoomStore, UserStore};
use std::sync::Arc;
use tracing::info;

#[cfg(feature = "postgres")]
use crate::db::postgres::{PostgresRoomStore, PostgresUserStore};
#[cfg(feature = "postgres")]
use diesel::RunQueryDsl;
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{SqliteRoomStore, SqliteUserStore};
#[cfg(feature = "sqlite")]
use diesel::Connection;
#[cfg(feature = "sqlite")]
use diesel::sqlite::SqliteConnection;

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    room_store: Arc<dyn RoomStore>,
    user_store: Arc<dyn UserStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Postgres => DbType::Postgres,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

#[cfg(feature = "postgres")]
const POSTGRES_MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS room_mappings (
        id BIGSERIAL PRIMARY KEY,
        remote_room_id TEXT NOT NULL,
        matrix_room_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        UNIQUE (kind, remote_room_id),
        UNIQUE (kind, matrix_room_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS virtual_users (
        id BIGSERIAL PRIMARY KEY,
        remote_user_id TEXT NOT NULL UNIQUE,
        matrix_user_id TEXT NOT NULL UNIQUE,
        display_name TEXT,
        avatar_url TEXT,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
];

#[cfg(feature = "sqlite")]
const SQLITE_MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS room_mappings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        remote_room_id TEXT NOT NULL,
        matrix_room_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE (kind, remote_room_id),
        UNIQUE (kind, matrix_room_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS virtual_users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        remote_user_id TEXT NOT NULL UNIQUE,
        matrix_user_id TEXT NOT NULL UNIQUE,
        display_name TEXT,
        avatar_url TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
];

impl DatabaseManager {
    pub async fn new(config: &ConfigDatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let manager = ConnectionManager::<PgConnection>::new(config.connection_string());
                let pool = r2d2::Pool::builder()
                    .max_size(config.max_connections().unwrap_or(10))
                    .min_idle(Some(config.min_connections().unwrap_or(1)))
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                Ok(Self {
                    room_store: Arc::new(PostgresRoomStore::new(pool.clone())),
                    user_store: Arc::new(PostgresUserStore::new(pool.clone())),
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite database path is missing".to_string())
                })?;
                let path_arc = Arc::new(path.clone());

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    room_store: Arc::new(SqliteRoomStore::new(path_arc.clone())),
                    user_store: Arc::new(SqliteUserStore::new(path_arc)),
                    sqlite_path: Some(path),
                    db_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        info!("running database migrations db_type={:?}", self.db_type);
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self.postgres_pool.clone().ok_or_else(|| {
                    DatabaseError::Migration("postgres pool is not initialized".to_string())
                })?;
                Self::migrate_postgres(pool).await
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self.sqlite_path.clone().ok_or_else(|| {
                    DatabaseError::Migration("sqlite path is not initialized".to_string())
                })?;
                Self::migrate_sqlite(path).await
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Migration(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Migration(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    #[cfg(feature = "postgres")]
    async fn migrate_postgres(pool: Pool) -> Result<(), DatabaseError> {
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            for statement in POSTGRES_MIGRATIONS {
                diesel::sql_query(*statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    #[cfg(feature = "sqlite")]
    async fn migrate_sqlite(path: String) -> Result<(), DatabaseError> {
        tokio::task::spawn_blocking(move || {
            use diesel::RunQueryDsl;

            let mut conn = SqliteConnection::establish(&path)
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            for statement in SQLITE_MIGRATIONS {
                diesel::sql_query(*statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn room_store(&self) -> Arc<dyn RoomStore> {
        self.room_store.clone()
    }

    pub fn user_store(&self) -> Arc<dyn UserStore> {
        self.user_store.clone()
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use chrono::Utc;
    use tempfile::NamedTempFile;

    use super::DatabaseManager;
    use crate::config::DatabaseConfig;
    use crate::db::{MappingKind, RoomMapping, VirtualUser};

    async fn sqlite_manager(file: &NamedTempFile) -> DatabaseManager {
        let config = DatabaseConfig {
            url: None,
            filename: Some(file.path().to_string_lossy().to_string()),
            max_connections: Some(1),
            min_connections: Some(1),
        };

        let manager = DatabaseManager::new(&config).await.expect("db manager");
        manager.migrate().await.expect("migrate");
        manager
    }

    #[tokio::test]
    async fn sqlite_room_mapping_insert_is_exclusive_per_kind() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let store = manager.room_store();

        let live = RoomMapping::new("remote-1", "!live:example.org", MappingKind::Live);
        assert!(store.insert_if_absent(&live).await.expect("insert live"));

        let clash = RoomMapping::new("remote-1", "!other:example.org", MappingKind::Live);
        assert!(!store.insert_if_absent(&clash).await.expect("insert clash"));

        let reused_target = RoomMapping::new("remote-2", "!live:example.org", MappingKind::Live);
        assert!(!store.insert_if_absent(&reused_target).await.expect("insert reuse"));

        let historical =
            RoomMapping::new("remote-1", "!history:example.org", MappingKind::Historical);
        assert!(store.insert_if_absent(&historical).await.expect("insert historical"));

        let found = store
            .get_by_remote_room("remote-1", MappingKind::Live)
            .await
            .expect("query live")
            .expect("live mapping exists");
        assert_eq!(found.matrix_room_id, "!live:example.org");

        let reverse = store
            .get_by_matrix_room("!history:example.org", MappingKind::Historical)
            .await
            .expect("query historical")
            .expect("historical mapping exists");
        assert_eq!(reverse.remote_room_id, "remote-1");

        assert!(
            store
                .get_by_matrix_room("!history:example.org", MappingKind::Live)
                .await
                .expect("query wrong kind")
                .is_none()
        );
        assert_eq!(store.list_by_kind(MappingKind::Live).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sqlite_room_mapping_survives_reopen_and_deletes() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let mapping = RoomMapping::new("remote-9", "!nine:example.org", MappingKind::Live);
        manager
            .room_store()
            .insert_if_absent(&mapping)
            .await
            .expect("insert");

        let reopened = sqlite_manager(&file).await;
        let store = reopened.room_store();
        assert!(
            store
                .get_by_remote_room("remote-9", MappingKind::Live)
                .await
                .expect("query after reopen")
                .is_some()
        );

        assert!(store.delete_by_remote_room("remote-9", MappingKind::Live).await.unwrap());
        assert!(!store.delete_by_remote_room("remote-9", MappingKind::Live).await.unwrap());
        assert!(
            store
                .get_by_remote_room("remote-9", MappingKind::Live)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn sqlite_virtual_user_upsert_updates_profile() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let store = manager.user_store();

        let now = Utc::now();
        let mut user = VirtualUser {
            id: 0,
            remote_user_id: "5f1a".to_string(),
            matrix_user_id: "@_bridge_5f1a:example.org".to_string(),
            display_name: Some("Alice".to_string()),
            avatar_url: Some("mxc://example.org/avatar".to_string()),
            created_at: now,
            updated_at: now,
        };
        store.upsert_virtual_user(&user).await.expect("insert user");

        user.display_name = Some("Alice B".to_string());
        user.avatar_url = None;
        user.updated_at = Utc::now();
        store.upsert_virtual_user(&user).await.expect("update user");

        let stored = store
            .get_by_matrix_user("@_bridge_5f1a:example.org")
            .await
            .expect("query user")
            .expect("user exists");
        assert_eq!(stored.remote_user_id, "5f1a");
        assert_eq!(stored.display_name.as_deref(), Some("Alice B"));
        assert!(stored.avatar_url.is_none());
    }
}
