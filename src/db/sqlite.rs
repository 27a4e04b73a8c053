use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

use crate::db::schema_sqlite::{room_mappings, virtual_users};

use super::{
    DatabaseError,
    models::{MappingKind, RoomMapping, VirtualUser},
};

// Helper function to convert DateTime to ISO string for SQLite
fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// Helper function to parse ISO string to DateTime
fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

fn query_error(e: diesel::result::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

// SQLite uses i32 for INTEGER (primary keys), but we want to keep i64 in our API
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = room_mappings)]
struct DbRoomMapping {
    id: i32,
    remote_room_id: String,
    matrix_room_id: String,
    kind: String,
    created_at: String,
}

impl DbRoomMapping {
    fn into_room_mapping(self) -> Result<RoomMapping, DatabaseError> {
        Ok(RoomMapping {
            id: self.id as i64,
            kind: self.kind.parse()?,
            created_at: string_to_datetime(&self.created_at)?,
            remote_room_id: self.remote_room_id,
            matrix_room_id: self.matrix_room_id,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = room_mappings)]
struct NewRoomMapping<'a> {
    remote_room_id: &'a str,
    matrix_room_id: &'a str,
    kind: &'a str,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = virtual_users)]
struct DbVirtualUser {
    id: i32,
    remote_user_id: String,
    matrix_user_id: String,
    display_name: Option<String>,
    avatar_url: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DbVirtualUser {
    fn into_virtual_user(self) -> Result<VirtualUser, DatabaseError> {
        Ok(VirtualUser {
            id: self.id as i64,
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
            remote_user_id: self.remote_user_id,
            matrix_user_id: self.matrix_user_id,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = virtual_users)]
struct NewVirtualUser<'a> {
    remote_user_id: &'a str,
    matrix_user_id: &'a str,
    display_name: Option<&'a str>,
    avatar_url: Option<&'a str>,
    created_at: String,
    updated_at: String,
}

#[derive(AsChangeset)]
#[diesel(table_name = virtual_users, treat_none_as_null = true)]
struct UpdateVirtualUser<'a> {
    matrix_user_id: &'a str,
    display_name: Option<&'a str>,
    avatar_url: Option<&'a str>,
    updated_at: String,
}

fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))
}

async fn with_connection<T, F>(db_path: Arc<String>, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = establish_connection(&db_path)?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

pub struct SqliteRoomStore {
    db_path: Arc<String>,
}

impl SqliteRoomStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::RoomStore for SqliteRoomStore {
    async fn get_by_remote_room(
        &self,
        remote_room_id: &str,
        kind: MappingKind,
    ) -> Result<Option<RoomMapping>, DatabaseError> {
        let remote_room_id = remote_room_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            room_mappings::table
                .filter(room_mappings::remote_room_id.eq(remote_room_id))
                .filter(room_mappings::kind.eq(kind.as_str()))
                .select(DbRoomMapping::as_select())
                .first::<DbRoomMapping>(conn)
                .optional()
                .map_err(query_error)?
                .map(DbRoomMapping::into_room_mapping)
                .transpose()
        })
        .await
    }

    async fn get_by_matrix_room(
        &self,
        matrix_room_id: &str,
        kind: MappingKind,
    ) -> Result<Option<RoomMapping>, DatabaseError> {
        let matrix_room_id = matrix_room_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            room_mappings::table
                .filter(room_mappings::matrix_room_id.eq(matrix_room_id))
                .filter(room_mappings::kind.eq(kind.as_str()))
                .select(DbRoomMapping::as_select())
                .first::<DbRoomMapping>(conn)
                .optional()
                .map_err(query_error)?
                .map(DbRoomMapping::into_room_mapping)
                .transpose()
        })
        .await
    }

    async fn insert_if_absent(&self, mapping: &RoomMapping) -> Result<bool, DatabaseError> {
        let mapping = mapping.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let new_mapping = NewRoomMapping {
                remote_room_id: &mapping.remote_room_id,
                matrix_room_id: &mapping.matrix_room_id,
                kind: mapping.kind.as_str(),
                created_at: datetime_to_string(&mapping.created_at),
            };

            diesel::insert_into(room_mappings::table)
                .values(&new_mapping)
                .on_conflict_do_nothing()
                .execute(conn)
                .map(|inserted| inserted > 0)
                .map_err(query_error)
        })
        .await
    }

    async fn delete_by_remote_room(
        &self,
        remote_room_id: &str,
        kind: MappingKind,
    ) -> Result<bool, DatabaseError> {
        let remote_room_id = remote_room_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            diesel::delete(
                room_mappings::table
                    .filter(room_mappings::remote_room_id.eq(remote_room_id))
                    .filter(room_mappings::kind.eq(kind.as_str())),
            )
            .execute(conn)
            .map(|deleted| deleted > 0)
            .map_err(query_error)
        })
        .await
    }

    async fn list_by_kind(&self, kind: MappingKind) -> Result<Vec<RoomMapping>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            room_mappings::table
                .filter(room_mappings::kind.eq(kind.as_str()))
                .order(room_mappings::id.asc())
                .select(DbRoomMapping::as_select())
                .load::<DbRoomMapping>(conn)
                .map_err(query_error)?
                .into_iter()
                .map(DbRoomMapping::into_room_mapping)
                .collect()
        })
        .await
    }
}

pub struct SqliteUserStore {
    db_path: Arc<String>,
}

impl SqliteUserStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::UserStore for SqliteUserStore {
    async fn get_by_remote_user(
        &self,
        remote_user_id: &str,
    ) -> Result<Option<VirtualUser>, DatabaseError> {
        let remote_user_id = remote_user_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            virtual_users::table
                .filter(virtual_users::remote_user_id.eq(remote_user_id))
                .select(DbVirtualUser::as_select())
                .first::<DbVirtualUser>(conn)
                .optional()
                .map_err(query_error)?
                .map(DbVirtualUser::into_virtual_user)
                .transpose()
        })
        .await
    }

    async fn get_by_matrix_user(
        &self,
        matrix_user_id: &str,
    ) -> Result<Option<VirtualUser>, DatabaseError> {
        let matrix_user_id = matrix_user_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            virtual_users::table
                .filter(virtual_users::matrix_user_id.eq(matrix_user_id))
                .select(DbVirtualUser::as_select())
                .first::<DbVirtualUser>(conn)
                .optional()
                .map_err(query_error)?
                .map(DbVirtualUser::into_virtual_user)
                .transpose()
        })
        .await
    }

    async fn upsert_virtual_user(&self, user: &VirtualUser) -> Result<(), DatabaseError> {
        let user = user.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let new_user = NewVirtualUser {
                remote_user_id: &user.remote_user_id,
                matrix_user_id: &user.matrix_user_id,
                display_name: user.display_name.as_deref(),
                avatar_url: user.avatar_url.as_deref(),
                created_at: datetime_to_string(&user.created_at),
                updated_at: datetime_to_string(&user.updated_at),
            };
            let changes = UpdateVirtualUser {
                matrix_user_id: &user.matrix_user_id,
                display_name: user.display_name.as_deref(),
                avatar_url: user.avatar_url.as_deref(),
                updated_at: datetime_to_string(&user.updated_at),
            };

            diesel::insert_into(virtual_users::table)
                .values(&new_user)
                .on_conflict(virtual_users::remote_user_id)
                .do_update()
                .set(&changes)
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }
}
