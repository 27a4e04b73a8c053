use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;

use crate::db::manager::Pool;
use crate::db::schema::{room_mappings, virtual_users};

use super::{
    DatabaseError,
    models::{MappingKind, RoomMapping, VirtualUser},
};

fn query_error(e: diesel::result::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = room_mappings)]
struct DbRoomMapping {
    id: i64,
    remote_room_id: String,
    matrix_room_id: String,
    kind: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<DbRoomMapping> for RoomMapping {
    type Error = DatabaseError;

    fn try_from(value: DbRoomMapping) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id,
            kind: value.kind.parse()?,
            remote_room_id: value.remote_room_id,
            matrix_room_id: value.matrix_room_id,
            created_at: value.created_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = room_mappings)]
struct NewRoomMapping<'a> {
    remote_room_id: &'a str,
    matrix_room_id: &'a str,
    kind: &'a str,
    created_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = virtual_users)]
struct DbVirtualUser {
    id: i64,
    remote_user_id: String,
    matrix_user_id: String,
    display_name: Option<String>,
    avatar_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbVirtualUser> for VirtualUser {
    fn from(value: DbVirtualUser) -> Self {
        Self {
            id: value.id,
            remote_user_id: value.remote_user_id,
            matrix_user_id: value.matrix_user_id,
            display_name: value.display_name,
            avatar_url: value.avatar_url,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = virtual_users)]
struct NewVirtualUser<'a> {
    remote_user_id: &'a str,
    matrix_user_id: &'a str,
    display_name: Option<&'a str>,
    avatar_url: Option<&'a str>,
    created_at: &'a DateTime<Utc>,
    updated_at: &'a DateTime<Utc>,
}

#[derive(AsChangeset)]
#[diesel(table_name = virtual_users, treat_none_as_null = true)]
struct UpdateVirtualUser<'a> {
    matrix_user_id: &'a str,
    display_name: Option<&'a str>,
    avatar_url: Option<&'a str>,
    updated_at: &'a DateTime<Utc>,
}

async fn with_connection<T, F>(pool: Pool, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

pub struct PostgresRoomStore {
    pool: Pool,
}

impl PostgresRoomStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::RoomStore for PostgresRoomStore {
    async fn get_by_remote_room(
        &self,
        remote_room_id: &str,
        kind: MappingKind,
    ) -> Result<Option<RoomMapping>, DatabaseError> {
        let remote_room_id = remote_room_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            room_mappings::table
                .filter(room_mappings::remote_room_id.eq(remote_room_id))
                .filter(room_mappings::kind.eq(kind.as_str()))
                .select(DbRoomMapping::as_select())
                .first::<DbRoomMapping>(conn)
                .optional()
                .map_err(query_error)?
                .map(RoomMapping::try_from)
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
        with_connection(self.pool.clone(), move |conn| {
            room_mappings::table
                .filter(room_mappings::matrix_room_id.eq(matrix_room_id))
                .filter(room_mappings::kind.eq(kind.as_str()))
                .select(DbRoomMapping::as_select())
                .first::<DbRoomMapping>(conn)
                .optional()
                .map_err(query_error)?
                .map(RoomMapping::try_from)
                .transpose()
        })
        .await
    }

    async fn insert_if_absent(&self, mapping: &RoomMapping) -> Result<bool, DatabaseError> {
        let mapping = mapping.clone();
        with_connection(self.pool.clone(), move |conn| {
            let new_mapping = NewRoomMapping {
                remote_room_id: &mapping.remote_room_id,
                matrix_room_id: &mapping.matrix_room_id,
                kind: mapping.kind.as_str(),
                created_at: &mapping.created_at,
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
        with_connection(self.pool.clone(), move |conn| {
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
        with_connection(self.pool.clone(), move |conn| {
            room_mappings::table
                .filter(room_mappings::kind.eq(kind.as_str()))
                .order(room_mappings::id.asc())
                .select(DbRoomMapping::as_select())
                .load::<DbRoomMapping>(conn)
                .map_err(query_error)?
                .into_iter()
                .map(RoomMapping::try_from)
                .collect()
        })
        .await
    }
}

pub struct PostgresUserStore {
    pool: Pool,
}

impl PostgresUserStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::UserStore for PostgresUserStore {
    async fn get_by_remote_user(
        &self,
        remote_user_id: &str,
    ) -> Result<Option<VirtualUser>, DatabaseError> {
        let remote_user_id = remote_user_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            virtual_users::table
                .filter(virtual_users::remote_user_id.eq(remote_user_id))
                .select(DbVirtualUser::as_select())
                .first::<DbVirtualUser>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn get_by_matrix_user(
        &self,
        matrix_user_id: &str,
    ) -> Result<Option<VirtualUser>, DatabaseError> {
        let matrix_user_id = matrix_user_id.to_string();
        with_connection(self.pool.clone(), move |conn| {
            virtual_users::table
                .filter(virtual_users::matrix_user_id.eq(matrix_user_id))
                .select(DbVirtualUser::as_select())
                .first::<DbVirtualUser>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn upsert_virtual_user(&self, user: &VirtualUser) -> Result<(), DatabaseError> {
        let user = user.clone();
        with_connection(self.pool.clone(), move |conn| {
            let new_user = NewVirtualUser {
                remote_user_id: &user.remote_user_id,
                matrix_user_id: &user.matrix_user_id,
                display_name: user.display_name.as_deref(),
                avatar_url: user.avatar_url.as_deref(),
                created_at: &user.created_at,
                updated_at: &user.updated_at,
            };
            let changes = UpdateVirtualUser {
                matrix_user_id: &user.matrix_user_id,
                display_name: user.display_name.as_deref(),
                avatar_url: user.avatar_url.as_deref(),
                updated_at: &user.updated_at,
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
