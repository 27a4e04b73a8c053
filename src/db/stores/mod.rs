use async_trait::async_trait;

use super::DatabaseError;
use super::models::{MappingKind, RoomMapping, VirtualUser};

#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn get_by_remote_room(
        &self,
        remote_room_id: &str,
        kind: MappingKind,
    ) -> Result<Option<RoomMapping>, DatabaseError>;
    async fn get_by_matrix_room(
        &self,
        matrix_room_id: &str,
        kind: MappingKind,
    ) -> Result<Option<RoomMapping>, DatabaseError>;
    /// Inserts the mapping unless either room already has one of the same kind.
    /// Returns whether a row was written.
    async fn insert_if_absent(&self, mapping: &RoomMapping) -> Result<bool, DatabaseError>;
    async fn delete_by_remote_room(
        &self,
        remote_room_id: &str,
        kind: MappingKind,
    ) -> Result<bool, DatabaseError>;
    async fn list_by_kind(&self, kind: MappingKind) -> Result<Vec<RoomMapping>, DatabaseError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_remote_user(
        &self,
        remote_user_id: &str,
    ) -> Result<Option<VirtualUser>, DatabaseError>;
    async fn get_by_matrix_user(
        &self,
        matrix_user_id: &str,
    ) -> Result<Option<VirtualUser>, DatabaseError>;
    async fn upsert_virtual_user(&self, user: &VirtualUser) -> Result<(), DatabaseError>;
}
