use std::sync::Arc;

use tracing::{info, warn};

use crate::db::{MappingKind, RoomMapping, RoomStore};
use crate::error::BridgeError;

pub struct RoomMappingService {
    store: Arc<dyn RoomStore>,
}

impl RoomMappingService {
    pub fn new(store: Arc<dyn RoomStore>) -> Self {
        Self { store }
    }

    pub async fn get_matrix_room(
        &self,
        remote_room_id: &str,
        kind: MappingKind,
    ) -> Result<Option<String>, BridgeError> {
        Ok(self
            .store
            .get_by_remote_room(remote_room_id, kind)
            .await?
            .map(|mapping| mapping.matrix_room_id))
    }

    pub async fn get_remote_room(
        &self,
        matrix_room_id: &str,
        kind: MappingKind,
    ) -> Result<Option<String>, BridgeError> {
        Ok(self
            .store
            .get_by_matrix_room(matrix_room_id, kind)
            .await?
            .map(|mapping| mapping.remote_room_id))
    }

    /// Records a new association. Existing mappings are never overwritten.
    pub async fn create_mapping(
        &self,
        remote_room_id: &str,
        matrix_room_id: &str,
        kind: MappingKind,
    ) -> Result<RoomMapping, BridgeError> {
        let mapping = RoomMapping::new(remote_room_id, matrix_room_id, kind);

        if !self.store.insert_if_absent(&mapping).await? {
            warn!(
                "refusing to overwrite {} mapping remote_room={} matrix_room={}",
                kind, remote_room_id, matrix_room_id
            );
            return Err(BridgeError::AlreadyMapped {
                remote_room_id: remote_room_id.to_string(),
                matrix_room_id: matrix_room_id.to_string(),
                kind,
            });
        }

        info!(
            "created {} mapping remote_room={} matrix_room={}",
            kind, remote_room_id, matrix_room_id
        );
        Ok(mapping)
    }

    pub async fn delete_mapping(
        &self,
        remote_room_id: &str,
        kind: MappingKind,
    ) -> Result<bool, BridgeError> {
        let deleted = self.store.delete_by_remote_room(remote_room_id, kind).await?;
        if deleted {
            info!("deleted {} mapping remote_room={}", kind, remote_room_id);
        }
        Ok(deleted)
    }

    pub async fn list_mappings(&self, kind: MappingKind) -> Result<Vec<RoomMapping>, BridgeError> {
        Ok(self.store.list_by_kind(kind).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bridge::testing::MemoryRoomStore;

    fn service() -> (RoomMappingService, Arc<MemoryRoomStore>) {
        let store = Arc::new(MemoryRoomStore::default());
        (RoomMappingService::new(store.clone()), store)
    }

    #[tokio::test]
    async fn second_live_mapping_for_same_source_is_rejected() {
        let (service, _) = service();
        service
            .create_mapping("room-1", "!a:example.org", MappingKind::Live)
            .await
            .unwrap();

        let err = service
            .create_mapping("room-1", "!b:example.org", MappingKind::Live)
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::AlreadyMapped { kind: MappingKind::Live, .. }));
        assert_eq!(
            service.get_matrix_room("room-1", MappingKind::Live).await.unwrap().as_deref(),
            Some("!a:example.org")
        );
    }

    #[tokio::test]
    async fn live_and_historical_mappings_coexist() {
        let (service, _) = service();
        service
            .create_mapping("room-1", "!live:example.org", MappingKind::Live)
            .await
            .unwrap();
        service
            .create_mapping("room-1", "!archive:example.org", MappingKind::Historical)
            .await
            .unwrap();

        assert_eq!(
            service
                .get_remote_room("!archive:example.org", MappingKind::Historical)
                .await
                .unwrap()
                .as_deref(),
            Some("room-1")
        );
        assert!(
            service
                .get_remote_room("!archive:example.org", MappingKind::Live)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn target_room_cannot_be_shared() {
        let (service, _) = service();
        service
            .create_mapping("room-1", "!a:example.org", MappingKind::Live)
            .await
            .unwrap();

        assert!(
            service
                .create_mapping("room-2", "!a:example.org", MappingKind::Live)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn store_outage_is_not_reported_as_absent() {
        let (service, store) = service();
        store.fail(true);

        let err = service
            .get_matrix_room("room-1", MappingKind::Live)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn unmapping_allows_a_new_mapping() {
        let (service, _) = service();
        service
            .create_mapping("room-1", "!a:example.org", MappingKind::Live)
            .await
            .unwrap();
        assert!(service.delete_mapping("room-1", MappingKind::Live).await.unwrap());

        service
            .create_mapping("room-1", "!b:example.org", MappingKind::Live)
            .await
            .unwrap();
        assert_eq!(service.list_mappings(MappingKind::Live).await.unwrap().len(), 1);
    }
}
