use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::PowerLevelsConfig;
use crate::error::BridgeError;
use crate::matrix::MatrixApi;

use super::identity::IdentityResolver;
use super::locks::KeyedLocks;

pub type PowerLevels = BTreeMap<String, i64>;

/// Desired authority layout for every bridged room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerLevelPolicy {
    bridge_user_level: i64,
    room_admin_level: i64,
    extra_admins: Vec<String>,
}

impl PowerLevelPolicy {
    /// Fails unless the bridge user strictly out-ranks room admins.
    pub fn new(
        bridge_user_level: i64,
        room_admin_level: i64,
        extra_admins: Vec<String>,
    ) -> Result<Self, BridgeError> {
        if bridge_user_level <= room_admin_level {
            return Err(BridgeError::Configuration(format!(
                "bridge user level ({bridge_user_level}) must be greater than room admin level ({room_admin_level})"
            )));
        }

        Ok(Self {
            bridge_user_level,
            room_admin_level,
            extra_admins,
        })
    }

    pub fn from_config(config: &PowerLevelsConfig) -> Result<Self, BridgeError> {
        Self::new(
            config.bridge_user_level,
            config.room_admin_level,
            config.extra_admins.clone(),
        )
    }

    pub fn bridge_user_level(&self) -> i64 {
        self.bridge_user_level
    }

    pub fn room_admin_level(&self) -> i64 {
        self.room_admin_level
    }

    pub fn extra_admins(&self) -> &[String] {
        &self.extra_admins
    }

    pub fn desired_levels<'a>(
        &self,
        bridge_user_id: &str,
        admin_user_ids: impl IntoIterator<Item = &'a str>,
    ) -> PowerLevels {
        let mut levels = PowerLevels::new();
        for admin in admin_user_ids {
            levels.insert(admin.to_string(), self.room_admin_level);
        }
        for admin in &self.extra_admins {
            levels.insert(admin.clone(), self.room_admin_level);
        }
        levels.insert(bridge_user_id.to_string(), self.bridge_user_level);
        levels
    }
}

/// Changes needed to move a room from its current levels to the desired ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PowerLevelDiff {
    pub changed: PowerLevels,
    pub removed: BTreeSet<String>,
}

impl PowerLevelDiff {
    /// Only `managed` users are ever removed. Users currently at or above
    /// `ceiling` are left alone, since the homeserver refuses to change them.
    pub fn between(
        desired: &PowerLevels,
        current: &PowerLevels,
        managed: &BTreeSet<String>,
        ceiling: i64,
    ) -> Self {
        let below_ceiling = |user: &String| current.get(user).is_none_or(|level| *level < ceiling);

        let changed = desired
            .iter()
            .filter(|(user, level)| current.get(*user) != Some(*level) && below_ceiling(*user))
            .map(|(user, level)| (user.clone(), *level))
            .collect();

        let removed = managed
            .iter()
            .filter(|user| {
                current.contains_key(*user) && below_ceiling(*user) && !desired.contains_key(*user)
            })
            .cloned()
            .collect();

        Self { changed, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn as_changes(&self) -> BTreeMap<String, Option<i64>> {
        self.changed
            .iter()
            .map(|(user, level)| (user.clone(), Some(*level)))
            .chain(self.removed.iter().map(|user| (user.clone(), None)))
            .collect()
    }

    fn apply_to(&self, levels: &mut PowerLevels) {
        levels.extend(self.changed.iter().map(|(u, l)| (u.clone(), *l)));
        levels.retain(|user, _| !self.removed.contains(user));
    }
}

/// What the bridge knows about one room's `users` map.
#[derive(Debug, Clone, Default)]
struct RoomLevels {
    current: PowerLevels,
    /// Users whose entry the bridge wrote and may therefore remove.
    managed: BTreeSet<String>,
}

pub struct PowerLevelSynchronizer {
    policy: PowerLevelPolicy,
    identities: Arc<IdentityResolver>,
    matrix: Arc<dyn MatrixApi>,
    rooms: Mutex<HashMap<String, RoomLevels>>,
    locks: KeyedLocks,
    request_timeout: Duration,
}

impl PowerLevelSynchronizer {
    pub fn new(
        policy: PowerLevelPolicy,
        identities: Arc<IdentityResolver>,
        matrix: Arc<dyn MatrixApi>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            identities,
            matrix,
            rooms: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
            request_timeout,
        }
    }

    pub fn policy(&self) -> &PowerLevelPolicy {
        &self.policy
    }

    pub async fn compute_desired_power_levels(
        &self,
        room_admins: &BTreeSet<String>,
    ) -> Result<PowerLevels, BridgeError> {
        let mut admin_ids = Vec::with_capacity(room_admins.len());
        for remote_user_id in room_admins {
            let identity = self
                .identities
                .resolve_virtual_identity(remote_user_id)
                .await?;
            admin_ids.push(identity.matrix_user_id);
        }

        Ok(self.policy.desired_levels(
            self.identities.bridge_user_id(),
            admin_ids.iter().map(String::as_str),
        ))
    }

    /// Brings the room's power levels in line with the policy, writing only changed entries.
    pub async fn sync_room(
        &self,
        matrix_room_id: &str,
        room_admins: &BTreeSet<String>,
    ) -> Result<PowerLevelDiff, BridgeError> {
        let _guard = self.locks.lock(matrix_room_id).await;

        let desired = self.compute_desired_power_levels(room_admins).await?;
        let known = self.rooms.lock().get(matrix_room_id).cloned();
        let mut room = match known {
            Some(room) => room,
            None => self.baseline(matrix_room_id).await?,
        };

        let diff = PowerLevelDiff::between(
            &desired,
            &room.current,
            &room.managed,
            self.policy.bridge_user_level,
        );
        if !diff.is_empty() {
            self.call(
                self.matrix
                    .set_room_power_levels(matrix_room_id, &diff.as_changes()),
            )
            .await?;
            info!(
                "updated power levels room={} changed={} removed={}",
                matrix_room_id,
                diff.changed.len(),
                diff.removed.len()
            );
        } else {
            debug!("power levels already in sync room={}", matrix_room_id);
        }

        diff.apply_to(&mut room.current);
        room.managed = desired.into_keys().collect();
        self.rooms.lock().insert(matrix_room_id.to_string(), room);
        Ok(diff)
    }

    /// Drops the remembered state so the next sync re-reads it from Matrix.
    pub fn forget_room(&self, matrix_room_id: &str) {
        self.rooms.lock().remove(matrix_room_id);
    }

    /// Reads the live map. Of the users already in it, only ghosts at the
    /// admin level count as the bridge's own.
    async fn baseline(&self, matrix_room_id: &str) -> Result<RoomLevels, BridgeError> {
        let current = self
            .call(self.matrix.get_power_levels(matrix_room_id))
            .await?;
        let managed = current
            .iter()
            .filter(|(user, level)| {
                **level == self.policy.room_admin_level && self.identities.is_virtual_user(user)
            })
            .map(|(user, _)| user.clone())
            .collect();
        Ok(RoomLevels { current, managed })
    }

    async fn call<T>(
        &self,
        request: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, BridgeError> {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(BridgeError::from_matrix),
            Err(_) => Err(BridgeError::MatrixRequest(format!(
                "timed out after {:?}",
                self.request_timeout
            ))),
        }
    }
}
