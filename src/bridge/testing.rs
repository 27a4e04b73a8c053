//! In-memory fakes for the bridge's collaborators.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::db::{DatabaseError, MappingKind, RoomMapping, RoomStore, UserStore, VirtualUser};
use crate::matrix::{HomeserverRejection, MatrixApi, MatrixProfile};

#[derive(Default)]
pub struct FakeMatrix {
    profiles: Mutex<HashMap<String, MatrixProfile>>,
    power_levels: Mutex<HashMap<String, BTreeMap<String, i64>>>,
    power_level_writes: Mutex<Vec<(String, BTreeMap<String, Option<i64>>)>>,
    sent: Mutex<Vec<(String, String, Value)>>,
    register_calls: AtomicUsize,
    profile_calls: AtomicUsize,
    failing_sends: AtomicUsize,
    power_level_attempts: AtomicUsize,
    reject_power_levels: AtomicBool,
    fail_profiles: AtomicBool,
    hang_profiles: AtomicBool,
}

impl FakeMatrix {
    pub fn set_profile_of(&self, matrix_user_id: &str, name: Option<&str>, avatar: Option<&str>) {
        self.profiles.lock().insert(
            matrix_user_id.to_string(),
            MatrixProfile {
                displayname: name.map(ToOwned::to_owned),
                avatar_url: avatar.map(ToOwned::to_owned),
            },
        );
    }

    pub fn set_room_users(&self, matrix_room_id: &str, users: BTreeMap<String, i64>) {
        self.power_levels
            .lock()
            .insert(matrix_room_id.to_string(), users);
    }

    pub fn room_users(&self, matrix_room_id: &str) -> BTreeMap<String, i64> {
        self.power_levels
            .lock()
            .get(matrix_room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn power_level_writes(&self) -> Vec<(String, BTreeMap<String, Option<i64>>)> {
        self.power_level_writes.lock().clone()
    }

    pub fn sent(&self) -> Vec<(String, String, Value)> {
        self.sent.lock().clone()
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    pub fn fail_profiles(&self, fail: bool) {
        self.fail_profiles.store(fail, Ordering::SeqCst);
    }

    pub fn hang_profiles(&self, hang: bool) {
        self.hang_profiles.store(hang, Ordering::SeqCst);
    }

    pub fn power_level_attempts(&self) -> usize {
        self.power_level_attempts.load(Ordering::SeqCst)
    }

    /// Answers power level writes the way a homeserver does when the sender lacks permission.
    pub fn reject_power_levels(&self, reject: bool) {
        self.reject_power_levels.store(reject, Ordering::SeqCst);
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl MatrixApi for FakeMatrix {
    async fn ensure_registered(&self, matrix_user_id: &str) -> Result<()> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.profiles
            .lock()
            .entry(matrix_user_id.to_string())
            .or_default();
        Ok(())
    }

    async fn get_profile(&self, matrix_user_id: &str) -> Result<MatrixProfile> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_profiles.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_profiles.load(Ordering::SeqCst) {
            return Err(anyhow!("connection reset by peer"));
        }
        Ok(self
            .profiles
            .lock()
            .get(matrix_user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_profile(&self, matrix_user_id: &str, profile: &MatrixProfile) -> Result<()> {
        self.profiles
            .lock()
            .insert(matrix_user_id.to_string(), profile.clone());
        Ok(())
    }

    async fn get_power_levels(&self, matrix_room_id: &str) -> Result<BTreeMap<String, i64>> {
        Ok(self.room_users(matrix_room_id))
    }

    async fn set_room_power_levels(
        &self,
        matrix_room_id: &str,
        changes: &BTreeMap<String, Option<i64>>,
    ) -> Result<()> {
        self.power_level_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_power_levels.load(Ordering::SeqCst) {
            return Err(HomeserverRejection {
                request: format!("writing power levels of {matrix_room_id}"),
                status: Some(403),
                errcode: Some("M_FORBIDDEN".to_string()),
                detail: "You don't have permission to change power levels".to_string(),
            }
            .into());
        }
        let mut rooms = self.power_levels.lock();
        let users = rooms.entry(matrix_room_id.to_string()).or_default();
        for (user, level) in changes {
            match level {
                Some(level) => {
                    users.insert(user.clone(), *level);
                }
                None => {
                    users.remove(user);
                }
            }
        }
        self.power_level_writes
            .lock()
            .push((matrix_room_id.to_string(), changes.clone()));
        Ok(())
    }

    async fn send_message(
        &self,
        matrix_room_id: &str,
        sender: &str,
        content: &Value,
    ) -> Result<String> {
        let should_fail = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(anyhow!("502 bad gateway"));
        }

        let mut sent = self.sent.lock();
        sent.push((
            matrix_room_id.to_string(),
            sender.to_string(),
            content.clone(),
        ));
        Ok(format!("$event{}", sent.len()))
    }
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, VirtualUser>>,
    fail: AtomicBool,
}

impl MemoryUserStore {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DatabaseError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DatabaseError::Connection("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_by_remote_user(
        &self,
        remote_user_id: &str,
    ) -> Result<Option<VirtualUser>, DatabaseError> {
        self.check()?;
        Ok(self.users.lock().get(remote_user_id).cloned())
    }

    async fn get_by_matrix_user(
        &self,
        matrix_user_id: &str,
    ) -> Result<Option<VirtualUser>, DatabaseError> {
        self.check()?;
        Ok(self
            .users
            .lock()
            .values()
            .find(|user| user.matrix_user_id == matrix_user_id)
            .cloned())
    }

    async fn upsert_virtual_user(&self, user: &VirtualUser) -> Result<(), DatabaseError> {
        self.check()?;
        self.users
            .lock()
            .insert(user.remote_user_id.clone(), user.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRoomStore {
    mappings: Mutex<Vec<RoomMapping>>,
    fail: AtomicBool,
}

impl MemoryRoomStore {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DatabaseError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DatabaseError::Connection("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn get_by_remote_room(
        &self,
        remote_room_id: &str,
        kind: MappingKind,
    ) -> Result<Option<RoomMapping>, DatabaseError> {
        self.check()?;
        Ok(self
            .mappings
            .lock()
            .iter()
            .find(|m| m.kind == kind && m.remote_room_id == remote_room_id)
            .cloned())
    }

    async fn get_by_matrix_room(
        &self,
        matrix_room_id: &str,
        kind: MappingKind,
    ) -> Result<Option<RoomMapping>, DatabaseError> {
        self.check()?;
        Ok(self
            .mappings
            .lock()
            .iter()
            .find(|m| m.kind == kind && m.matrix_room_id == matrix_room_id)
            .cloned())
    }

    async fn insert_if_absent(&self, mapping: &RoomMapping) -> Result<bool, DatabaseError> {
        self.check()?;
        let mut mappings = self.mappings.lock();
        let taken = mappings.iter().any(|m| {
            m.kind == mapping.kind
                && (m.remote_room_id == mapping.remote_room_id
                    || m.matrix_room_id == mapping.matrix_room_id)
        });
        if taken {
            return Ok(false);
        }
        let mut stored = mapping.clone();
        stored.id = mappings.len() as i64 + 1;
        mappings.push(stored);
        Ok(true)
    }

    async fn delete_by_remote_room(
        &self,
        remote_room_id: &str,
        kind: MappingKind,
    ) -> Result<bool, DatabaseError> {
        self.check()?;
        let mut mappings = self.mappings.lock();
        let before = mappings.len();
        mappings.retain(|m| !(m.kind == kind && m.remote_room_id == remote_room_id));
        Ok(mappings.len() != before)
    }

    async fn list_by_kind(&self, kind: MappingKind) -> Result<Vec<RoomMapping>, DatabaseError> {
        self.check()?;
        Ok(self
            .mappings
            .lock()
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect())
    }
}
