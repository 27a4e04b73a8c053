use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::db::{UserStore, VirtualUser};
use crate::error::BridgeError;
use crate::matrix::{MatrixApi, MatrixProfile};

use super::locks::KeyedLocks;
use super::profile_cache::{CachedProfile, ProfileCache};

/// The Matrix ghost user standing in for one remote user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualIdentity {
    pub remote_user_id: String,
    pub matrix_user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Escapes a remote user id into the Matrix localpart alphabet.
///
/// Bytes outside `a-z 0-9 . _ - /` become `=xx`, so the mapping is injective.
pub fn sanitize_localpart(remote_user_id: &str) -> String {
    let mut localpart = String::with_capacity(remote_user_id.len());
    for byte in remote_user_id.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' | b'/' => localpart.push(byte as char),
            _ => {
                let _ = write!(localpart, "={byte:02x}");
            }
        }
    }
    localpart
}

pub fn derive_matrix_user_id(remote_user_id: &str, user_prefix: &str, domain: &str) -> String {
    format!(
        "@{}{}:{}",
        user_prefix,
        sanitize_localpart(remote_user_id),
        domain
    )
}

pub struct IdentityResolver {
    matrix: Arc<dyn MatrixApi>,
    user_store: Arc<dyn UserStore>,
    cache: ProfileCache,
    locks: KeyedLocks,
    user_prefix: String,
    domain: String,
    bridge_user_id: String,
    request_timeout: Duration,
}

impl IdentityResolver {
    pub fn new(
        matrix: Arc<dyn MatrixApi>,
        user_store: Arc<dyn UserStore>,
        cache: ProfileCache,
        user_prefix: &str,
        domain: &str,
        bridge_user_id: &str,
        request_timeout: Duration,
    ) -> Self {
        Self {
            matrix,
            user_store,
            cache,
            locks: KeyedLocks::new(),
            user_prefix: user_prefix.to_string(),
            domain: domain.to_string(),
            bridge_user_id: bridge_user_id.to_string(),
            request_timeout,
        }
    }

    pub fn matrix_user_id_for(&self, remote_user_id: &str) -> String {
        derive_matrix_user_id(remote_user_id, &self.user_prefix, &self.domain)
    }

    /// Whether the Matrix user lives in the bridge's ghost namespace.
    pub fn is_virtual_user(&self, matrix_user_id: &str) -> bool {
        matrix_user_id != self.bridge_user_id
            && matrix_user_id
                .strip_prefix('@')
                .and_then(|rest| rest.strip_prefix(self.user_prefix.as_str()))
                .and_then(|rest| rest.rsplit_once(':'))
                .is_some_and(|(local, server)| !local.is_empty() && server == self.domain)
    }

    pub fn bridge_user_id(&self) -> &str {
        &self.bridge_user_id
    }

    pub fn cache(&self) -> &ProfileCache {
        &self.cache
    }

    pub async fn resolve_virtual_identity(
        &self,
        remote_user_id: &str,
    ) -> Result<VirtualIdentity, BridgeError> {
        let matrix_user_id = self.matrix_user_id_for(remote_user_id);

        if let Some(cached) = self.cache.get(remote_user_id) {
            return Ok(identity_from_cache(remote_user_id, matrix_user_id, cached));
        }

        let _guard = self.locks.lock(remote_user_id).await;
        // a concurrent resolution may have filled the cache while we waited
        if let Some(cached) = self.cache.get(remote_user_id) {
            return Ok(identity_from_cache(remote_user_id, matrix_user_id, cached));
        }

        debug!(
            "profile cache miss remote_user={} matrix_user={}",
            remote_user_id, matrix_user_id
        );
        let profile = self.live_resolve(&matrix_user_id).await?;
        self.record(remote_user_id, &matrix_user_id, &profile).await?;

        self.cache.insert(
            remote_user_id,
            CachedProfile {
                matrix_user_id: matrix_user_id.clone(),
                display_name: profile.displayname.clone(),
                avatar_url: profile.avatar_url.clone(),
            },
        );

        Ok(VirtualIdentity {
            remote_user_id: remote_user_id.to_string(),
            matrix_user_id,
            display_name: profile.displayname,
            avatar_url: profile.avatar_url,
        })
    }

    /// Pushes a changed remote profile to the ghost user and drops the cached copy.
    pub async fn refresh_profile(
        &self,
        remote_user_id: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<VirtualIdentity, BridgeError> {
        let matrix_user_id = self.matrix_user_id_for(remote_user_id);
        let _guard = self.locks.lock(remote_user_id).await;

        let profile = MatrixProfile {
            displayname: display_name.map(ToOwned::to_owned),
            avatar_url: avatar_url.map(ToOwned::to_owned),
        };

        self.with_timeout(&matrix_user_id, self.matrix.ensure_registered(&matrix_user_id))
            .await?;
        self.with_timeout(
            &matrix_user_id,
            self.matrix.set_profile(&matrix_user_id, &profile),
        )
        .await?;

        self.cache.invalidate(remote_user_id);
        self.record(remote_user_id, &matrix_user_id, &profile).await?;

        Ok(VirtualIdentity {
            remote_user_id: remote_user_id.to_string(),
            matrix_user_id,
            display_name: profile.displayname,
            avatar_url: profile.avatar_url,
        })
    }

    /// Reverse lookup, limited to ghost users this bridge created.
    pub async fn remote_user_for(
        &self,
        matrix_user_id: &str,
    ) -> Result<Option<String>, BridgeError> {
        Ok(self
            .user_store
            .get_by_matrix_user(matrix_user_id)
            .await?
            .map(|user| user.remote_user_id))
    }

    async fn live_resolve(&self, matrix_user_id: &str) -> Result<MatrixProfile, BridgeError> {
        self.with_timeout(matrix_user_id, self.matrix.ensure_registered(matrix_user_id))
            .await?;
        self.with_timeout(matrix_user_id, self.matrix.get_profile(matrix_user_id))
            .await
    }

    async fn record(
        &self,
        remote_user_id: &str,
        matrix_user_id: &str,
        profile: &MatrixProfile,
    ) -> Result<(), BridgeError> {
        let now = Utc::now();
        self.user_store
            .upsert_virtual_user(&VirtualUser {
                id: 0,
                remote_user_id: remote_user_id.to_string(),
                matrix_user_id: matrix_user_id.to_string(),
                display_name: profile.displayname.clone(),
                avatar_url: profile.avatar_url.clone(),
                created_at: now,
                updated_at: now,
            })
            .await?;
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        matrix_user_id: &str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, BridgeError> {
        let failed = |reason: String| {
            warn!("identity resolution failed for {}: {}", matrix_user_id, reason);
            BridgeError::ResolutionFailed {
                matrix_user_id: matrix_user_id.to_string(),
                reason,
            }
        };

        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(failed(e.to_string())),
            Err(_) => Err(failed(format!(
                "timed out after {:?}",
                self.request_timeout
            ))),
        }
    }
}

fn identity_from_cache(
    remote_user_id: &str,
    matrix_user_id: String,
    cached: CachedProfile,
) -> VirtualIdentity {
    VirtualIdentity {
        remote_user_id: remote_user_id.to_string(),
        matrix_user_id,
        display_name: cached.display_name,
        avatar_url: cached.avatar_url,
    }
}
