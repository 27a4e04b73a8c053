use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{DatabaseManager, MappingKind, RoomStore, UserStore};
use crate::error::BridgeError;
use crate::matrix::MatrixApi;
use crate::media::MediaResolver;
use crate::parsers::{DefaultMarkupRewriter, MarkupRewriter, MessageUtils, RewriteContext};

pub mod content;
pub mod identity;
pub mod locks;
pub mod power_levels;
pub mod profile_cache;
pub mod retry;
pub mod room_mapping;
#[cfg(test)]
pub mod testing;

use self::content::{ContentTransformer, RemoteMessage};
use self::identity::IdentityResolver;
use self::locks::KeyedLocks;
use self::power_levels::{PowerLevelPolicy, PowerLevelSynchronizer};
use self::profile_cache::ProfileCache;
use self::retry::retry_transient;
use self::room_mapping::RoomMappingService;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// An event observed on the remote platform.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    MessagePosted {
        remote_room_id: String,
        sender_remote_id: String,
        message: RemoteMessage,
    },
    AdminsChanged {
        remote_room_id: String,
        admins: BTreeSet<String>,
    },
    RoomBridged {
        remote_room_id: String,
        matrix_room_id: String,
        kind: MappingKind,
        admins: BTreeSet<String>,
    },
    RoomUnbridged {
        remote_room_id: String,
        kind: MappingKind,
    },
    ProfileChanged {
        remote_user_id: String,
        display_name: Option<String>,
        avatar_url: Option<String>,
    },
}

impl RemoteEvent {
    /// Events sharing a key are applied strictly in arrival order.
    pub fn ordering_key(&self) -> String {
        match self {
            RemoteEvent::MessagePosted { remote_room_id, .. }
            | RemoteEvent::AdminsChanged { remote_room_id, .. }
            | RemoteEvent::RoomBridged { remote_room_id, .. }
            | RemoteEvent::RoomUnbridged { remote_room_id, .. } => {
                format!("room:{remote_room_id}")
            }
            RemoteEvent::ProfileChanged { remote_user_id, .. } => format!("user:{remote_user_id}"),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            RemoteEvent::MessagePosted { .. } => "message_posted",
            RemoteEvent::AdminsChanged { .. } => "admins_changed",
            RemoteEvent::RoomBridged { .. } => "room_bridged",
            RemoteEvent::RoomUnbridged { .. } => "room_unbridged",
            RemoteEvent::ProfileChanged { .. } => "profile_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Delivered { event_id: String },
    Skipped { reason: String },
    PowerLevelsSynced { changed: usize, removed: usize },
    Mapped { matrix_room_id: String },
    Unmapped { existed: bool },
    ProfileUpdated { matrix_user_id: String },
}

pub struct BridgeCore {
    config: Arc<Config>,
    rooms: RoomMappingService,
    identities: Arc<IdentityResolver>,
    power_levels: PowerLevelSynchronizer,
    content: ContentTransformer,
    media: Arc<MediaResolver>,
    matrix: Arc<dyn MatrixApi>,
    locks: KeyedLocks,
}

impl BridgeCore {
    pub fn new(
        config: Arc<Config>,
        db_manager: &DatabaseManager,
        matrix: Arc<dyn MatrixApi>,
    ) -> Result<Self, BridgeError> {
        let rewriter = DefaultMarkupRewriter::new()
            .map_err(|e| BridgeError::Configuration(format!("markup rewriter: {e}")))?;
        Self::with_parts(
            config,
            db_manager.room_store(),
            db_manager.user_store(),
            matrix,
            Arc::new(rewriter),
        )
    }

    /// Fails when the configured power levels would let a room admin out-rank the bridge.
    pub fn with_parts(
        config: Arc<Config>,
        room_store: Arc<dyn RoomStore>,
        user_store: Arc<dyn UserStore>,
        matrix: Arc<dyn MatrixApi>,
        rewriter: Arc<dyn MarkupRewriter>,
    ) -> Result<Self, BridgeError> {
        let policy = PowerLevelPolicy::from_config(&config.power_levels)?;
        let request_timeout = config.matrix.request_timeout();

        let identities = Arc::new(IdentityResolver::new(
            matrix.clone(),
            user_store,
            ProfileCache::new(config.cache.capacity, config.cache.ttl()),
            &config.bridge.user_prefix,
            &config.bridge.domain,
            &config.bridge.bot_user_id(),
            request_timeout,
        ));
        let media = Arc::new(MediaResolver::new(
            config.media_origin(),
            config.media.max_download_bytes,
            config.media.download_timeout(),
        )?);

        Ok(Self {
            rooms: RoomMappingService::new(room_store),
            power_levels: PowerLevelSynchronizer::new(
                policy,
                identities.clone(),
                matrix.clone(),
                request_timeout,
            ),
            content: ContentTransformer::new(rewriter, media.clone()),
            identities,
            media,
            matrix,
            config,
            locks: KeyedLocks::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn room_mappings(&self) -> &RoomMappingService {
        &self.rooms
    }

    pub fn identities(&self) -> &IdentityResolver {
        &self.identities
    }

    pub fn power_levels(&self) -> &PowerLevelSynchronizer {
        &self.power_levels
    }

    pub fn content(&self) -> &ContentTransformer {
        &self.content
    }

    pub fn media(&self) -> &MediaResolver {
        &self.media
    }

    /// Applies one event. Events with the same ordering key never interleave.
    pub async fn handle_event(&self, event: RemoteEvent) -> Result<EventOutcome, BridgeError> {
        let key = event.ordering_key();
        let _guard = self.locks.lock(&key).await;
        debug!("handling {} key={}", event.name(), key);

        match event {
            RemoteEvent::MessagePosted {
                remote_room_id,
                sender_remote_id,
                message,
            } => {
                self.handle_message(&remote_room_id, &sender_remote_id, &message)
                    .await
            }
            RemoteEvent::AdminsChanged {
                remote_room_id,
                admins,
            } => self.handle_admins_changed(&remote_room_id, &admins).await,
            RemoteEvent::RoomBridged {
                remote_room_id,
                matrix_room_id,
                kind,
                admins,
            } => {
                self.handle_room_bridged(&remote_room_id, &matrix_room_id, kind, &admins)
                    .await
            }
            RemoteEvent::RoomUnbridged {
                remote_room_id,
                kind,
            } => self.handle_room_unbridged(&remote_room_id, kind).await,
            RemoteEvent::ProfileChanged {
                remote_user_id,
                display_name,
                avatar_url,
            } => {
                let identity = self
                    .retry(|| {
                        self.identities.refresh_profile(
                            &remote_user_id,
                            display_name.as_deref(),
                            avatar_url.as_deref(),
                        )
                    })
                    .await?;
                Ok(EventOutcome::ProfileUpdated {
                    matrix_user_id: identity.matrix_user_id,
                })
            }
        }
    }

    async fn handle_message(
        &self,
        remote_room_id: &str,
        sender_remote_id: &str,
        message: &RemoteMessage,
    ) -> Result<EventOutcome, BridgeError> {
        debug!(
            "remote message room={} sender={} body_len={} body_preview={}",
            remote_room_id,
            sender_remote_id,
            message.plain_text.len(),
            MessageUtils::preview_text(&message.plain_text)
        );

        let Some(matrix_room_id) = self
            .retry(|| self.rooms.get_matrix_room(remote_room_id, MappingKind::Live))
            .await?
        else {
            return Ok(skipped(format!("remote room {remote_room_id} is not bridged")));
        };

        let sender = self
            .retry(|| self.identities.resolve_virtual_identity(sender_remote_id))
            .await?;

        let ctx = RewriteContext {
            matrix_room_id: matrix_room_id.clone(),
            known_users: message
                .mentions
                .iter()
                .map(|(username, remote_user_id)| {
                    (
                        username.clone(),
                        self.identities.matrix_user_id_for(remote_user_id),
                    )
                })
                .collect(),
        };
        let transformed = self.content.transform(message, &ctx)?;
        let content = transformed.to_event_content();

        let matrix = self.matrix.as_ref();
        let request_timeout = self.config.matrix.request_timeout();
        let (room, sender_id, content) = (
            matrix_room_id.as_str(),
            sender.matrix_user_id.as_str(),
            &content,
        );
        let event_id = self
            .retry(|| async move {
                match tokio::time::timeout(
                    request_timeout,
                    matrix.send_message(room, sender_id, content),
                )
                .await
                {
                    Ok(result) => result.map_err(BridgeError::from_matrix),
                    Err(_) => Err(BridgeError::MatrixRequest(format!(
                        "send timed out after {request_timeout:?}"
                    ))),
                }
            })
            .await?;

        debug!(
            "delivered message room={} matrix_room={} event_id={}",
            remote_room_id, matrix_room_id, event_id
        );
        Ok(EventOutcome::Delivered { event_id })
    }

    async fn handle_admins_changed(
        &self,
        remote_room_id: &str,
        admins: &BTreeSet<String>,
    ) -> Result<EventOutcome, BridgeError> {
        let Some(matrix_room_id) = self
            .retry(|| self.rooms.get_matrix_room(remote_room_id, MappingKind::Live))
            .await?
        else {
            return Ok(skipped(format!("remote room {remote_room_id} is not bridged")));
        };

        self.sync_power_levels(&matrix_room_id, admins).await
    }

    async fn handle_room_bridged(
        &self,
        remote_room_id: &str,
        matrix_room_id: &str,
        kind: MappingKind,
        admins: &BTreeSet<String>,
    ) -> Result<EventOutcome, BridgeError> {
        self.retry(|| self.rooms.create_mapping(remote_room_id, matrix_room_id, kind))
            .await?;

        if kind == MappingKind::Live {
            if let Err(e) = self.sync_power_levels(matrix_room_id, admins).await {
                // the mapping stands; the next admin change re-syncs
                warn!(
                    "initial power level sync failed room={} matrix_room={}: {}",
                    remote_room_id, matrix_room_id, e
                );
            }
        }

        Ok(EventOutcome::Mapped {
            matrix_room_id: matrix_room_id.to_string(),
        })
    }

    async fn handle_room_unbridged(
        &self,
        remote_room_id: &str,
        kind: MappingKind,
    ) -> Result<EventOutcome, BridgeError> {
        let matrix_room_id = self
            .retry(|| self.rooms.get_matrix_room(remote_room_id, kind))
            .await?;
        let existed = self
            .retry(|| self.rooms.delete_mapping(remote_room_id, kind))
            .await?;

        if let (Some(matrix_room_id), MappingKind::Live) = (matrix_room_id, kind) {
            self.power_levels.forget_room(&matrix_room_id);
        }

        Ok(EventOutcome::Unmapped { existed })
    }

    async fn sync_power_levels(
        &self,
        matrix_room_id: &str,
        admins: &BTreeSet<String>,
    ) -> Result<EventOutcome, BridgeError> {
        let diff = self
            .retry(|| self.power_levels.sync_room(matrix_room_id, admins))
            .await?;
        Ok(EventOutcome::PowerLevelsSynced {
            changed: diff.changed.len(),
            removed: diff.removed.len(),
        })
    }

    async fn retry<T, F, Fut>(&self, op: F) -> Result<T, BridgeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        retry_transient(self.config.bridge.max_event_attempts, RETRY_BASE_DELAY, op).await
    }
}

fn skipped(reason: String) -> EventOutcome {
    debug!("skipping event: {}", reason);
    EventOutcome::Skipped { reason }
}

type EventReply = oneshot::Sender<Result<EventOutcome, BridgeError>>;

/// Feeds events to per-key worker tasks so that each room is processed in
/// arrival order while unrelated rooms run concurrently.
pub struct EventDispatcher {
    core: Arc<BridgeCore>,
    workers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<(RemoteEvent, EventReply)>>>>,
}

impl EventDispatcher {
    pub fn new(core: Arc<BridgeCore>) -> Self {
        Self {
            core,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn core(&self) -> &Arc<BridgeCore> {
        &self.core
    }

    pub fn active_workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Queues the event behind earlier events with the same ordering key.
    pub fn dispatch(
        &self,
        event: RemoteEvent,
    ) -> oneshot::Receiver<Result<EventOutcome, BridgeError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let key = event.ordering_key();

        let mut workers = self.workers.lock();
        let mut job = (event, reply_tx);
        if let Some(queue) = workers.get(&key) {
            match queue.send(job) {
                Ok(()) => return reply_rx,
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        if queue_tx.send(job).is_err() {
            error!("failed to queue event key={}", key);
        }
        workers.insert(key.clone(), queue_tx);
        tokio::spawn(run_worker(
            self.core.clone(),
            self.workers.clone(),
            key,
            queue_rx,
        ));

        reply_rx
    }
}

async fn run_worker(
    core: Arc<BridgeCore>,
    workers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<(RemoteEvent, EventReply)>>>>,
    key: String,
    mut queue: mpsc::UnboundedReceiver<(RemoteEvent, EventReply)>,
) {
    debug!("event worker started key={}", key);
    loop {
        let job = match tokio::time::timeout(WORKER_IDLE_TIMEOUT, queue.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => {
                let mut workers = workers.lock();
                match queue.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        workers.remove(&key);
                        break;
                    }
                }
            }
        };

        let (event, reply) = job;
        let name = event.name();
        let result = core.handle_event(event).await;
        match &result {
            Ok(outcome) => debug!("{} key={} outcome={:?}", name, key, outcome),
            Err(e) => error!("{} key={} failed, left unconsumed: {}", name, key, e),
        }
        let _ = reply.send(result);
    }
    info!("event worker stopped key={}", key);
}
