//! In-memory session store.
//!
//! Maps conversation ids to conversation state. Each conversation has a
//! live copy guarded by an async mutex, held for the whole of a turn, and a
//! committed snapshot that readers (`get`, `list`) see without waiting on a
//! running turn.
//!
//! The store is bounded: idle conversations older than the TTL are purged
//! whenever a conversation is opened, and when the map is full the least
//! recently active idle conversation is evicted. A conversation with a turn
//! in flight is never evicted.
//!
//! Resetting a conversation whose turn is still running keeps its slot, so
//! the id stays busy until that turn's lease is released; the release then
//! discards the turn's state instead of publishing it.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use anjia_config::SessionsConfig;
use anjia_core::error::SessionError;
use anjia_core::message::{Conversation, ConversationId, ConversationStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct Slot {
    live: Arc<Mutex<Conversation>>,
    committed: StdRwLock<Committed>,
    /// Set by a reset that found the conversation busy
    discarded: AtomicBool,
}

struct Committed {
    conversation: Conversation,
    touched: Instant,
}

impl Slot {
    fn new(conversation: Conversation) -> Self {
        Self {
            committed: StdRwLock::new(Committed {
                conversation: conversation.clone(),
                touched: Instant::now(),
            }),
            live: Arc::new(Mutex::new(conversation)),
            discarded: AtomicBool::new(false),
        }
    }

    /// Reset a conversation whose lease is held elsewhere. Readers see an
    /// empty conversation at once; the live copy is cleared on release.
    fn discard(&self, id: &ConversationId) {
        self.discarded.store(true, Ordering::SeqCst);
        self.publish(&Conversation::new(id.clone()));
    }

    /// Clear `conversation` if a reset is pending on it.
    fn apply_discard(&self, conversation: &mut Conversation) {
        if self.discarded.swap(false, Ordering::SeqCst) {
            *conversation = Conversation::new(conversation.id.clone());
        }
    }

    fn publish(&self, conversation: &Conversation) {
        let mut committed = self.committed.write().unwrap_or_else(PoisonError::into_inner);
        committed.conversation = conversation.clone();
        committed.touched = Instant::now();
    }

    fn read<T>(&self, f: impl FnOnce(&Committed) -> T) -> T {
        f(&self.committed.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn is_busy(&self) -> bool {
        self.live.try_lock().is_err()
    }
}

/// Exclusive access to one conversation for the duration of a turn.
///
/// Dropping the lease publishes the final state to readers and releases
/// the conversation for the next request.
///
/// A lease dropped while its turn is still open (the task running the turn
/// was cancelled) marks the conversation `Failed`.
pub struct ConversationLease {
    guard: OwnedMutexGuard<Conversation>,
    slot: Arc<Slot>,
    created: bool,
    in_turn: bool,
}

impl ConversationLease {
    fn new(mut guard: OwnedMutexGuard<Conversation>, slot: Arc<Slot>, created: bool) -> Self {
        slot.apply_discard(&mut guard);
        Self {
            guard,
            slot,
            created,
            in_turn: false,
        }
    }

    /// Whether this conversation was created by this request.
    pub fn is_new(&self) -> bool {
        self.created
    }

    /// Mark the conversation `Active` for a new turn.
    pub fn begin_turn(&mut self) {
        self.guard.transition(ConversationStatus::Active);
        self.in_turn = true;
    }

    /// Close the open turn with a terminal status.
    pub fn end_turn(&mut self, status: ConversationStatus) {
        self.guard.transition(status);
        self.in_turn = false;
    }

    /// Make the current state visible to readers. A no-op once the
    /// conversation has been reset.
    pub fn checkpoint(&self) {
        if !self.slot.discarded.load(Ordering::SeqCst) {
            self.slot.publish(&self.guard);
        }
    }
}

impl Deref for ConversationLease {
    type Target = Conversation;

    fn deref(&self) -> &Conversation {
        &self.guard
    }
}

impl DerefMut for ConversationLease {
    fn deref_mut(&mut self) -> &mut Conversation {
        &mut self.guard
    }
}

impl Drop for ConversationLease {
    fn drop(&mut self) {
        if self.in_turn {
            warn!(conversation_id = %self.guard.id, "Turn abandoned before finishing");
            self.guard.transition(ConversationStatus::Failed);
        }
        self.slot.apply_discard(&mut self.guard);
        self.slot.publish(&self.guard);
    }
}

/// Summary of one conversation, as reported by the session endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: usize,
    pub iterations: u32,
    pub status: ConversationStatus,
}

impl From<&Conversation> for SessionSummary {
    fn from(conv: &Conversation) -> Self {
        Self {
            conversation_id: conv.id.to_string(),
            created_at: conv.created_at,
            last_activity: conv.last_activity,
            message_count: conv.messages.len(),
            iterations: conv.iterations,
            status: conv.status,
        }
    }
}

pub struct SessionStore {
    sessions: RwLock<HashMap<ConversationId, Arc<Slot>>>,
    max_sessions: usize,
    idle_ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::from_config(&SessionsConfig::default())
    }
}

impl SessionStore {
    pub fn new(max_sessions: usize, idle_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions: max_sessions.max(1),
            idle_ttl,
        }
    }

    pub fn from_config(config: &SessionsConfig) -> Self {
        Self::new(config.max_sessions, config.idle_ttl())
    }

    /// Open the conversation `id` for a turn, creating it if unknown.
    /// Without an id a fresh conversation with a generated id is created.
    ///
    /// Fails with `ConversationBusy` when another turn holds it.
    pub async fn get_or_create(&self, id: Option<&str>) -> Result<ConversationLease, SessionError> {
        let mut sessions = self.sessions.write().await;
        self.purge_expired(&mut sessions);

        let id = id.map(ConversationId::from).unwrap_or_default();

        if let Some(slot) = sessions.get(&id) {
            let guard = slot
                .live
                .clone()
                .try_lock_owned()
                .map_err(|_| SessionError::ConversationBusy(id.to_string()))?;
            return Ok(ConversationLease::new(guard, slot.clone(), false));
        }

        if sessions.len() >= self.max_sessions {
            Self::evict_one(&mut sessions);
        }

        let slot = Arc::new(Slot::new(Conversation::new(id.clone())));
        let guard = slot
            .live
            .clone()
            .try_lock_owned()
            .map_err(|_| SessionError::ConversationBusy(id.to_string()))?;
        sessions.insert(id.clone(), slot.clone());
        debug!(conversation_id = %id, total = sessions.len(), "Created conversation");

        Ok(ConversationLease::new(guard, slot, true))
    }

    /// Committed state of a conversation.
    pub async fn get(&self, id: &str) -> Result<Conversation, SessionError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&ConversationId::from(id))
            .map(|slot| slot.read(|c| c.conversation.clone()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub async fn summary(&self, id: &str) -> Result<SessionSummary, SessionError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(&ConversationId::from(id))
            .map(|slot| slot.read(|c| SessionSummary::from(&c.conversation)))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// All conversations, oldest first.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<_> = sessions
            .values()
            .map(|slot| slot.read(|c| SessionSummary::from(&c.conversation)))
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Discard one conversation, or all of them when `id` is `None`.
    /// Returns how many were reset.
    ///
    /// Idle conversations are removed. A conversation with a turn in flight
    /// stays in the map, empty and busy until that turn ends; the turn's
    /// results are dropped.
    pub async fn reset(&self, id: Option<&str>) -> Result<usize, SessionError> {
        let mut sessions = self.sessions.write().await;
        match id {
            Some(id) => {
                let key = ConversationId::from(id);
                let busy = sessions
                    .get(&key)
                    .ok_or_else(|| SessionError::NotFound(id.to_string()))?
                    .is_busy();
                if busy {
                    if let Some(slot) = sessions.get(&key) {
                        slot.discard(&key);
                    }
                } else {
                    sessions.remove(&key);
                }
                info!(conversation_id = %id, busy, "Conversation reset");
                Ok(1)
            }
            None => {
                let count = sessions.len();
                sessions.retain(|id, slot| {
                    let busy = slot.is_busy();
                    if busy {
                        slot.discard(id);
                    }
                    busy
                });
                info!(count, still_running = sessions.len(), "All conversations reset");
                Ok(count)
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn is_busy(&self, id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(&ConversationId::from(id))
            .is_some_and(|slot| slot.is_busy())
    }

    fn purge_expired(&self, sessions: &mut HashMap<ConversationId, Arc<Slot>>) {
        let before = sessions.len();
        sessions.retain(|_, slot| slot.is_busy() || slot.read(|c| c.touched.elapsed()) < self.idle_ttl);
        let purged = before - sessions.len();
        if purged > 0 {
            debug!(purged, "Purged idle conversations");
        }
    }

    fn evict_one(sessions: &mut HashMap<ConversationId, Arc<Slot>>) {
        let oldest = sessions
            .iter()
            .filter(|(_, slot)| !slot.is_busy())
            .min_by_key(|(_, slot)| slot.read(|c| c.touched))
            .map(|(id, _)| id.clone());

        match oldest {
            Some(id) => {
                sessions.remove(&id);
                warn!(conversation_id = %id, "Session store full, evicted least recently active conversation");
            }
            None => warn!(total = sessions.len(), "Session store full and every conversation is busy"),
        }
    }
}
