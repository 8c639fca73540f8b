//! Session registry: lifecycle, roster, and the append-only logs.
//!
//! The registry owns every live diagnosis session. The session map is sharded
//! so sessions on different shards never contend; all mutation of a single
//! session's state (roster, recommendation log, workspace log) is serialized
//! by that session's own mutex. Nothing is awaited while a session lock is
//! held except the lock acquisition itself; deliveries into participant
//! outboxes are non-blocking `try_send`s.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::models::{
    Participant, Recommendation, SessionEvent, SessionSnapshot, SessionStatus, SessionSummary,
    WorkspaceEvent,
};

/// Number of independent shards in the session map.
const SHARD_COUNT: usize = 16;

/// Delivery handle for a participant's connection.
pub type Outbox = mpsc::Sender<SessionEvent>;

/// Generate a collision-resistant session id.
///
/// UUIDv7: a millisecond-ordered prefix plus 74 random bits, so ids racing
/// through concurrent creation stay distinct without consulting the registry.
/// The registry still enforces uniqueness as a hard invariant on insert.
pub fn new_session_id() -> String {
    Uuid::now_v7().to_string()
}

/// Registry tunables, resolved from server configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a session may sit with an empty roster before the sweep
    /// closes it. Also how long a Closed session stays readable before
    /// eviction.
    pub idle_timeout: Duration,
    /// Interval between idle sweep passes.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

pub(crate) struct ParticipantEntry {
    pub(crate) info: Participant,
    pub(crate) outbox: Outbox,
}

/// Mutable state of one session. Always accessed through
/// [`SessionHandle::state`], which serializes every mutation.
pub(crate) struct SessionState {
    pub(crate) title: String,
    pub(crate) creator_id: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) status: SessionStatus,
    pub(crate) participants: HashMap<String, ParticipantEntry>,
    pub(crate) recommendations: Vec<Recommendation>,
    recommendation_ids: HashSet<String>,
    pub(crate) workspace_log: Vec<WorkspaceEvent>,
    /// Set while the roster is empty; cleared on join.
    idle_since: Option<Instant>,
    /// Set once on close; the sweep evicts the entry after another
    /// idle-timeout window.
    closed_at: Option<Instant>,
}

impl SessionState {
    pub(crate) fn snapshot(&self, session_id: &str) -> SessionSnapshot {
        let mut participants: Vec<Participant> =
            self.participants.values().map(|e| e.info.clone()).collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        SessionSnapshot {
            session_id: session_id.to_string(),
            title: self.title.clone(),
            creator_id: self.creator_id.clone(),
            created_at: self.created_at,
            status: self.status,
            participants,
            recommendations: self.recommendations.clone(),
            workspace_log: self.workspace_log.clone(),
        }
    }

    /// Push an event to every participant except `exclude`. Best-effort:
    /// a full or closed outbox drops that single delivery.
    fn notify_others(&self, exclude: &str, event: &SessionEvent) {
        for entry in self.participants.values() {
            if entry.info.user_id == exclude {
                continue;
            }
            if let Err(e) = entry.outbox.try_send(event.clone()) {
                warn!(
                    recipient = %entry.info.user_id,
                    "dropping roster notification: {}", e
                );
            }
        }
    }
}

pub(crate) struct SessionHandle {
    pub(crate) session_id: String,
    /// Cancelled when the session closes. Per-session timers (negotiation
    /// watchdogs) are child tokens of this one.
    pub(crate) cancel: CancellationToken,
    pub(crate) state: Mutex<SessionState>,
}

/// Concurrency-safe store of all live sessions.
pub struct SessionRegistry {
    shards: Vec<RwLock<HashMap<String, Arc<SessionHandle>>>>,
    config: RegistryConfig,
    /// Parent token for the sweep task and every per-session token.
    cancel: CancellationToken,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    fn shard(&self, session_id: &str) -> &RwLock<HashMap<String, Arc<SessionHandle>>> {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    pub(crate) async fn lookup(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.shard(session_id).read().await.get(session_id).cloned()
    }

    /// Create an Active session under the caller-supplied id.
    ///
    /// Uniqueness is a hard invariant: a racing duplicate loses with
    /// [`RegistryError::DuplicateSession`], decided under the shard's write
    /// lock rather than by a best-effort pre-check.
    pub async fn create_session(
        &self,
        session_id: &str,
        title: &str,
        creator_id: &str,
    ) -> Result<SessionSnapshot, RegistryError> {
        let created_at = Utc::now();
        let handle = Arc::new(SessionHandle {
            session_id: session_id.to_string(),
            cancel: self.cancel.child_token(),
            state: Mutex::new(SessionState {
                title: title.to_string(),
                creator_id: creator_id.to_string(),
                created_at,
                status: SessionStatus::Active,
                participants: HashMap::new(),
                recommendations: Vec::new(),
                recommendation_ids: HashSet::new(),
                workspace_log: Vec::new(),
                // An empty session starts its idle clock immediately.
                idle_since: Some(Instant::now()),
                closed_at: None,
            }),
        });

        {
            let mut shard = self.shard(session_id).write().await;
            if shard.contains_key(session_id) {
                return Err(RegistryError::DuplicateSession(session_id.to_string()));
            }
            shard.insert(session_id.to_string(), handle);
        }

        info!(session = %session_id, creator = %creator_id, "session created");
        Ok(SessionSnapshot {
            session_id: session_id.to_string(),
            title: title.to_string(),
            creator_id: creator_id.to_string(),
            created_at,
            status: SessionStatus::Active,
            participants: Vec::new(),
            recommendations: Vec::new(),
            workspace_log: Vec::new(),
        })
    }

    /// Idempotent upsert keyed by `user_id`: re-joining rebinds the socket
    /// and outbox without duplicating the roster entry. Returns the full
    /// snapshot for the join reply.
    pub async fn add_participant(
        &self,
        session_id: &str,
        participant: Participant,
        outbox: Outbox,
    ) -> Result<SessionSnapshot, RegistryError> {
        let handle = self
            .lookup(session_id)
            .await
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        let mut state = handle.state.lock().await;
        if state.status == SessionStatus::Closed {
            return Err(RegistryError::SessionClosed(session_id.to_string()));
        }

        state.idle_since = None;
        let user_id = participant.user_id.clone();
        let rejoin = state.participants.contains_key(&user_id);
        let joined = SessionEvent::ParticipantJoined {
            session_id: session_id.to_string(),
            participant: participant.clone(),
        };
        state.participants.insert(
            user_id.clone(),
            ParticipantEntry {
                info: participant,
                outbox,
            },
        );
        // A socket rebind is not a new arrival; only announce fresh joins.
        if !rejoin {
            state.notify_others(&user_id, &joined);
        }
        debug!(session = %session_id, user = %user_id, rejoin, "participant joined");
        Ok(state.snapshot(session_id))
    }

    /// Remove a roster entry; no-op when the session or entry is absent.
    pub async fn remove_participant(&self, session_id: &str, user_id: &str) {
        let Some(handle) = self.lookup(session_id).await else {
            return;
        };
        let mut state = handle.state.lock().await;
        if state.participants.remove(user_id).is_none() {
            return;
        }
        let left = SessionEvent::ParticipantLeft {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
        };
        state.notify_others(user_id, &left);
        if state.participants.is_empty() && state.status == SessionStatus::Active {
            state.idle_since = Some(Instant::now());
        }
        debug!(session = %session_id, user = %user_id, "participant left");
    }

    /// Append an expert recommendation. Opinions are never merged or
    /// overwritten: every distinct submission persists as its own entry, and
    /// an exact-id repeat is rejected rather than fused with the original.
    /// Returns the stored copy, detached from the caller's value.
    pub async fn add_recommendation(
        &self,
        session_id: &str,
        recommendation: &Recommendation,
    ) -> Result<Recommendation, RegistryError> {
        let handle = self
            .lookup(session_id)
            .await
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
        let mut state = handle.state.lock().await;
        if state.status == SessionStatus::Closed {
            return Err(RegistryError::SessionClosed(session_id.to_string()));
        }
        if !state.recommendation_ids.insert(recommendation.id.clone()) {
            return Err(RegistryError::DuplicateRecommendation {
                session_id: session_id.to_string(),
                id: recommendation.id.clone(),
            });
        }
        let stored = recommendation.clone();
        state.recommendations.push(stored.clone());
        debug!(
            session = %session_id,
            expert = %stored.expert_id,
            recommendation = %stored.id,
            "recommendation recorded"
        );
        Ok(stored)
    }

    /// Read view of a session, or `None` when unknown (or already evicted).
    pub async fn get_session(&self, session_id: &str) -> Option<SessionSnapshot> {
        let handle = self.lookup(session_id).await?;
        let state = handle.state.lock().await;
        Some(state.snapshot(session_id))
    }

    /// Mark a session Closed, detach all participants, and stop its timers.
    /// Idempotent: closing twice (or closing an unknown id) is a no-op.
    pub async fn close_session(&self, session_id: &str) {
        let Some(handle) = self.lookup(session_id).await else {
            return;
        };
        let mut state = handle.state.lock().await;
        if state.status == SessionStatus::Closed {
            return;
        }
        state.status = SessionStatus::Closed;
        state.closed_at = Some(Instant::now());
        // Stops negotiation watchdogs and anything else scoped to the session.
        handle.cancel.cancel();

        let closed = SessionEvent::SessionClosed {
            session_id: session_id.to_string(),
        };
        for entry in state.participants.values() {
            let _ = entry.outbox.try_send(closed.clone());
        }
        state.participants.clear();
        info!(session = %session_id, "session closed");
    }

    /// Whether the session exists and is Active.
    pub async fn is_active(&self, session_id: &str) -> bool {
        match self.lookup(session_id).await {
            Some(handle) => handle.state.lock().await.status == SessionStatus::Active,
            None => false,
        }
    }

    /// Token that fires when the session closes; used to scope per-session
    /// timers. `None` when the session is unknown.
    pub(crate) async fn session_token(&self, session_id: &str) -> Option<CancellationToken> {
        self.lookup(session_id).await.map(|h| h.cancel.clone())
    }

    /// Outbox of a current participant of an Active session.
    pub(crate) async fn participant_outbox(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Option<Outbox> {
        let handle = self.lookup(session_id).await?;
        let state = handle.state.lock().await;
        if state.status != SessionStatus::Active {
            return None;
        }
        state.participants.get(user_id).map(|e| e.outbox.clone())
    }

    /// Summary rows for ops views, oldest first.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let handles: Vec<Arc<SessionHandle>> =
                shard.read().await.values().cloned().collect();
            for handle in handles {
                let state = handle.state.lock().await;
                out.push(SessionSummary {
                    session_id: handle.session_id.clone(),
                    title: state.title.clone(),
                    status: state.status,
                    participant_count: state.participants.len(),
                    created_at: state.created_at,
                });
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub async fn session_count(&self) -> usize {
        let mut n = 0;
        for shard in &self.shards {
            n += shard.read().await.len();
        }
        n
    }

    /// Spawn the idle-cleanup sweep. Runs until [`Self::shutdown`].
    pub fn spawn_idle_sweep(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => registry.sweep_once().await,
                }
            }
            debug!("idle sweep stopped");
        });
    }

    /// One sweep pass: close Active sessions whose roster has been empty past
    /// the idle threshold, and evict sessions Closed at least as long.
    pub(crate) async fn sweep_once(&self) {
        let idle_timeout = self.config.idle_timeout;
        for shard in &self.shards {
            let handles: Vec<Arc<SessionHandle>> =
                shard.read().await.values().cloned().collect();
            let mut evict = Vec::new();
            for handle in handles {
                // Same lock as add_participant/add_recommendation: a join
                // that lands first clears idle_since and the session survives.
                let mut state = handle.state.lock().await;
                match state.status {
                    SessionStatus::Active => {
                        let expired = state.participants.is_empty()
                            && state
                                .idle_since
                                .is_some_and(|t| t.elapsed() >= idle_timeout);
                        if expired {
                            state.status = SessionStatus::Closed;
                            state.closed_at = Some(Instant::now());
                            handle.cancel.cancel();
                            info!(session = %handle.session_id, "closing idle session");
                        }
                    }
                    SessionStatus::Closed => {
                        if state
                            .closed_at
                            .is_some_and(|t| t.elapsed() >= idle_timeout)
                        {
                            evict.push(handle.session_id.clone());
                        }
                    }
                }
            }
            if !evict.is_empty() {
                let mut shard = shard.write().await;
                for session_id in evict {
                    shard.remove(&session_id);
                    debug!(session = %session_id, "evicted closed session");
                }
            }
        }
    }

    /// Cancel the sweep and every per-session timer. Called at shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
