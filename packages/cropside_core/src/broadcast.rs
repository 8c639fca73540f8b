//! Workspace broadcast engine.
//!
//! Takes a `workspace-update` from one participant, stamps and appends it to
//! the session's authoritative log, then fans the event out to every *other*
//! current participant. Fan-out is per-recipient unicast over each
//! connection's outbox channel: non-blocking, unordered across senders, and
//! best-effort, so a slow or vanished recipient costs exactly one dropped
//! delivery and nothing else. The registry log remains the source of truth;
//! a (re)joining participant catches up from the snapshot, not from replays.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RegistryError;
use crate::models::{SessionEvent, SessionStatus, WorkspaceEvent, WorkspaceEventKind};
use crate::registry::SessionRegistry;

/// Counters for delivery outcomes, in the same shape the server's other
/// metrics use: relaxed atomics plus a serializable snapshot.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    /// Workspace events accepted and appended to a session log.
    pub events_published: AtomicU64,
    /// Individual per-recipient deliveries handed to an outbox.
    pub deliveries_sent: AtomicU64,
    /// Deliveries dropped because a recipient's outbox was full or closed.
    pub deliveries_dropped: AtomicU64,
}

impl DeliveryStats {
    pub fn record_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.deliveries_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            deliveries_sent: self.deliveries_sent.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySnapshot {
    pub events_published: u64,
    pub deliveries_sent: u64,
    pub deliveries_dropped: u64,
}

/// Fan-out engine over the registry's participant outboxes.
pub struct WorkspaceBroadcaster {
    registry: Arc<SessionRegistry>,
    stats: Arc<DeliveryStats>,
}

impl WorkspaceBroadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            stats: Arc::new(DeliveryStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DeliveryStats> {
        self.stats.clone()
    }

    /// Stamp, log, and broadcast one workspace update on behalf of `sender_id`.
    ///
    /// The append and the recipient collection happen under the session lock,
    /// so updates from one sender reach each recipient's outbox in submission
    /// order; the sends themselves happen after the lock is released and
    /// never block on a recipient. The sender is excluded; no self-echo.
    ///
    /// Returns the stamped event as stored in the log.
    pub async fn publish(
        &self,
        session_id: &str,
        sender_id: &str,
        kind: WorkspaceEventKind,
        data: serde_json::Value,
    ) -> Result<WorkspaceEvent, RegistryError> {
        let event = WorkspaceEvent {
            kind,
            user_id: sender_id.to_string(),
            data,
            timestamp: Utc::now(),
        };

        let recipients = {
            let handle = self
                .registry
                .lookup(session_id)
                .await
                .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))?;
            let mut state = handle.state.lock().await;
            if state.status == SessionStatus::Closed {
                return Err(RegistryError::SessionClosed(session_id.to_string()));
            }
            state.workspace_log.push(event.clone());
            state
                .participants
                .values()
                .filter(|e| e.info.user_id != sender_id)
                .map(|e| (e.info.user_id.clone(), e.outbox.clone()))
                .collect::<Vec<_>>()
        };

        self.stats.record_published();
        for (user_id, outbox) in recipients {
            let delivery = SessionEvent::WorkspaceUpdated {
                session_id: session_id.to_string(),
                event: event.clone(),
            };
            match outbox.try_send(delivery) {
                Ok(()) => self.stats.record_sent(),
                Err(e) => {
                    // Not retried, not fatal, and invisible to the other
                    // recipients.
                    self.stats.record_dropped();
                    warn!(
                        session = %session_id,
                        recipient = %user_id,
                        "dropping workspace delivery: {}", e
                    );
                }
            }
        }

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Participant, Role};
    use crate::registry::{Outbox, RegistryConfig};
    use chrono::Utc;
    use tokio::sync::mpsc;

    async fn setup() -> (Arc<SessionRegistry>, WorkspaceBroadcaster) {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
        registry.create_session("s-1", "t", "u-0").await.unwrap();
        let broadcaster = WorkspaceBroadcaster::new(registry.clone());
        (registry, broadcaster)
    }

    async fn join(
        registry: &Arc<SessionRegistry>,
        user_id: &str,
        capacity: usize,
    ) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx): (Outbox, _) = mpsc::channel(capacity);
        registry
            .add_participant(
                "s-1",
                Participant {
                    user_id: user_id.to_string(),
                    socket_id: format!("sock-{user_id}"),
                    role: Role::Expert,
                    joined_at: Utc::now(),
                },
                tx,
            )
            .await
            .unwrap();
        rx
    }

    fn drain_workspace_events(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<WorkspaceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::WorkspaceUpdated { event, .. } = event {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn update_reaches_all_other_participants() {
        let (registry, broadcaster) = setup().await;
        let mut rx_a = join(&registry, "a", 32).await;
        let mut rx_b = join(&registry, "b", 32).await;
        let mut rx_c = join(&registry, "c", 32).await;

        broadcaster
            .publish(
                "s-1",
                "a",
                WorkspaceEventKind::Annotation,
                serde_json::json!({"region": "leaf-3"}),
            )
            .await
            .unwrap();

        assert_eq!(drain_workspace_events(&mut rx_b).len(), 1);
        assert_eq!(drain_workspace_events(&mut rx_c).len(), 1);
        // No self-echo.
        assert!(drain_workspace_events(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn event_is_stamped_with_sender_and_time() {
        let (registry, broadcaster) = setup().await;
        let _rx_a = join(&registry, "a", 32).await;
        let mut rx_b = join(&registry, "b", 32).await;

        let before = Utc::now();
        let stored = broadcaster
            .publish(
                "s-1",
                "a",
                WorkspaceEventKind::Diagnostic,
                serde_json::json!({"note": "check underside"}),
            )
            .await
            .unwrap();

        assert_eq!(stored.user_id, "a");
        assert!(stored.timestamp >= before);

        let received = drain_workspace_events(&mut rx_b);
        assert_eq!(received[0].user_id, "a");
        assert_eq!(received[0].data["note"], "check underside");
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved_per_recipient() {
        let (registry, broadcaster) = setup().await;
        let _rx_a = join(&registry, "a", 64).await;
        let mut rx_b = join(&registry, "b", 64).await;

        for i in 0..10 {
            broadcaster
                .publish(
                    "s-1",
                    "a",
                    WorkspaceEventKind::Annotation,
                    serde_json::json!({"seq": i}),
                )
                .await
                .unwrap();
        }

        let events = drain_workspace_events(&mut rx_b);
        assert_eq!(events.len(), 10);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.data["seq"], i as u64);
        }
    }

    #[tokio::test]
    async fn full_recipient_is_dropped_without_stalling_others() {
        let (registry, broadcaster) = setup().await;
        let _rx_a = join(&registry, "a", 32).await;
        // b's outbox holds a single event and is never drained.
        let mut rx_b = join(&registry, "b", 1).await;
        let mut rx_c = join(&registry, "c", 32).await;
        // Clear c's join notification so b's single slot is free.
        let _ = rx_b.try_recv();

        for i in 0..5 {
            broadcaster
                .publish(
                    "s-1",
                    "a",
                    WorkspaceEventKind::Annotation,
                    serde_json::json!({"seq": i}),
                )
                .await
                .unwrap();
        }

        // c got everything even though b was saturated after one event.
        assert_eq!(drain_workspace_events(&mut rx_c).len(), 5);
        assert_eq!(drain_workspace_events(&mut rx_b).len(), 1);

        let stats = broadcaster.stats().snapshot();
        assert_eq!(stats.events_published, 5);
        assert_eq!(stats.deliveries_dropped, 4);
    }

    #[tokio::test]
    async fn log_is_authoritative_for_late_joiners() {
        let (registry, broadcaster) = setup().await;
        let _rx_a = join(&registry, "a", 32).await;

        broadcaster
            .publish(
                "s-1",
                "a",
                WorkspaceEventKind::Image,
                serde_json::json!({"url": "plot-7.jpg"}),
            )
            .await
            .unwrap();

        // b joins after the fact: no replayed event, but the snapshot has it.
        let (tx, mut rx_b) = mpsc::channel(32);
        let snapshot = registry
            .add_participant(
                "s-1",
                Participant {
                    user_id: "b".into(),
                    socket_id: "sock-b".into(),
                    role: Role::Observer,
                    joined_at: Utc::now(),
                },
                tx,
            )
            .await
            .unwrap();

        assert_eq!(snapshot.workspace_log.len(), 1);
        assert_eq!(snapshot.workspace_log[0].data["url"], "plot-7.jpg");
        assert!(drain_workspace_events(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn publish_to_closed_session_fails() {
        let (registry, broadcaster) = setup().await;
        registry.close_session("s-1").await;

        let err = broadcaster
            .publish("s-1", "a", WorkspaceEventKind::Annotation, serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::SessionClosed("s-1".into()));
    }

    #[tokio::test]
    async fn publish_to_unknown_session_fails() {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
        let broadcaster = WorkspaceBroadcaster::new(registry);
        let err = broadcaster
            .publish("nope", "a", WorkspaceEventKind::Annotation, serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::SessionNotFound("nope".into()));
    }
}
