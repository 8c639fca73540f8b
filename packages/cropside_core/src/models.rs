//! Shared data model for diagnosis sessions.
//!
//! These are the types that cross the registry/broadcast/signaling seams and
//! the wire: session snapshots handed to joining clients, roster entries,
//! expert recommendations, and workspace events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signaling::{FallbackOption, SignalPayload};

/// Lifecycle state of a session. A session transitions Active → Closed
/// exactly once and never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// Role a participant holds within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Opened the session (the field agronomist, usually).
    Creator,
    /// May record recommendations and annotate the workspace.
    Expert,
    /// Read-only presence in the workspace.
    Observer,
}

/// Roster entry, keyed by `user_id` within a session. Re-joining with the
/// same `user_id` rebinds the socket instead of duplicating the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub socket_id: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

/// An expert's diagnostic opinion. Immutable once recorded: the registry
/// appends and never merges or overwrites, even when the same expert submits
/// a conflicting diagnosis later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// Caller-supplied unique id; exact repeats are rejected.
    pub id: String,
    pub expert_id: String,
    pub title: String,
    pub description: String,
    /// Expert's confidence in the diagnosis, 0.0..=1.0.
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceEventKind {
    Annotation,
    Diagnostic,
    Image,
    Recommendation,
}

/// A timestamped, attributed update to the shared workspace, broadcast to
/// every *other* current participant at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceEvent {
    pub kind: WorkspaceEventKind,
    pub user_id: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Read view of a session. Handed to joining clients so a (re)join always
/// carries the full current state, not just future events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub title: String,
    pub creator_id: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub participants: Vec<Participant>,
    pub recommendations: Vec<Recommendation>,
    pub workspace_log: Vec<WorkspaceEvent>,
}

/// Summary row for ops views (`/health`, session listings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub title: String,
    pub status: SessionStatus,
    pub participant_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Events pushed into a participant's per-connection outbox.
///
/// Delivery is best-effort unicast: a full or closed outbox drops that one
/// delivery without affecting other recipients or the authoritative logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    WorkspaceUpdated {
        session_id: String,
        event: WorkspaceEvent,
    },
    ParticipantJoined {
        session_id: String,
        participant: Participant,
    },
    ParticipantLeft {
        session_id: String,
        user_id: String,
    },
    SessionClosed {
        session_id: String,
    },
    Offer {
        session_id: String,
        from: String,
        payload: SignalPayload,
    },
    Answer {
        session_id: String,
        from: String,
        payload: SignalPayload,
    },
    IceCandidate {
        session_id: String,
        from: String,
        payload: SignalPayload,
    },
    /// Negotiation could not reach Connected; the listed fallbacks are
    /// available to the client.
    FallbackAdvised {
        session_id: String,
        peer: String,
        options: Vec<FallbackOption>,
        reason: String,
    },
}
